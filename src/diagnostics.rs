//! Error taxonomy for the lowering pipeline. Every stage gets its own
//! `thiserror` enum; `PipelineError` aggregates them for the single
//! top-level entry point in `pipeline.rs`. There is no "recoverable"
//! variant anywhere: a construction failure at any stage means the input
//! module violated a precondition that stage requires, and the caller is
//! expected to report it and stop.

use std::io::{self, Write as _};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("function `{0}` has no terminator in its entry block")]
    MissingTerminator(String),
    #[error("MakeCall continuation `{0}` does not exist in the module")]
    DanglingContinuation(String),
    #[error("EnterSlowPath target `{0}` does not exist in the module")]
    DanglingSlowPathTarget(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("function `{0}` was requested for cloning but is not defined in the source module")]
    UnknownFunction(String),
    #[error("name `{0}` collides with a pre-existing symbol during `_impl` renaming")]
    RenameCollision(String),
    #[error("function `{0}` must have internal linkage before being cloned into a component")]
    EntryNotInternal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum OptimizeError {
    #[error("pass `{pass}` produced a function with a dangling register reference `{reg}`")]
    DanglingRegister { pass: String, reg: String },
}

#[derive(Debug, thiserror::Error)]
pub enum IcLoweringError {
    #[error("inline cache site `{0}` has no registered effect kinds")]
    NoEffectKinds(String),
    #[error("inline cache site `{0}` mixes incompatible effect kinds that cannot be fused")]
    IncompatibleFusion(String),
    #[error("variant `{0}` declares a fused inline cache together with quickening; the two are mutually exclusive")]
    FusedIcWithQuickening(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata struct `{0}` requests alignment {1} exceeding the configured maximum {2}")]
    AlignmentExceeded(String, u32, u32),
    #[error("metadata offset for `{0}` overflowed the 32-bit offset field")]
    OffsetOverflow(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WrapperError {
    #[error("variant `{0}` declares more operands than fit in the dispatch ABI's argument slots")]
    TooManyOperands(String),
    #[error("quickening slow path for `{0}` ran out of {1:?} registers to re-materialize operands into")]
    RegisterPoolExhausted(String, crate::wrapper::RegisterBank),
}

#[derive(Debug, thiserror::Error)]
pub enum LoweringError {
    #[error("meta-API call `{0}` appears in a component where it is not legal (disallowed kind: {1})")]
    IllegalMetaApiUse(String, String),
    #[error("function `{0}` still contains a `MetadataPtr` placeholder after final lowering")]
    UnresolvedMetadataPtr(String),
    #[error("function `{0}` still contains an unlowered `{1}` meta-API instruction after final lowering")]
    UnloweredMetaApi(String, String),
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("symbol name `{0}` is already reserved")]
    NameCollision(String),
    #[error("function `{0}` is reachable from Main but was never linked")]
    UnlinkedReachableFunction(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BuilderGenError {
    #[error("operand `{operand}` of variant `{variant}` has no builder dispatch arm for kind {kind}")]
    MissingDispatchArm {
        variant: String,
        operand: String,
        kind: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Factory(#[from] FactoryError),
    #[error(transparent)]
    Optimize(#[from] OptimizeError),
    #[error(transparent)]
    IcLowering(#[from] IcLoweringError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Wrapper(#[from] WrapperError),
    #[error(transparent)]
    Lowering(#[from] LoweringError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    BuilderGen(#[from] BuilderGenError),
}

/// Render a fatal pipeline error to stderr the way a real driver would,
/// colorized when the terminal supports it. Not used by the library itself
/// (callers decide how to report), but kept here as the canonical renderer
/// since `codespan-reporting`/`termcolor` is how the rest of the corpus does
/// this.
pub fn report_fatal(err: &PipelineError) -> io::Result<()> {
    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    stderr.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true))?;
    write_prefix(&mut stderr)?;
    stderr.reset()?;
    writeln!(&mut stderr, "{}", err)
}

fn write_prefix(w: &mut StandardStream) -> io::Result<()> {
    write!(w, "error: ")
}
