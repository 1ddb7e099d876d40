//! Build-time knobs threaded explicitly through the pipeline rather than
//! baked in as compile-time constants.

/// Width in bytes of an opcode field within a bytecode struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpcodeWidth {
    One,
    Two,
    Four,
    Eight,
}

impl OpcodeWidth {
    pub fn bytes(self) -> u32 {
        match self {
            OpcodeWidth::One => 1,
            OpcodeWidth::Two => 2,
            OpcodeWidth::Four => 4,
            OpcodeWidth::Eight => 8,
        }
    }
}

/// Width of a native pointer on the target the baseline JIT stencils are
/// built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerWidth {
    ThirtyTwo,
    SixtyFour,
}

impl PointerWidth {
    pub fn bytes(self) -> u32 {
        match self {
            PointerWidth::ThirtyTwo => 4,
            PointerWidth::SixtyFour => 8,
        }
    }
}

/// Configuration shared by every stage of the lowering pipeline.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub opcode_width: OpcodeWidth,
    pub pointer_width: PointerWidth,
    /// Max alignment a metadata struct may request; requests above this are
    /// a layout violation (see `MetadataError::AlignmentExceeded`).
    pub max_metadata_alignment: u32,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            opcode_width: OpcodeWidth::Two,
            pointer_width: PointerWidth::SixtyFour,
            max_metadata_alignment: 16,
        }
    }
}
