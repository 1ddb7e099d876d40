//! Bytecode variant definitions: the operand shapes, quickening
//! specializations, and metadata struct layout that a single opcode
//! contributes to the pipeline as input.

use crate::typemask::TypeMask;
use rustc_hash::FxHashMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperandKind {
    /// A stack slot index, decoded at dispatch time.
    Slot,
    /// An index into the current function's constant table.
    Constant,
    /// A range of consecutive stack slots, read-only to the handler.
    BytecodeRangeRO,
    /// A range of consecutive stack slots, read-write to the handler.
    BytecodeRangeRW,
    /// An immediate literal encoded directly in the bytecode struct.
    Literal,
    /// A literal specialized per-variant at quickening time (its concrete
    /// value becomes part of the variant's identity).
    SpecializedLiteral,
}

#[derive(Debug, Clone, Serialize)]
pub struct Operand {
    pub name: String,
    pub kind: OperandKind,
    /// Byte width of this operand's encoding within the bytecode struct.
    /// Present for every kind except `BytecodeRangeRO`/`BytecodeRangeRW`,
    /// whose width is carried by a paired length operand instead.
    pub width: Option<u32>,
}

/// A quickening specialization: one or more operands are speculated to a
/// narrower `TypeMask`, producing a distinct fast-path variant plus an
/// implicit slow path that falls back to the unspecialized handler.
#[derive(Debug, Clone, Serialize)]
pub struct Quickening {
    pub name: String,
    pub speculated: Vec<(String, TypeMask)>,
}

/// Declares that two operand lists (e.g. across quickening variants of the
/// same base opcode) must always encode to the same byte length, so the
/// interpreter dispatch table can share a single decode offset table.
#[derive(Debug, Clone, Serialize)]
pub struct SameLengthConstraint {
    pub variant_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetadataPlacement {
    /// The metadata struct is inlined directly after the bytecode struct.
    Inlined,
    /// The metadata struct lives out-of-line; the bytecode struct carries a
    /// 32-bit offset to it.
    OutOfLine,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataStructLayout {
    pub placement: MetadataPlacement,
    pub size: u32,
    pub alignment: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BytecodeVariantDefinition {
    pub name: String,
    pub operands: Vec<Operand>,
    pub quickenings: Vec<Quickening>,
    pub metadata: Option<MetadataStructLayout>,
    pub same_length_constraints: Vec<SameLengthConstraint>,
    /// The name of this variant's fused inline-cache site, if it has one.
    /// `FuseICIntoInterpreterOpcode` and `quickenings` are mutually
    /// exclusive; callers enforce that at construction time via
    /// `with_fused_ic_site`.
    pub fused_ic_site: Option<String>,
}

impl BytecodeVariantDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        BytecodeVariantDefinition {
            name: name.into(),
            operands: Vec::new(),
            quickenings: Vec::new(),
            metadata: None,
            same_length_constraints: Vec::new(),
            fused_ic_site: None,
        }
    }

    pub fn with_operand(mut self, name: impl Into<String>, kind: OperandKind, width: Option<u32>) -> Self {
        self.operands.push(Operand { name: name.into(), kind, width });
        self
    }

    pub fn with_quickening(mut self, q: Quickening) -> Self {
        self.quickenings.push(q);
        self
    }

    pub fn with_fused_ic_site(mut self, site: impl Into<String>) -> Self {
        self.fused_ic_site = Some(site.into());
        self
    }

    pub fn has_quickening(&self) -> bool {
        !self.quickenings.is_empty()
    }

    /// The ordinal count a wrapper/builder must generate entries for: the
    /// base variant plus one per quickening.
    pub fn variant_count(&self) -> usize {
        1 + self.quickenings.len()
    }

    /// Total byte width of the fixed-size (non-range) operand encodings.
    pub fn fixed_operand_width(&self) -> u32 {
        self.operands
            .iter()
            .filter(|o| !matches!(o.kind, OperandKind::BytecodeRangeRO | OperandKind::BytecodeRangeRW))
            .filter_map(|o| o.width)
            .sum()
    }

    /// Tentative encoded bytecode-struct length: the opcode field plus every
    /// fixed-width operand, before same-length-constraint equalization.
    pub fn tentative_length(&self, opcode_width: u32) -> u32 {
        opcode_width + self.fixed_operand_width()
    }
}

/// Equalizes tentative lengths across every `SameLengthConstraint` group:
/// each member's final length becomes the maximum tentative length observed
/// among the group (a member absent from `tentative` is skipped). Variants
/// that participate in no constraint keep their own tentative length.
pub fn finalize_same_length_constraints(
    tentative: &FxHashMap<String, u32>,
    constraints: &[SameLengthConstraint],
) -> FxHashMap<String, u32> {
    let mut result = tentative.clone();
    for constraint in constraints {
        let max = constraint
            .variant_names
            .iter()
            .filter_map(|n| tentative.get(n))
            .copied()
            .max()
            .unwrap_or(0);
        for name in &constraint.variant_names {
            if let Some(entry) = result.get_mut(name) {
                *entry = (*entry).max(max);
            }
        }
    }
    result
}
