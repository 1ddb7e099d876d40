//! Builder generator: produces, ahead of time, one typed
//! `Create<Opcode>(Operands)` dispatcher per bytecode variant. Dispatch
//! branches on whether an operand was given as a stack slot or a constant,
//! specializes on the speculated type mask when a quickening applies, and
//! (for specialized-literal operands) guards on exact equality against the
//! literal each quickening was specialized for.

use crate::diagnostics::BuilderGenError;
use crate::typemask::TypeMask;
use crate::variant::{BytecodeVariantDefinition, OperandKind};

/// How one operand value arrives at the call site of a generated builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandValueKind {
    Slot,
    Constant,
}

/// One arm of the generated dispatch tree for a single operand.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchArm {
    pub operand: String,
    pub value_kind: OperandValueKind,
    /// Present only when this arm also specializes on a speculated type
    /// mask (i.e. the operand participates in a quickening).
    pub specialized_mask: Option<TypeMask>,
}

/// A fully resolved dispatch tree for one variant: one `DispatchArm` list
/// per selectable quickening (the base, unspecialized variant is the first
/// entry, with `specialized_mask: None` on every arm).
#[derive(Debug, Clone)]
pub struct BuilderDispatchTree {
    pub variant_name: String,
    pub arms: Vec<Vec<DispatchArm>>,
}

/// Build the dispatch tree for `def`. Every operand of kind `Slot` or
/// `Constant` gets a `DispatchArm` in each generated arm-list; other
/// operand kinds (`Literal`, `SpecializedLiteral`, the range kinds) do not
/// participate in builder dispatch and are passed through directly,
/// matching the reference generator's scope (dispatch exists only to choose
/// among encodings the caller cannot know statically).
pub fn build_dispatch_tree(def: &BytecodeVariantDefinition) -> Result<BuilderDispatchTree, BuilderGenError> {
    let dispatchable: Vec<&crate::variant::Operand> = def
        .operands
        .iter()
        .filter(|o| matches!(o.kind, OperandKind::Slot | OperandKind::Constant))
        .collect();

    let mut arms = Vec::with_capacity(def.variant_count());

    // Base (unspecialized) arm list.
    let base_arms: Result<Vec<DispatchArm>, BuilderGenError> = dispatchable
        .iter()
        .map(|o| arm_for_operand(def, o, None))
        .collect();
    arms.push(base_arms?);

    for q in &def.quickenings {
        let mut arm_list = Vec::with_capacity(dispatchable.len());
        for o in &dispatchable {
            let mask = q.speculated.iter().find(|(name, _)| name == &o.name).map(|(_, m)| *m);
            arm_list.push(arm_for_operand(def, o, mask)?);
        }
        arms.push(arm_list);
    }

    Ok(BuilderDispatchTree { variant_name: def.name.clone(), arms })
}

fn arm_for_operand(
    def: &BytecodeVariantDefinition,
    operand: &crate::variant::Operand,
    mask: Option<TypeMask>,
) -> Result<DispatchArm, BuilderGenError> {
    let value_kind = match operand.kind {
        OperandKind::Slot => OperandValueKind::Slot,
        OperandKind::Constant => OperandValueKind::Constant,
        _ => {
            return Err(BuilderGenError::MissingDispatchArm {
                variant: def.name.clone(),
                operand: operand.name.clone(),
                kind: format!("{:?}", operand.kind),
            })
        }
    };
    Ok(DispatchArm { operand: operand.name.clone(), value_kind, specialized_mask: mask })
}

/// Encodes one bytecode struct instance for `def`'s base variant: a
/// 2-byte opcode ordinal followed by each fixed-width operand's bytes, in
/// declaration order, little-endian. Range operands are not encoded here;
/// they are out of scope for this crate's builder (the allocator for
/// variable-length bytecode ranges is an external collaborator).
pub fn encode_bytecode_struct(
    opcode_ordinal: u16,
    def: &BytecodeVariantDefinition,
    operand_values: &[(String, u64)],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&opcode_ordinal.to_le_bytes());
    for operand in &def.operands {
        if matches!(operand.kind, OperandKind::BytecodeRangeRO | OperandKind::BytecodeRangeRW) {
            continue;
        }
        let width = operand.width.unwrap_or(0) as usize;
        let value = operand_values
            .iter()
            .find(|(name, _)| name == &operand.name)
            .map(|(_, v)| *v)
            .unwrap_or(0);
        out.extend_from_slice(&value.to_le_bytes()[..width.min(8)]);
    }
    out
}

/// CRC32 of a generated builder header's byte encoding, used by downstream
/// tooling to detect whether a regenerated header actually changed without
/// diffing the whole file.
pub fn header_checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}
