//! Baseline-JIT stencil boundary. This module reproduces the shape of the
//! trait tables a machine-code-emitting backend hands back to the rest of
//! the runtime; it does not itself assemble or emit machine code. The field
//! layout and ordering are fixed: both are part of a compiled runtime's
//! ABI, consumed by generated code that addresses these fields by offset.

use serde::Serialize;
use target_lexicon::Triple;

/// Per-opcode trait record handed to the runtime so it can size and place a
/// baseline-JIT compilation of one bytecode instruction. Kept to exactly 16
/// bytes (a power of two) so addressing into an array of these is cheap: a
/// multiply-free shift, not an integer multiply, computes an entry's
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BytecodeBaselineJitTraits {
    pub fast_path_code_len: u16,
    pub slow_path_code_len: u16,
    pub data_section_code_len: u16,
    pub data_section_alignment: u16,
    pub num_cond_br_late_patches: u16,
    pub slow_path_data_len: u16,
    pub bytecode_length: u16,
    pub unused: u16,
}

impl BytecodeBaselineJitTraits {
    pub const SIZE_BYTES: usize = 16;

    pub const fn empty() -> Self {
        BytecodeBaselineJitTraits {
            fast_path_code_len: 0,
            slow_path_code_len: 0,
            data_section_code_len: 0,
            data_section_alignment: 0,
            num_cond_br_late_patches: 0,
            slow_path_data_len: 0,
            bytecode_length: 0,
            unused: 0,
        }
    }
}

/// The max data-section alignment a baseline-JIT allocator guarantees;
/// a trait record requesting more would be asking for memory the allocator
/// (an external collaborator) cannot promise.
pub const MAX_DATA_SECTION_ALIGNMENT: u16 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CondBranchLatePatchKind {
    /// `*(u32*)ptr += dst_addr`
    Int32,
    /// two u32 words: destination address, then destination bytecode ordinal
    SlowPathData,
    /// `*(u64*)ptr += dst_addr`
    Int64,
}

/// One late-patch record: a conditional branch whose target is only known
/// once the whole baseline-JIT translation unit has been placed in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CondBranchLatePatch {
    pub patch_offset: u32,
    pub dst_bytecode_ptr_low32: u32,
    pub kind: CondBranchLatePatchKind,
}

impl CondBranchLatePatch {
    /// Applies this patch given the now-known final JIT address and
    /// destination bytecode ordinal, returning the bytes to splice in at
    /// `patch_offset` within the code buffer.
    pub fn compute_patch_bytes(&self, jit_addr: u64, bytecode_ord: u32) -> Vec<u8> {
        match self.kind {
            CondBranchLatePatchKind::Int32 => (jit_addr as u32).to_le_bytes().to_vec(),
            CondBranchLatePatchKind::SlowPathData => {
                let mut out = (jit_addr as u32).to_le_bytes().to_vec();
                out.extend_from_slice(&bytecode_ord.to_le_bytes());
                out
            }
            CondBranchLatePatchKind::Int64 => jit_addr.to_le_bytes().to_vec(),
        }
    }
}

/// One entry of the table describing, per call-inline-cache site, which
/// effect-kind dispatcher to invoke and how large its generated stub is.
#[derive(Debug, Clone, Serialize)]
pub struct CallIcTraitEntry {
    pub site_name: String,
    pub effect_kind: String,
    pub stub_code_len: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallIcTraitTable {
    pub entries: Vec<CallIcTraitEntry>,
}

impl CallIcTraitTable {
    pub fn new() -> Self {
        CallIcTraitTable { entries: Vec::new() }
    }

    pub fn push(&mut self, entry: CallIcTraitEntry) {
        self.entries.push(entry);
    }

    /// Entries in deterministic order: by site name, then effect kind.
    pub fn sorted(&self) -> Vec<CallIcTraitEntry> {
        let mut v = self.entries.clone();
        v.sort_by(|a, b| (a.site_name.as_str(), a.effect_kind.as_str()).cmp(&(b.site_name.as_str(), b.effect_kind.as_str())));
        v
    }
}

impl Default for CallIcTraitTable {
    fn default() -> Self {
        CallIcTraitTable::new()
    }
}

/// The hand-off contract to an actual machine-code-emitting backend. This
/// crate implements none of it; it exists so the rest of the pipeline can
/// be written against a stable boundary type instead of a concrete backend.
pub trait StencilBackend {
    fn target(&self) -> &Triple;
    fn emit_trait_record(&self, bytecode_name: &str) -> BytecodeBaselineJitTraits;
}
