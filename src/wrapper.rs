//! Wrapper synthesis: builds the interpreter dispatch wrapper around each
//! variant's optimized Main component — decodes operands off the dispatch
//! ABI's argument slots, emits the quickening type guards in declaration
//! order, and tail-calls into the `_impl` function.
//!
//! The 16-slot argument ordering (coroutine context, stack base, current
//! bytecode pointer, code block, then decoded operands, then
//! output/cond-branch/metadata slots) and the two-pool GPR-then-FPR
//! re-materialization scheme for quickening slow paths are not stated at
//! algorithm depth anywhere but are needed to make the wrapper concrete;
//! both are carried over unchanged from the reference dispatch convention.

use crate::component::ComponentKind;
use crate::diagnostics::WrapperError;
use crate::ir::{BinOp, Function, FunctionId, Instr, Reg, Terminator, ValueKind};
use crate::typemask::{TypeMask, TypePrimitive};
use crate::variant::{BytecodeVariantDefinition, OperandKind};

/// Fixed leading slots of the interpreter dispatch ABI, present in every
/// wrapper regardless of the variant's own operand list.
pub const DISPATCH_ABI_FIXED_SLOTS: &[&str] = &["coroutineCtx", "stackBase", "curBytecode", "codeBlock"];

/// Total number of argument slots available to a dispatch wrapper.
pub const DISPATCH_ABI_SLOT_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterBank {
    Gpr,
    Fpr,
}

#[derive(Debug, Clone)]
pub struct DispatchAbi {
    pub slots: Vec<String>,
}

impl DispatchAbi {
    pub fn for_variant(def: &BytecodeVariantDefinition) -> Result<DispatchAbi, WrapperError> {
        let mut slots: Vec<String> = DISPATCH_ABI_FIXED_SLOTS.iter().map(|s| s.to_string()).collect();
        for operand in &def.operands {
            slots.push(operand.name.clone());
        }
        if slots.len() > DISPATCH_ABI_SLOT_COUNT {
            return Err(WrapperError::TooManyOperands(def.name.clone()));
        }
        Ok(DispatchAbi { slots })
    }
}

/// A free-register pool used by the quickening slow path to re-materialize
/// already-decoded operands before falling back to the unspecialized
/// handler: integer/pointer values are popped from the GPR pool in reverse
/// declaration order, `tDoubleNotNaN`-speculated values from the FPR pool.
#[derive(Debug, Clone)]
pub struct RegisterPool {
    gpr: Vec<String>,
    fpr: Vec<String>,
}

impl RegisterPool {
    pub fn new(gpr_names: Vec<String>, fpr_names: Vec<String>) -> Self {
        RegisterPool { gpr: gpr_names, fpr: fpr_names }
    }

    pub fn take(&mut self, bank: RegisterBank, variant_name: &str) -> Result<String, WrapperError> {
        let pool = match bank {
            RegisterBank::Gpr => &mut self.gpr,
            RegisterBank::Fpr => &mut self.fpr,
        };
        pool.pop().ok_or_else(|| WrapperError::RegisterPoolExhausted(variant_name.to_string(), bank))
    }
}

/// Which register bank a speculated operand's re-materialization draws
/// from: only a `DoubleNotNaN` speculation uses the FPR pool, matching the
/// reference rule that ordinary (possibly-NaN) doubles stay boxed.
pub fn bank_for_mask(mask: TypeMask) -> RegisterBank {
    if mask.is_singleton() && mask.contains(TypePrimitive::DoubleNotNaN) {
        RegisterBank::Fpr
    } else {
        RegisterBank::Gpr
    }
}

/// One quickening type guard emitted in the wrapper before the type-guarded
/// fast path: `operand` must satisfy `mask` or control falls to the next
/// guard (or, if this is the last guard, the unspecialized slow path).
#[derive(Debug, Clone)]
pub struct TypeGuard {
    pub operand: String,
    pub mask: TypeMask,
}

/// Emit the ordered list of type guards for a variant's quickening list, in
/// declaration order (first-declared quickening is checked first).
pub fn build_guards(def: &BytecodeVariantDefinition) -> Vec<Vec<TypeGuard>> {
    def.quickenings
        .iter()
        .map(|q| {
            q.speculated
                .iter()
                .map(|(operand, mask)| TypeGuard { operand: operand.clone(), mask: *mask })
                .collect()
        })
        .collect()
}

/// Decode operand offsets for a variant, in declaration order, honoring
/// each operand's byte width. Slot/Constant/Literal operands occupy a fixed
/// width; range operands are not decoded here (the wrapper passes their
/// base pointer straight through).
pub fn operand_offsets(def: &BytecodeVariantDefinition) -> Vec<(String, u32)> {
    let mut offset = 0u32;
    let mut out = Vec::new();
    for operand in &def.operands {
        out.push((operand.name.clone(), offset));
        match operand.kind {
            OperandKind::BytecodeRangeRO | OperandKind::BytecodeRangeRW => {}
            _ => offset += operand.width.unwrap_or(0),
        }
    }
    out
}

/// The synthesized interpreter dispatch wrapper for one component.
#[derive(Debug)]
pub struct WrapperBuild {
    pub function: Function,
}

/// Which register bank a variant's first quickening re-materializes
/// `operand` into, if that quickening speculates on it at all.
fn quickening_operand_bank(def: &BytecodeVariantDefinition, operand: &str) -> Option<RegisterBank> {
    def.quickenings
        .first()?
        .speculated
        .iter()
        .find(|(name, _)| name == operand)
        .map(|(_, mask)| bank_for_mask(*mask))
}

/// Builds the dispatch-shape wrapper (§4.6) for one component: binds the
/// fixed ABI slots, decodes (or, for a `QuickeningSlowPath`, re-materializes)
/// the variant's operands, optionally emits the quickening guard chain
/// ahead of the fast path, and tail-calls into `impl_entry` (or, on a failed
/// guard, `quickening_slow_path_entry`). The wrapper never falls through:
/// every path out of it ends in a `TailCallImpl` followed by
/// `Terminator::Unreachable`.
pub fn synthesize_wrapper(
    name: impl Into<FunctionId>,
    def: &BytecodeVariantDefinition,
    kind: ComponentKind,
    impl_entry: &FunctionId,
    quickening_slow_path_entry: Option<&FunctionId>,
) -> Result<WrapperBuild, WrapperError> {
    DispatchAbi::for_variant(def)?;

    let mut function = Function::new(name);
    let coroutine_ctx = function.alloc_reg(ValueKind::Pointer);
    let stack_base = function.alloc_reg(ValueKind::Pointer);
    let cur_bytecode = function.alloc_reg(ValueKind::Pointer);
    let code_block = function.alloc_reg(ValueKind::Pointer);
    function.params = vec![coroutine_ctx, stack_base, cur_bytecode, code_block];

    let entry = function.entry;
    let mut args: Vec<Reg> = Vec::new();
    if matches!(kind, ComponentKind::QuickeningSlowPath) {
        let mut pool = RegisterPool::new(
            (0..def.operands.len()).map(|i| format!("gpr{i}")).collect(),
            (0..def.operands.len()).map(|i| format!("fpr{i}")).collect(),
        );
        for operand in &def.operands {
            let bank = quickening_operand_bank(def, &operand.name).unwrap_or(RegisterBank::Gpr);
            pool.take(bank, &def.name)?;
            let reg = function.alloc_reg(ValueKind::Tagged);
            function.params.push(reg);
            args.push(reg);
        }
    } else {
        for (_operand_name, offset) in operand_offsets(def) {
            let dst = function.alloc_reg(ValueKind::Tagged);
            function.block_mut(entry).unwrap().instrs.push(Instr::Load {
                dst,
                addr: cur_bytecode,
                offset: offset as i32,
            });
            args.push(dst);
        }
    }

    let emit_guard = matches!(kind, ComponentKind::Main | ComponentKind::FusedInInlineCacheEffect)
        && def.has_quickening()
        && quickening_slow_path_entry.is_some();

    if !emit_guard {
        function
            .block_mut(entry)
            .unwrap()
            .instrs
            .push(Instr::TailCallImpl { callee: impl_entry.clone(), args });
        function.block_mut(entry).unwrap().terminator = Terminator::Unreachable;
        return Ok(WrapperBuild { function });
    }

    let guards = &build_guards(def)[0];
    if guards.is_empty() {
        function
            .block_mut(entry)
            .unwrap()
            .instrs
            .push(Instr::TailCallImpl { callee: impl_entry.clone(), args });
        function.block_mut(entry).unwrap().terminator = Terminator::Unreachable;
        return Ok(WrapperBuild { function });
    }

    let mut combined: Option<Reg> = None;
    for guard in guards {
        let operand_index = def
            .operands
            .iter()
            .position(|o| o.name == guard.operand)
            .expect("a quickening may only speculate on one of the variant's own operands");
        let operand_reg = args[operand_index];
        let check = function.alloc_reg(ValueKind::Boolean);
        function.block_mut(entry).unwrap().instrs.push(Instr::TypeCheck {
            dst: check,
            value: operand_reg,
            mask: guard.mask,
        });
        combined = Some(match combined {
            None => check,
            Some(prev) => {
                let merged = function.alloc_reg(ValueKind::Boolean);
                function.block_mut(entry).unwrap().instrs.push(Instr::Binary {
                    dst: merged,
                    op: BinOp::And,
                    lhs: prev,
                    rhs: check,
                });
                merged
            }
        });
    }
    let cond = combined.expect("guards is non-empty, so at least one TypeCheck ran above");

    let fast = function.add_block();
    let slow = function.add_block();
    function.block_mut(entry).unwrap().terminator = Terminator::Branch { cond, then_block: fast, else_block: slow };
    function
        .block_mut(fast)
        .unwrap()
        .instrs
        .push(Instr::TailCallImpl { callee: impl_entry.clone(), args: args.clone() });
    function.block_mut(fast).unwrap().terminator = Terminator::Unreachable;
    function.block_mut(slow).unwrap().instrs.push(Instr::TailCallImpl {
        callee: quickening_slow_path_entry.expect("emit_guard checked this is Some").clone(),
        args,
    });
    function.block_mut(slow).unwrap().terminator = Terminator::Unreachable;

    Ok(WrapperBuild { function })
}
