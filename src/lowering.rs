//! Final lowering: the last ordered pass sequence applied to every
//! component before link & prune. Resolves the remaining meta-API
//! placeholders (`MetadataPtr`, `GetBytecodePtrInternal`) into concrete
//! loads, normalizes linkage (every function not the component's own entry
//! goes back to internal), and runs a peephole cleanup pass.

use crate::diagnostics::LoweringError;
use crate::ir::{Function, FunctionId, Instr, Linkage, Terminator, ValueKind};
use rustc_hash::FxHashMap;

/// Resolves `MetadataPtr` placeholders into a `Load` from the bytecode
/// struct's fixed metadata-pointer slot at `metadata_ptr_offset`. After this
/// runs, no `MetadataPtr` instruction may remain: any not dominated by a
/// `curBytecode`-derived base register is a genuine lowering bug, not a
/// recoverable condition, so one escaping to the final check below is
/// reported as `UnresolvedMetadataPtr`.
pub fn resolve_metadata_ptrs(func: &mut Function, bytecode_base: crate::ir::Reg, metadata_ptr_offset: i32) {
    for block in &mut func.blocks {
        for instr in &mut block.instrs {
            if let Instr::MetadataPtr { dst } = instr {
                let dst = *dst;
                *instr = Instr::Load { dst, addr: bytecode_base, offset: metadata_ptr_offset };
            }
        }
    }
}

/// Resolves `GetBytecodePtrInternal` into a `Move` from the ABI's
/// `curBytecode` register, which by the time this runs is just another
/// named register in the function.
pub fn resolve_bytecode_ptr(func: &mut Function, cur_bytecode: crate::ir::Reg) {
    for block in &mut func.blocks {
        for instr in &mut block.instrs {
            if let Instr::GetBytecodePtrInternal { dst } = instr {
                let dst = *dst;
                *instr = Instr::Move { dst, src: cur_bytecode };
            }
        }
    }
}

/// Rewrites `MakeCall` continuation and `EnterSlowPath` target references
/// from their pre-merge discovery names to the names `link::merge_components`
/// will give those components, so the concrete tail-call instructions final
/// lowering produces from them resolve against symbols that actually exist
/// in the linked module.
pub fn rewrite_meta_api_targets(func: &mut Function, final_names: &FxHashMap<FunctionId, FunctionId>) {
    for block in &mut func.blocks {
        for instr in &mut block.instrs {
            match instr {
                Instr::MakeCall { cont, .. } => {
                    if let Some(renamed) = final_names.get(cont) {
                        *cont = renamed.clone();
                    }
                }
                Instr::EnterSlowPath { target, .. } => {
                    if let Some(renamed) = final_names.get(target) {
                        *target = renamed.clone();
                    }
                }
                _ => {}
            }
        }
    }
}

/// Lowers `Return` out of the instruction stream and into the block's own
/// terminator: a bytecode handler's return is control flow, not a call.
pub fn lower_return(func: &mut Function) {
    for block in &mut func.blocks {
        if let Some(pos) = block.instrs.iter().position(|i| matches!(i, Instr::Return { .. })) {
            if let Instr::Return { value } = block.instrs.remove(pos) {
                block.terminator = Terminator::Return(value);
            }
        }
    }
}

/// Lowers `MakeCall` into a concrete call to its (still dynamic) callee
/// followed by a tail dispatch into its continuation, passing the call's
/// result positionally. `MakeCall` always terminates its block (control
/// never falls through to an instruction coded after it), so truncating the
/// block at the call site is safe.
pub fn lower_make_call(func: &mut Function) {
    for block in &mut func.blocks {
        if let Some(pos) = block.instrs.iter().position(|i| matches!(i, Instr::MakeCall { .. })) {
            let removed = block.instrs[pos].clone();
            if let Instr::MakeCall { dst, callee, args, cont } = removed {
                block.instrs.truncate(pos);
                block.instrs.push(Instr::Call { dst, callee, args });
                block.instrs.push(Instr::TailCallImpl { callee: cont, args: vec![dst] });
                block.terminator = Terminator::Unreachable;
            }
        }
    }
}

/// Lowers `ReturnValueAccessor` into a read of a fresh register bound as a
/// continuation-function parameter: the call result a `MakeCall` passes
/// along arrives via calling convention, the same way the wrapper's fixed
/// ABI slots do, so no instruction is needed to produce it, only one to name
/// it locally.
pub fn lower_return_value_accessor(func: &mut Function) {
    let mut positions: Vec<(usize, usize, crate::ir::Reg)> = Vec::new();
    for (bi, block) in func.blocks.iter().enumerate() {
        for (ii, instr) in block.instrs.iter().enumerate() {
            if let Instr::ReturnValueAccessor { dst } = instr {
                positions.push((bi, ii, *dst));
            }
        }
    }
    for (bi, ii, dst) in positions {
        let incoming = func.alloc_reg(ValueKind::Tagged);
        func.params.push(incoming);
        func.blocks[bi].instrs[ii] = Instr::Move { dst, src: incoming };
    }
}

/// Lowers `ThrowError` into a tail call to the runtime's error-raising
/// entry point, which never returns.
pub fn lower_throw_error(func: &mut Function) {
    for block in &mut func.blocks {
        if let Some(pos) = block.instrs.iter().position(|i| matches!(i, Instr::ThrowError { .. })) {
            if let Instr::ThrowError { error } = block.instrs.remove(pos) {
                block.instrs.push(Instr::TailCallImpl {
                    callee: "__deegen_throw_error".into(),
                    args: vec![error],
                });
                block.terminator = Terminator::Unreachable;
            }
        }
    }
}

/// Lowers the remaining pointer placeholders, `MetadataPtr` and
/// `GetBytecodePtrInternal`, by composing `resolve_metadata_ptrs` and
/// `resolve_bytecode_ptr` against one freshly allocated local register that
/// stands in for the dispatch ABI's `curBytecode` slot. Does nothing if
/// neither placeholder appears in `func`, so functions with no metadata or
/// bytecode-pointer use (most `ReturnContinuation`/`SlowPath` bodies) gain no
/// dead register.
pub fn lower_meta_api_placeholders(func: &mut Function, metadata_ptr_offset: Option<i32>) {
    let needs_bytecode_ptr = func
        .blocks
        .iter()
        .any(|b| b.instrs.iter().any(|i| matches!(i, Instr::GetBytecodePtrInternal { .. })));
    let needs_metadata_ptr =
        func.blocks.iter().any(|b| b.instrs.iter().any(|i| matches!(i, Instr::MetadataPtr { .. })));
    if !needs_bytecode_ptr && !needs_metadata_ptr {
        return;
    }
    let cur_bytecode = func.alloc_reg(ValueKind::Pointer);
    if needs_bytecode_ptr {
        resolve_bytecode_ptr(func, cur_bytecode);
    }
    if needs_metadata_ptr {
        resolve_metadata_ptrs(func, cur_bytecode, metadata_ptr_offset.unwrap_or(0));
    }
}

/// Lowers `EnterSlowPath` into a tail dispatch into the named slow-path
/// component. Run last among the meta-API lowering passes since a slow-path
/// target may itself still reference `MetadataPtr`/`GetBytecodePtrInternal`
/// that must already be resolved in the *current* function, not the target.
pub fn lower_slow_path_dispatch(func: &mut Function) {
    for block in &mut func.blocks {
        if let Some(pos) = block.instrs.iter().position(|i| matches!(i, Instr::EnterSlowPath { .. })) {
            if let Instr::EnterSlowPath { target, args } = block.instrs.remove(pos) {
                block.instrs.push(Instr::TailCallImpl { callee: target, args });
                block.terminator = Terminator::Unreachable;
            }
        }
    }
}

/// Runs the full ordered final-lowering sequence for one function: meta-API
/// calls lower to terminators and concrete (tail) calls in the order the
/// algorithm description fixes (`Return`, `MakeCall`, `ReturnValueAccessor`,
/// `ThrowError`, the pointer placeholders, then slow-path dispatch).
pub fn run_final_lowering(func: &mut Function, metadata_ptr_offset: Option<i32>) {
    lower_return(func);
    lower_make_call(func);
    lower_return_value_accessor(func);
    lower_throw_error(func);
    lower_meta_api_placeholders(func, metadata_ptr_offset);
    lower_slow_path_dispatch(func);
}

/// Final check: no lowering placeholder or unlowered meta-API call may
/// remain in a function about to be handed off to link & prune.
pub fn check_fully_lowered(func: &Function) -> Result<(), LoweringError> {
    for block in &func.blocks {
        for instr in &block.instrs {
            if matches!(instr, Instr::MetadataPtr { .. }) {
                return Err(LoweringError::UnresolvedMetadataPtr(func.name.0.clone()));
            }
            let name = match instr {
                Instr::GetBytecodePtrInternal { .. } => Some("GetBytecodePtrInternal"),
                Instr::Return { .. } => Some("Return"),
                Instr::MakeCall { .. } => Some("MakeCall"),
                Instr::ReturnValueAccessor { .. } => Some("ReturnValueAccessor"),
                Instr::EnterSlowPath { .. } => Some("EnterSlowPath"),
                Instr::ThrowError { .. } => Some("ThrowError"),
                _ => None,
            };
            if let Some(name) = name {
                return Err(LoweringError::UnloweredMetaApi(func.name.0.clone(), name.to_string()));
            }
        }
    }
    Ok(())
}

/// Normalizes linkage: only `entry` keeps external linkage; everything else
/// in the component's module reverts to internal so link & prune's
/// internalize+DCE step has a consistent starting point.
pub fn normalize_linkage(functions: &mut [&mut Function], entry: &FunctionId) {
    for f in functions.iter_mut() {
        f.linkage = if &f.name == entry { Linkage::External } else { Linkage::Internal };
    }
}

/// Peephole: collapses a `Move` whose source is itself the destination of
/// an immediately preceding instruction in the same block into that
/// instruction's destination directly (removes the intermediate copy
/// introduced by earlier passes' placeholder resolution).
pub fn peephole_collapse_trivial_moves(func: &mut Function) {
    for block in &mut func.blocks {
        let mut i = 0;
        while i + 1 < block.instrs.len() {
            let collapse = match (&block.instrs[i], &block.instrs[i + 1]) {
                (prev, Instr::Move { dst, src }) if prev.dest() == Some(*src) => Some(*dst),
                _ => None,
            };
            if let Some(new_dst) = collapse {
                if let Some(d) = instr_dest_mut(&mut block.instrs[i]) {
                    *d = new_dst;
                }
                block.instrs.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}

fn instr_dest_mut(instr: &mut Instr) -> Option<&mut crate::ir::Reg> {
    match instr {
        Instr::ConstInt { dst, .. }
        | Instr::ConstDouble { dst, .. }
        | Instr::Binary { dst, .. }
        | Instr::Load { dst, .. }
        | Instr::Move { dst, .. }
        | Instr::ReturnValueAccessor { dst }
        | Instr::TypeCheck { dst, .. }
        | Instr::MetadataPtr { dst }
        | Instr::GetBytecodePtrInternal { dst } => Some(dst),
        Instr::MakeCall { dst, .. } | Instr::Call { dst, .. } | Instr::CallKnown { dst, .. } => Some(dst),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ValueKind;

    #[test]
    fn resolve_metadata_ptrs_turns_placeholder_into_load() {
        let mut f = Function::new("Main_impl");
        let base = f.alloc_reg(ValueKind::Pointer);
        let dst = f.alloc_reg(ValueKind::Pointer);
        f.block_mut(f.entry).unwrap().instrs.push(Instr::MetadataPtr { dst });
        resolve_metadata_ptrs(&mut f, base, 16);
        assert_eq!(f.blocks[0].instrs[0], Instr::Load { dst, addr: base, offset: 16 });
    }

    #[test]
    fn check_fully_lowered_detects_leftover_placeholder() {
        let mut f = Function::new("Main_impl");
        let dst = f.alloc_reg(ValueKind::Pointer);
        f.block_mut(f.entry).unwrap().instrs.push(Instr::MetadataPtr { dst });
        let err = check_fully_lowered(&f).unwrap_err();
        assert!(matches!(err, LoweringError::UnresolvedMetadataPtr(_)));
    }

    #[test]
    fn normalize_linkage_demotes_non_entry_functions() {
        let mut a = Function::new("Main_impl");
        a.linkage = Linkage::External;
        let mut b = Function::new("Main_impl_ic_Ic0_Hit");
        b.linkage = Linkage::External;
        normalize_linkage(&mut [&mut a, &mut b], &"Main_impl".into());
        assert_eq!(a.linkage, Linkage::External);
        assert_eq!(b.linkage, Linkage::Internal);
    }

    #[test]
    fn lower_return_moves_value_into_terminator() {
        let mut f = Function::new("Main_impl");
        let v = f.alloc_reg(ValueKind::Int64);
        f.block_mut(f.entry).unwrap().instrs.push(Instr::Return { value: Some(v) });
        lower_return(&mut f);
        assert!(f.blocks[0].instrs.is_empty());
        assert_eq!(f.blocks[0].terminator, Terminator::Return(Some(v)));
    }

    #[test]
    fn lower_make_call_emits_call_then_tail_dispatch() {
        let mut f = Function::new("Main_impl");
        let dst = f.alloc_reg(ValueKind::Tagged);
        let callee = f.alloc_reg(ValueKind::Pointer);
        f.block_mut(f.entry).unwrap().instrs.push(Instr::MakeCall {
            dst,
            callee,
            args: vec![],
            cont: "Main_cont_0_impl".into(),
        });
        lower_make_call(&mut f);
        assert_eq!(f.blocks[0].instrs.len(), 2);
        assert_eq!(f.blocks[0].instrs[0], Instr::Call { dst, callee, args: vec![] });
        assert_eq!(
            f.blocks[0].instrs[1],
            Instr::TailCallImpl { callee: "Main_cont_0_impl".into(), args: vec![dst] }
        );
        assert_eq!(f.blocks[0].terminator, Terminator::Unreachable);
    }

    #[test]
    fn lower_return_value_accessor_binds_a_fresh_parameter() {
        let mut f = Function::new("Main_cont_0_impl");
        let dst = f.alloc_reg(ValueKind::Tagged);
        f.block_mut(f.entry).unwrap().instrs.push(Instr::ReturnValueAccessor { dst });
        let params_before = f.params.len();
        lower_return_value_accessor(&mut f);
        assert_eq!(f.params.len(), params_before + 1);
        let incoming = *f.params.last().unwrap();
        assert_eq!(f.blocks[0].instrs[0], Instr::Move { dst, src: incoming });
    }

    #[test]
    fn lower_slow_path_dispatch_tail_calls_the_target() {
        let mut f = Function::new("Main_impl");
        f.block_mut(f.entry).unwrap().instrs.push(Instr::EnterSlowPath {
            target: "_slow_path_0".into(),
            args: vec![],
        });
        lower_slow_path_dispatch(&mut f);
        assert_eq!(
            f.blocks[0].instrs[0],
            Instr::TailCallImpl { callee: "_slow_path_0".into(), args: vec![] }
        );
        assert_eq!(f.blocks[0].terminator, Terminator::Unreachable);
    }

    #[test]
    fn lower_meta_api_placeholders_is_a_no_op_without_placeholders() {
        let mut f = Function::new("Main_cont_0_impl");
        let a = f.alloc_reg(ValueKind::Int64);
        f.block_mut(f.entry).unwrap().instrs.push(Instr::ConstInt { dst: a, value: 1 });
        let reg_count_before = f.blocks[0].instrs.len();
        lower_meta_api_placeholders(&mut f, None);
        assert_eq!(f.blocks[0].instrs.len(), reg_count_before);
    }

    #[test]
    fn run_final_lowering_leaves_nothing_for_check_fully_lowered_to_reject() {
        let mut f = Function::new("Main_impl");
        let dst = f.alloc_reg(ValueKind::Pointer);
        f.block_mut(f.entry).unwrap().instrs.push(Instr::MetadataPtr { dst });
        f.block_mut(f.entry).unwrap().instrs.push(Instr::GetBytecodePtrInternal { dst });
        f.block_mut(f.entry).unwrap().terminator = Terminator::Return(Some(dst));
        run_final_lowering(&mut f, Some(16));
        assert!(check_fully_lowered(&f).is_ok());
    }

    #[test]
    fn rewrite_meta_api_targets_renames_continuation_and_slow_path() {
        let mut f = Function::new("Main_impl");
        let dst = f.alloc_reg(ValueKind::Tagged);
        let callee = f.alloc_reg(ValueKind::Pointer);
        f.block_mut(f.entry).unwrap().instrs.push(Instr::MakeCall {
            dst,
            callee,
            args: vec![],
            cont: "Main_cont_0".into(),
        });
        f.block_mut(f.entry)
            .unwrap()
            .instrs
            .push(Instr::EnterSlowPath { target: "Main_slow_0".into(), args: vec![] });

        let mut map = FxHashMap::default();
        map.insert(FunctionId::from("Main_cont_0"), FunctionId::from("Main_cont_0_impl"));
        map.insert(FunctionId::from("Main_slow_0"), FunctionId::from("_slow_path_0"));
        rewrite_meta_api_targets(&mut f, &map);

        assert_eq!(
            f.blocks[0].instrs[0],
            Instr::MakeCall { dst, callee, args: vec![], cont: "Main_cont_0_impl".into() }
        );
        assert_eq!(
            f.blocks[0].instrs[1],
            Instr::EnterSlowPath { target: "_slow_path_0".into(), args: vec![] }
        );
    }

    #[test]
    fn peephole_collapses_trivial_move_chain() {
        let mut f = Function::new("Main_impl");
        let a = f.alloc_reg(ValueKind::Int64);
        let b = f.alloc_reg(ValueKind::Int64);
        let block = f.block_mut(f.entry).unwrap();
        block.instrs.push(Instr::ConstInt { dst: a, value: 7 });
        block.instrs.push(Instr::Move { dst: b, src: a });
        peephole_collapse_trivial_moves(&mut f);
        assert_eq!(f.blocks[0].instrs.len(), 1);
        assert_eq!(f.blocks[0].instrs[0], Instr::ConstInt { dst: b, value: 7 });
    }
}
