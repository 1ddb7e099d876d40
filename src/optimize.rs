//! Per-component optimization: a small fixed pipeline of local passes run
//! over one already-factored component before inline-cache lowering and
//! metadata finalization observe it (this ordering matters: a dead-coded
//! `MakeCall` here means no Call-IC site gets reserved for it downstream).

use crate::component::ComponentKind;
use crate::ir::{Function, Instr, Reg, Terminator};
use rustc_hash::FxHashMap;

/// Which type-check optimization variant a component's kind selects, per
/// the table in the per-component optimization stage: `Main`/fused-IC
/// components with a quickening fast path get the most aggressive variant,
/// the quickening slow path gets the most conservative (a fast-path guard
/// just failed there, so a `TypeCheck` cannot be assumed to still hold),
/// and everything else gets the baseline variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCheckPassVariant {
    QuickeningFastPath,
    Bytecode,
    QuickeningSlowPath,
}

/// Select the pass variant for a component of `kind`, given whether its
/// owning variant declares a quickening fast path.
pub fn pass_variant_for(kind: ComponentKind, has_quickening: bool) -> TypeCheckPassVariant {
    use ComponentKind::*;
    match kind {
        QuickeningSlowPath => TypeCheckPassVariant::QuickeningSlowPath,
        Main | FusedInInlineCacheEffect if has_quickening => TypeCheckPassVariant::QuickeningFastPath,
        Main | FusedInInlineCacheEffect | ReturnContinuation | SlowPath => TypeCheckPassVariant::Bytecode,
    }
}

pub trait OptPass {
    fn name(&self) -> &str;
    fn run(&self, func: &mut Function);
}

pub struct Optimizer {
    passes: Vec<Box<dyn OptPass>>,
}

impl Optimizer {
    pub fn new() -> Self {
        Optimizer {
            passes: vec![
                Box::new(RedundantTypeCheckElimination),
                Box::new(CopyPropagation),
                Box::new(ConstantFolding),
                Box::new(DeadCodeElimination),
            ],
        }
    }

    pub fn empty() -> Self {
        Optimizer { passes: Vec::new() }
    }

    /// Build the pipeline appropriate for one component, per the
    /// per-component optimization table: every variant runs copy
    /// propagation, constant folding, and dead-code elimination, but only
    /// `Bytecode`/`QuickeningFastPath` also run redundant type-check
    /// elimination — a `QuickeningSlowPath` component exists precisely
    /// because its fast path's speculation failed, so eliding a `TypeCheck`
    /// there based on an earlier identical one would be unsound.
    pub fn for_component(kind: ComponentKind, has_quickening: bool) -> Self {
        let variant = pass_variant_for(kind, has_quickening);
        let mut opt = Optimizer::empty();
        if variant != TypeCheckPassVariant::QuickeningSlowPath {
            opt.add_pass(Box::new(RedundantTypeCheckElimination));
        }
        opt.add_pass(Box::new(CopyPropagation));
        opt.add_pass(Box::new(ConstantFolding));
        opt.add_pass(Box::new(DeadCodeElimination));
        opt
    }

    pub fn add_pass(&mut self, pass: Box<dyn OptPass>) {
        self.passes.push(pass);
    }

    pub fn optimize(&self, func: &mut Function) {
        for pass in &self.passes {
            pass.run(func);
        }
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Optimizer::new()
    }
}

/// Eliminates a `TypeCheck` immediately re-checking a value already proven
/// by an identical preceding `TypeCheck` in the same block (the analog of
/// the teacher's box/unbox elimination: a redundant conversion/guard pair
/// collapses to a `Move` of the already-computed predicate).
pub struct RedundantTypeCheckElimination;

impl OptPass for RedundantTypeCheckElimination {
    fn name(&self) -> &str {
        "redundant-type-check-elimination"
    }

    fn run(&self, func: &mut Function) {
        for block in &mut func.blocks {
            let mut seen: FxHashMap<(Reg, crate::typemask::TypeMask), Reg> = FxHashMap::default();
            for instr in &mut block.instrs {
                if let Instr::TypeCheck { dst, value, mask } = instr {
                    let key = (*value, *mask);
                    if let Some(&prior_dst) = seen.get(&key) {
                        let dst = *dst;
                        *instr = Instr::Move { dst, src: prior_dst };
                    } else {
                        seen.insert(key, *dst);
                    }
                }
            }
        }
    }
}

/// Resolves chains of `Move` instructions so later passes see the original
/// producer directly, following the chain through a bounded number of hops
/// to guard against a malformed cyclic input.
pub struct CopyPropagation;

impl OptPass for CopyPropagation {
    fn name(&self) -> &str {
        "copy-propagation"
    }

    fn run(&self, func: &mut Function) {
        let mut moves: FxHashMap<Reg, Reg> = FxHashMap::default();
        for block in &func.blocks {
            for instr in &block.instrs {
                if let Instr::Move { dst, src } = instr {
                    moves.insert(*dst, *src);
                }
            }
        }

        let resolve = |mut r: Reg| -> Reg {
            let mut depth = 0;
            while let Some(&next) = moves.get(&r) {
                if depth > 100 {
                    break;
                }
                r = next;
                depth += 1;
            }
            r
        };

        for block in &mut func.blocks {
            for instr in &mut block.instrs {
                replace_uses(instr, &resolve);
            }
            replace_terminator_uses(&mut block.terminator, &resolve);
        }
    }
}

fn replace_uses(instr: &mut Instr, resolve: &impl Fn(Reg) -> Reg) {
    match instr {
        Instr::Binary { lhs, rhs, .. } => {
            *lhs = resolve(*lhs);
            *rhs = resolve(*rhs);
        }
        Instr::Load { addr, .. } => *addr = resolve(*addr),
        Instr::Store { addr, value, .. } => {
            *addr = resolve(*addr);
            *value = resolve(*value);
        }
        Instr::Move { src, .. } => *src = resolve(*src),
        Instr::Return { value } => {
            if let Some(v) = value {
                *v = resolve(*v);
            }
        }
        Instr::MakeCall { callee, args, .. } => {
            *callee = resolve(*callee);
            for a in args {
                *a = resolve(*a);
            }
        }
        Instr::EnterSlowPath { args, .. } => {
            for a in args {
                *a = resolve(*a);
            }
        }
        Instr::ThrowError { error } => *error = resolve(*error),
        Instr::TypeCheck { value, .. } => *value = resolve(*value),
        Instr::InlineCacheSite { value, .. } => *value = resolve(*value),
        Instr::Call { callee, args, .. } => {
            *callee = resolve(*callee);
            for a in args {
                *a = resolve(*a);
            }
        }
        Instr::CallKnown { args, .. } | Instr::TailCallImpl { args, .. } => {
            for a in args {
                *a = resolve(*a);
            }
        }
        Instr::ConstInt { .. }
        | Instr::ConstDouble { .. }
        | Instr::ReturnValueAccessor { .. }
        | Instr::MetadataPtr { .. }
        | Instr::GetBytecodePtrInternal { .. } => {}
    }
}

fn replace_terminator_uses(term: &mut Terminator, resolve: &impl Fn(Reg) -> Reg) {
    if let Terminator::Branch { cond, .. } = term {
        *cond = resolve(*cond);
    }
    if let Terminator::Return(Some(r)) = term {
        *r = resolve(*r);
    }
}

/// Folds integer-constant arithmetic, matching the teacher's `ConstantFolding`
/// pass scope (binary ops over two already-constant operands).
pub struct ConstantFolding;

impl OptPass for ConstantFolding {
    fn name(&self) -> &str {
        "constant-folding"
    }

    fn run(&self, func: &mut Function) {
        for block in &mut func.blocks {
            let mut consts: FxHashMap<Reg, i64> = FxHashMap::default();
            for instr in &mut block.instrs {
                match instr {
                    Instr::ConstInt { dst, value } => {
                        consts.insert(*dst, *value);
                    }
                    Instr::Binary { dst, op, lhs, rhs } => {
                        if let (Some(&a), Some(&b)) = (consts.get(lhs), consts.get(rhs)) {
                            use crate::ir::BinOp::*;
                            let folded = match op {
                                Add => Some(a.wrapping_add(b)),
                                Sub => Some(a.wrapping_sub(b)),
                                Mul => Some(a.wrapping_mul(b)),
                                And => Some(a & b),
                                Or => Some(a | b),
                                Xor => Some(a ^ b),
                                Eq => Some((a == b) as i64),
                                Lt => Some((a < b) as i64),
                            };
                            if let Some(v) = folded {
                                let dst = *dst;
                                consts.insert(dst, v);
                                *instr = Instr::ConstInt { dst, value: v };
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Removes instructions whose destination register is never used and which
/// carry no side effect (`Instr::has_side_effects`), and meta-API markers
/// whose fixed-point rounds found nothing left referencing them.
pub struct DeadCodeElimination;

impl OptPass for DeadCodeElimination {
    fn name(&self) -> &str {
        "dead-code-elimination"
    }

    fn run(&self, func: &mut Function) {
        let mut used: std::collections::HashSet<Reg> = std::collections::HashSet::new();
        for block in &func.blocks {
            for instr in &block.instrs {
                for u in instr.uses() {
                    used.insert(u);
                }
            }
            if let Terminator::Branch { cond, .. } = &block.terminator {
                used.insert(*cond);
            }
            if let Terminator::Return(Some(r)) = &block.terminator {
                used.insert(*r);
            }
        }

        for block in &mut func.blocks {
            block.instrs.retain(|instr| {
                instr.has_side_effects()
                    || match instr.dest() {
                        Some(d) => used.contains(&d),
                        None => true,
                    }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, Function, ValueKind};

    fn make_func() -> Function {
        Function::new("Main_impl")
    }

    #[test]
    fn constant_folding_evaluates_add() {
        let mut f = make_func();
        let a = f.alloc_reg(ValueKind::Int64);
        let b = f.alloc_reg(ValueKind::Int64);
        let c = f.alloc_reg(ValueKind::Int64);
        let block = f.block_mut(f.entry).unwrap();
        block.instrs.push(Instr::ConstInt { dst: a, value: 2 });
        block.instrs.push(Instr::ConstInt { dst: b, value: 3 });
        block.instrs.push(Instr::Binary { dst: c, op: BinOp::Add, lhs: a, rhs: b });
        ConstantFolding.run(&mut f);
        assert_eq!(f.blocks[0].instrs[2], Instr::ConstInt { dst: c, value: 5 });
    }

    #[test]
    fn copy_propagation_resolves_chains() {
        let mut f = make_func();
        let a = f.alloc_reg(ValueKind::Int64);
        let b = f.alloc_reg(ValueKind::Int64);
        let c = f.alloc_reg(ValueKind::Int64);
        let block = f.block_mut(f.entry).unwrap();
        block.instrs.push(Instr::ConstInt { dst: a, value: 1 });
        block.instrs.push(Instr::Move { dst: b, src: a });
        block.instrs.push(Instr::Move { dst: c, src: b });
        block.terminator = Terminator::Return(Some(c));
        CopyPropagation.run(&mut f);
        assert_eq!(f.blocks[0].terminator, Terminator::Return(Some(a)));
    }

    #[test]
    fn dead_code_elimination_keeps_side_effects() {
        let mut f = make_func();
        let a = f.alloc_reg(ValueKind::Int64);
        let unused = f.alloc_reg(ValueKind::Int64);
        let block = f.block_mut(f.entry).unwrap();
        block.instrs.push(Instr::ConstInt { dst: unused, value: 9 });
        block.instrs.push(Instr::ConstInt { dst: a, value: 1 });
        block.instrs.push(Instr::Return { value: Some(a) });
        DeadCodeElimination.run(&mut f);
        assert_eq!(f.blocks[0].instrs.len(), 2);
    }

    #[test]
    fn redundant_type_check_elimination_collapses_repeat_checks() {
        use crate::typemask::{TypeMask, TypePrimitive};
        let mut f = make_func();
        let v = f.alloc_reg(ValueKind::Tagged);
        let d1 = f.alloc_reg(ValueKind::Boolean);
        let d2 = f.alloc_reg(ValueKind::Boolean);
        let mask = TypeMask::single(TypePrimitive::Int32);
        let block = f.block_mut(f.entry).unwrap();
        block.instrs.push(Instr::TypeCheck { dst: d1, value: v, mask });
        block.instrs.push(Instr::TypeCheck { dst: d2, value: v, mask });
        RedundantTypeCheckElimination.run(&mut f);
        assert_eq!(f.blocks[0].instrs[1], Instr::Move { dst: d2, src: d1 });
    }

    #[test]
    fn pass_variant_matches_the_per_component_table() {
        assert_eq!(pass_variant_for(ComponentKind::Main, true), TypeCheckPassVariant::QuickeningFastPath);
        assert_eq!(pass_variant_for(ComponentKind::Main, false), TypeCheckPassVariant::Bytecode);
        assert_eq!(
            pass_variant_for(ComponentKind::FusedInInlineCacheEffect, true),
            TypeCheckPassVariant::QuickeningFastPath
        );
        assert_eq!(pass_variant_for(ComponentKind::QuickeningSlowPath, false), TypeCheckPassVariant::QuickeningSlowPath);
        assert_eq!(pass_variant_for(ComponentKind::ReturnContinuation, false), TypeCheckPassVariant::Bytecode);
        assert_eq!(pass_variant_for(ComponentKind::SlowPath, false), TypeCheckPassVariant::Bytecode);
    }

    #[test]
    fn quickening_slow_path_optimizer_skips_redundant_type_check_elimination() {
        use crate::typemask::{TypeMask, TypePrimitive};
        let mut f = make_func();
        let v = f.alloc_reg(ValueKind::Tagged);
        let d1 = f.alloc_reg(ValueKind::Boolean);
        let d2 = f.alloc_reg(ValueKind::Boolean);
        let combined = f.alloc_reg(ValueKind::Boolean);
        let mask = TypeMask::single(TypePrimitive::Int32);
        let block = f.block_mut(f.entry).unwrap();
        block.instrs.push(Instr::TypeCheck { dst: d1, value: v, mask });
        block.instrs.push(Instr::TypeCheck { dst: d2, value: v, mask });
        block.instrs.push(Instr::Binary { dst: combined, op: BinOp::And, lhs: d1, rhs: d2 });
        block.terminator = Terminator::Return(Some(combined));

        let opt = Optimizer::for_component(ComponentKind::QuickeningSlowPath, false);
        opt.optimize(&mut f);
        let type_check_count =
            f.blocks[0].instrs.iter().filter(|i| matches!(i, Instr::TypeCheck { .. })).count();
        assert_eq!(type_check_count, 2);
    }

    #[test]
    fn default_pipeline_runs_all_four_passes_without_panicking() {
        let mut f = make_func();
        let a = f.alloc_reg(ValueKind::Int64);
        f.block_mut(f.entry).unwrap().instrs.push(Instr::ConstInt { dst: a, value: 1 });
        f.block_mut(f.entry).unwrap().terminator = Terminator::Return(Some(a));
        let opt = Optimizer::new();
        opt.optimize(&mut f);
        assert_eq!(f.blocks[0].terminator, Terminator::Return(Some(a)));
    }
}
