//! The low-level, typed, SSA-form IR the pipeline operates on. This is the
//! concrete stand-in for the "externally produced low-level IR" the
//! algorithm description assumes: a small generic instruction core plus one
//! variant per meta-API call, since the meta-API call surface is itself
//! part of this crate's contract (their textual names are part of the ABI).

use rustc_hash::FxHashMap;
use std::fmt;

/// A virtual register within one function. Unique only within that
/// function, matching `instr.rs`'s `Reg` in the teacher crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u32);

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// A function identifier, stable across cloning (the factory clones the
/// whole module, so function identity is by name, not by index).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub String);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FunctionId {
    fn from(s: &str) -> Self {
        FunctionId(s.to_string())
    }
}

impl From<String> for FunctionId {
    fn from(s: String) -> Self {
        FunctionId(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Eq,
    Lt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueKind {
    Int64,
    Double,
    Boolean,
    Pointer,
    Tagged,
}

/// One instruction. The first group is a small generic core sufficient to
/// express a plausible bytecode handler body; the second group is the
/// closed set of meta-API calls the pipeline lowers.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    ConstInt { dst: Reg, value: i64 },
    ConstDouble { dst: Reg, value: u64 },
    Binary { dst: Reg, op: BinOp, lhs: Reg, rhs: Reg },
    Load { dst: Reg, addr: Reg, offset: i32 },
    Store { addr: Reg, offset: i32, value: Reg },
    Move { dst: Reg, src: Reg },

    /// Returns control to the interpreter dispatch loop with `value` as the
    /// bytecode's result.
    Return { value: Option<Reg> },
    /// Invokes the generic call meta-API; control resumes at `cont` with the
    /// call's return value available via `ReturnValueAccessor`.
    MakeCall { dst: Reg, callee: Reg, args: Vec<Reg>, cont: FunctionId },
    /// Exits the fast path into the named slow-path function, passing the
    /// listed live values.
    EnterSlowPath { target: FunctionId, args: Vec<Reg> },
    /// Reads the return value made available by the `MakeCall` that invoked
    /// this continuation.
    ReturnValueAccessor { dst: Reg },
    /// Throws a VM-level error object; never falls through.
    ThrowError { error: Reg },
    /// Speculative type check: branches are implicit in `Terminator`, this
    /// instruction only computes the boolean predicate.
    TypeCheck { dst: Reg, value: Reg, mask: crate::typemask::TypeMask },
    /// Marks `value` as participating in inline cache `site`, with `effect`
    /// naming which IC effect kind this occurrence contributes.
    InlineCacheSite { site: String, effect: String, value: Reg },
    /// Placeholder for the metadata pointer; resolved to a concrete offset
    /// load during final lowering (see `lowering.rs`).
    MetadataPtr { dst: Reg },
    /// Placeholder for reading the raw bytecode pointer of the currently
    /// executing instruction.
    GetBytecodePtrInternal { dst: Reg },

    /// A concrete, returning call through an indirect (register-held)
    /// callee. The lowered form of `MakeCall`'s invocation half.
    Call { dst: Reg, callee: Reg, args: Vec<Reg> },
    /// A concrete, returning call to a statically named function, e.g. an
    /// inline-cache body invoked on cache miss.
    CallKnown { dst: Reg, callee: FunctionId, args: Vec<Reg> },
    /// A non-returning tail call to a statically named function: a
    /// wrapper's dispatch into its own `impl`, into a quickening's slow
    /// path, or the lowered form of `MakeCall`'s continuation dispatch and
    /// `EnterSlowPath`. Always the last instruction in its block.
    TailCallImpl { callee: FunctionId, args: Vec<Reg> },
}

impl Instr {
    pub fn dest(&self) -> Option<Reg> {
        match self {
            Instr::ConstInt { dst, .. }
            | Instr::ConstDouble { dst, .. }
            | Instr::Binary { dst, .. }
            | Instr::Load { dst, .. }
            | Instr::Move { dst, .. }
            | Instr::ReturnValueAccessor { dst }
            | Instr::TypeCheck { dst, .. }
            | Instr::MetadataPtr { dst }
            | Instr::GetBytecodePtrInternal { dst } => Some(*dst),
            Instr::MakeCall { dst, .. } | Instr::Call { dst, .. } | Instr::CallKnown { dst, .. } => Some(*dst),
            Instr::InlineCacheSite { .. } => None,
            Instr::Store { .. }
            | Instr::Return { .. }
            | Instr::EnterSlowPath { .. }
            | Instr::ThrowError { .. }
            | Instr::TailCallImpl { .. } => None,
        }
    }

    /// Instructions whose removal would be observable even if their result
    /// is unused: calls, stores, throws, slow path exits, and IC site
    /// markers (metadata correctness depends on every occurrence surviving).
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Instr::Store { .. }
                | Instr::MakeCall { .. }
                | Instr::EnterSlowPath { .. }
                | Instr::ThrowError { .. }
                | Instr::Return { .. }
                | Instr::InlineCacheSite { .. }
                | Instr::Call { .. }
                | Instr::CallKnown { .. }
                | Instr::TailCallImpl { .. }
        )
    }

    pub fn uses(&self) -> Vec<Reg> {
        match self {
            Instr::ConstInt { .. } | Instr::ConstDouble { .. } => vec![],
            Instr::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Instr::Load { addr, .. } => vec![*addr],
            Instr::Store { addr, value, .. } => vec![*addr, *value],
            Instr::Move { src, .. } => vec![*src],
            Instr::Return { value } => value.into_iter().copied().collect(),
            Instr::MakeCall { callee, args, .. } => {
                let mut v = vec![*callee];
                v.extend(args.iter().copied());
                v
            }
            Instr::EnterSlowPath { args, .. } => args.clone(),
            Instr::ReturnValueAccessor { .. } => vec![],
            Instr::ThrowError { error } => vec![*error],
            Instr::TypeCheck { value, .. } => vec![*value],
            Instr::InlineCacheSite { value, .. } => vec![*value],
            Instr::MetadataPtr { .. } | Instr::GetBytecodePtrInternal { .. } => vec![],
            Instr::Call { callee, args, .. } => {
                let mut v = vec![*callee];
                v.extend(args.iter().copied());
                v
            }
            Instr::CallKnown { args, .. } => args.clone(),
            Instr::TailCallImpl { args, .. } => args.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Jump(BlockId),
    Branch { cond: Reg, then_block: BlockId, else_block: BlockId },
    Return(Option<Reg>),
    Unreachable,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub instrs: Vec<Instr>,
    pub terminator: Terminator,
}

impl Block {
    pub fn new(id: BlockId) -> Self {
        Block { id, instrs: Vec::new(), terminator: Terminator::Unreachable }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    Internal,
    External,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: FunctionId,
    pub linkage: Linkage,
    pub params: Vec<Reg>,
    pub blocks: Vec<Block>,
    pub entry: BlockId,
    next_reg: u32,
    pub reg_types: FxHashMap<Reg, ValueKind>,
}

impl Function {
    pub fn new(name: impl Into<FunctionId>) -> Self {
        let entry = BlockId(0);
        Function {
            name: name.into(),
            linkage: Linkage::Internal,
            params: Vec::new(),
            blocks: vec![Block::new(entry)],
            entry,
            next_reg: 0,
            reg_types: FxHashMap::default(),
        }
    }

    pub fn alloc_reg(&mut self, kind: ValueKind) -> Reg {
        let r = Reg(self.next_reg);
        self.next_reg += 1;
        self.reg_types.insert(r, kind);
        r
    }

    pub fn reg_type(&self, r: Reg) -> Option<ValueKind> {
        self.reg_types.get(&r).copied()
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.id == id)
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(id));
        id
    }

    pub fn instr_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }

    /// All functions this function's instructions directly reference via a
    /// meta-API call (MakeCall continuation or EnterSlowPath target).
    pub fn referenced_functions(&self) -> Vec<FunctionId> {
        let mut out = Vec::new();
        for block in &self.blocks {
            for instr in &block.instrs {
                match instr {
                    Instr::MakeCall { cont, .. } => out.push(cont.clone()),
                    Instr::EnterSlowPath { target, .. } => out.push(target.clone()),
                    Instr::CallKnown { callee, .. } => out.push(callee.clone()),
                    Instr::TailCallImpl { callee, .. } => out.push(callee.clone()),
                    _ => {}
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub functions: FxHashMap<FunctionId, Function>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module { name: name.into(), functions: FxHashMap::default() }
    }

    pub fn add_function(&mut self, f: Function) {
        self.functions.insert(f.name.clone(), f);
    }

    pub fn get(&self, name: &FunctionId) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn get_mut(&mut self, name: &FunctionId) -> Option<&mut Function> {
        self.functions.get_mut(name)
    }

    /// Function names in deterministic (lexicographic) order, matching the
    /// pipeline's "sorted traversal everywhere" determinism requirement.
    pub fn sorted_function_names(&self) -> Vec<FunctionId> {
        let mut names: Vec<FunctionId> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}
