//! Control-flow discovery: partitions the set of functions reachable from a
//! bytecode handler's `Main` entry point into return-continuations (reached
//! via a `MakeCall` continuation edge) and slow paths (reached via an
//! `EnterSlowPath` edge), by DFS over the meta-API call graph.

use crate::diagnostics::DiscoveryError;
use crate::ir::{FunctionId, Instr, Module};
use rustc_hash::FxHashSet;

#[derive(Debug, Clone, Default)]
pub struct DiscoveryResult {
    pub return_continuations: FxHashSet<FunctionId>,
    pub slow_paths: FxHashSet<FunctionId>,
}

impl DiscoveryResult {
    pub fn is_return_continuation(&self, f: &FunctionId) -> bool {
        self.return_continuations.contains(f)
    }

    pub fn is_slow_path(&self, f: &FunctionId) -> bool {
        self.slow_paths.contains(f)
    }
}

enum EdgeKind {
    ReturnContinuation,
    SlowPath,
}

/// Discover the return-continuation and slow-path sets reachable from
/// `entry`. A function reached by both a continuation edge and a slow-path
/// edge on different paths is recorded in both sets: the two sets classify
/// edges, not functions, and a function can serve both roles.
pub fn discover(module: &Module, entry: &FunctionId) -> Result<DiscoveryResult, DiscoveryError> {
    let mut result = DiscoveryResult::default();
    let mut visited_as_cont: FxHashSet<FunctionId> = FxHashSet::default();
    let mut visited_as_slow: FxHashSet<FunctionId> = FxHashSet::default();

    if module.get(entry).is_none() {
        return Err(DiscoveryError::DanglingContinuation(entry.0.clone()));
    }

    let mut worklist: Vec<(FunctionId, EdgeKind)> = Vec::new();
    seed_edges(module, entry, &mut worklist)?;

    while let Some((f, kind)) = worklist.pop() {
        match kind {
            EdgeKind::ReturnContinuation => {
                if !visited_as_cont.insert(f.clone()) {
                    continue;
                }
                result.return_continuations.insert(f.clone());
            }
            EdgeKind::SlowPath => {
                if !visited_as_slow.insert(f.clone()) {
                    continue;
                }
                result.slow_paths.insert(f.clone());
            }
        }
        seed_edges(module, &f, &mut worklist)?;
    }

    Ok(result)
}

fn seed_edges(
    module: &Module,
    from: &FunctionId,
    worklist: &mut Vec<(FunctionId, EdgeKind)>,
) -> Result<(), DiscoveryError> {
    let func = module.get(from).ok_or_else(|| DiscoveryError::DanglingContinuation(from.0.clone()))?;
    for block in &func.blocks {
        for instr in &block.instrs {
            match instr {
                Instr::MakeCall { cont, .. } => {
                    if module.get(cont).is_none() {
                        return Err(DiscoveryError::DanglingContinuation(cont.0.clone()));
                    }
                    worklist.push((cont.clone(), EdgeKind::ReturnContinuation));
                }
                Instr::EnterSlowPath { target, .. } => {
                    if module.get(target).is_none() {
                        return Err(DiscoveryError::DanglingSlowPathTarget(target.0.clone()));
                    }
                    worklist.push((target.clone(), EdgeKind::SlowPath));
                }
                _ => {}
            }
        }
    }
    Ok(())
}
