//! Component factory: produces one standalone, self-contained module per
//! pipeline component (Main, each return continuation, each slow path) by
//! cloning the source module, renaming the component's entry function with
//! an `_impl` suffix, promoting its linkage to external for the duration of
//! optimization, and deleting everything unreachable from it.

use crate::diagnostics::FactoryError;
use crate::ir::{Function, FunctionId, Linkage, Module};
use rustc_hash::FxHashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Main,
    ReturnContinuation,
    SlowPath,
    /// The speculative-fast-path guard's fallback target: re-materializes
    /// the already-decoded quickened operands and falls through to the
    /// unspecialized handler.
    QuickeningSlowPath,
    /// A specialized Main generated for one effect kind of a variant's
    /// `FuseICIntoInterpreterOpcode` site — the IC effect rolled into the
    /// opcode identity itself.
    FusedInInlineCacheEffect,
}

impl ComponentKind {
    /// Whether the inline-cache lowering API (§4.4) may be used in a
    /// component of this kind. Forbidden everywhere except `Main` and its
    /// fused-IC specializations (§4.2 postconditions).
    pub fn allows_inline_cache_api(self) -> bool {
        matches!(self, ComponentKind::Main | ComponentKind::FusedInInlineCacheEffect)
    }
}

#[derive(Debug, Clone)]
pub struct Component {
    pub kind: ComponentKind,
    pub entry: FunctionId,
    pub module: Module,
    /// Overrides the name `link::merge_components` gives this component's
    /// entry in the final linked module. `SlowPath` components are renamed
    /// densely by `merge_components` itself and leave this `None`;
    /// `QuickeningSlowPath` and `FusedInInlineCacheEffect` components get a
    /// name assigned by the pipeline when they are constructed, since their
    /// final name depends on the owning variant/effect, not a dense counter.
    pub final_name_override: Option<FunctionId>,
    /// The synthesized interpreter dispatch wrapper for this component (§4.6),
    /// filled in by the pipeline after per-component optimization. Becomes
    /// this component's externally-visible entry at link time, in place of
    /// `entry` (the `impl` function), which survives the link only as an
    /// internal helper the wrapper tail-calls into.
    pub wrapper: Option<Function>,
}

pub struct ComponentFactory<'a> {
    source: &'a Module,
}

impl<'a> ComponentFactory<'a> {
    pub fn new(source: &'a Module) -> Self {
        ComponentFactory { source }
    }

    /// Build one component rooted at `entry`. The entry function is renamed
    /// to `<entry>_impl`, promoted to external linkage, and every other
    /// function in the produced module is left at whatever linkage it had
    /// in the source (dead-global elimination below removes anything
    /// unreferenced regardless of linkage).
    pub fn build(&self, kind: ComponentKind, entry: &FunctionId) -> Result<Component, FactoryError> {
        let entry_func = self
            .source
            .get(entry)
            .ok_or_else(|| FactoryError::UnknownFunction(entry.0.clone()))?;

        // Required precondition: the pipeline silently drops dead copies of
        // this function elsewhere in the source module by internalizing and
        // DCE'ing at link time, which is only sound if nothing outside this
        // component could have observed the pre-clone external symbol.
        if entry_func.linkage != Linkage::Internal {
            return Err(FactoryError::EntryNotInternal(entry.0.clone()));
        }

        let mut module = Module::new(&self.source.name);
        let reachable = reachable_from(self.source, entry);
        for name in &reachable {
            let f = self.source.get(name).expect("reachable set only contains functions present in source");
            module.add_function(f.clone());
        }

        let impl_name: FunctionId = format!("{}_impl", entry_func.name).into();
        if module.functions.contains_key(&impl_name) {
            return Err(FactoryError::RenameCollision(impl_name.0));
        }
        let mut renamed = module.functions.remove(entry).expect("entry is in its own reachable set");
        renamed.name = impl_name.clone();
        renamed.linkage = Linkage::External;
        module.functions.insert(impl_name.clone(), renamed);

        eliminate_dead_globals(&mut module, &impl_name);

        Ok(Component { kind, entry: impl_name, module, final_name_override: None, wrapper: None })
    }
}

fn reachable_from(source: &Module, entry: &FunctionId) -> FxHashSet<FunctionId> {
    let mut seen: FxHashSet<FunctionId> = FxHashSet::default();
    let mut stack = vec![entry.clone()];
    while let Some(name) = stack.pop() {
        if !seen.insert(name.clone()) {
            continue;
        }
        if let Some(f) = source.get(&name) {
            for r in f.referenced_functions() {
                if !seen.contains(&r) {
                    stack.push(r);
                }
            }
        }
    }
    seen
}

/// Remove every function in `module` not reachable from `entry`, e.g. after
/// renaming has changed which functions the component's root refers to.
fn eliminate_dead_globals(module: &mut Module, entry: &FunctionId) {
    let reachable = reachable_from(module, entry);
    let reachable: FxHashSet<FunctionId> =
        reachable.into_iter().chain(std::iter::once(entry.clone())).collect();
    module.functions.retain(|name, _| reachable.contains(name));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, Instr, ValueKind};

    fn make_chain_module() -> Module {
        let mut m = Module::new("test");
        let mut main = Function::new("Main");
        let dst = main.alloc_reg(ValueKind::Tagged);
        let callee = main.alloc_reg(ValueKind::Pointer);
        main.block_mut(main.entry).unwrap().instrs.push(Instr::MakeCall {
            dst,
            callee,
            args: vec![],
            cont: "Main_cont_0".into(),
        });
        m.add_function(main);
        m.add_function(Function::new("Main_cont_0"));
        m.add_function(Function::new("Unrelated"));
        m
    }

    #[test]
    fn build_renames_entry_and_promotes_linkage() {
        let m = make_chain_module();
        let factory = ComponentFactory::new(&m);
        let comp = factory.build(ComponentKind::Main, &"Main".into()).unwrap();
        assert_eq!(comp.entry, FunctionId::from("Main_impl"));
        let f = comp.module.get(&comp.entry).unwrap();
        assert_eq!(f.linkage, Linkage::External);
    }

    #[test]
    fn build_eliminates_unreachable_functions() {
        let m = make_chain_module();
        let factory = ComponentFactory::new(&m);
        let comp = factory.build(ComponentKind::Main, &"Main".into()).unwrap();
        assert!(comp.module.get(&"Unrelated".into()).is_none());
        assert!(comp.module.get(&"Main_cont_0".into()).is_some());
    }

    #[test]
    fn build_rejects_an_entry_that_is_not_internal_linkage() {
        let mut m = make_chain_module();
        let mut main = m.functions.remove(&"Main".into()).unwrap();
        main.linkage = Linkage::External;
        m.add_function(main);
        let factory = ComponentFactory::new(&m);
        let err = factory.build(ComponentKind::Main, &"Main".into()).unwrap_err();
        assert!(matches!(err, FactoryError::EntryNotInternal(_)));
    }

    #[test]
    fn build_errors_on_unknown_entry() {
        let m = make_chain_module();
        let factory = ComponentFactory::new(&m);
        let err = factory.build(ComponentKind::Main, &"Nope".into()).unwrap_err();
        assert!(matches!(err, FactoryError::UnknownFunction(_)));
    }

    #[test]
    fn inline_cache_api_is_only_allowed_on_main_and_fused_kinds() {
        assert!(ComponentKind::Main.allows_inline_cache_api());
        assert!(ComponentKind::FusedInInlineCacheEffect.allows_inline_cache_api());
        assert!(!ComponentKind::ReturnContinuation.allows_inline_cache_api());
        assert!(!ComponentKind::SlowPath.allows_inline_cache_api());
        assert!(!ComponentKind::QuickeningSlowPath.allows_inline_cache_api());
    }
}
