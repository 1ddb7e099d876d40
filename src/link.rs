//! Link & prune: assembles every component's module into one final linked
//! module, assigns each function to a hot or cold section, internalizes
//! and dead-code-eliminates whatever the components don't actually need,
//! then re-externalizes exactly the symbols the external interface
//! requires, renaming anonymous slow paths deterministically.

use crate::diagnostics::LinkError;
use crate::ir::{FunctionId, Linkage, Module};
use rustc_hash::FxHashSet;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Hot,
    Cold,
}

/// Tracks reserved symbol names across the whole link; every insertion is
/// checked free first, matching the "every name is checked free before
/// insertion" requirement.
#[derive(Debug, Default)]
pub struct NameReservation {
    names: FxHashSet<String>,
}

impl NameReservation {
    pub fn new() -> Self {
        NameReservation::default()
    }

    pub fn reserve(&mut self, name: impl Into<String>) -> Result<(), LinkError> {
        let name = name.into();
        if !self.names.insert(name.clone()) {
            return Err(LinkError::NameCollision(name));
        }
        Ok(())
    }
}

/// Decide which section a function belongs to. IC bodies are always placed
/// in the hot/default section for now.
// TODO: move IC bodies to the cold section once a profile source exists to
// tell us which effect kind is actually hot; without that signal this
// pipeline cannot make the decision any better than "assume hot".
pub fn section_for(kind: crate::component::ComponentKind, is_ic_body: bool) -> Section {
    if is_ic_body {
        return Section::Hot;
    }
    use crate::component::ComponentKind::*;
    match kind {
        Main | ReturnContinuation | FusedInInlineCacheEffect => Section::Hot,
        SlowPath | QuickeningSlowPath => Section::Cold,
    }
}

/// Merges every component's module into `dest`, renaming slow-path entries
/// deterministically (`_slow_path_<k>`, `k` assigned in the order slow
/// paths are presented, which callers are expected to have already sorted
/// lexicographically by original name for reproducibility). When a
/// component carries a synthesized wrapper (§4.6), that wrapper — not the
/// `impl` function — becomes the component's externally-visible final
/// entry; `impl` survives the link as an ordinary internal helper, reachable
/// only via the wrapper's own tail call into it. Returns each component's
/// final entry name together with its hot/cold section, in the same order
/// the components were given, so callers can use the names as the root set
/// for `prune_unreachable` and the sections to annotate the linked module.
pub fn merge_components(
    dest: &mut Module,
    components: Vec<crate::component::Component>,
    reservation: &mut NameReservation,
) -> Result<Vec<(FunctionId, Section)>, LinkError> {
    let mut slow_path_counter = 0u32;
    let mut final_entries = Vec::with_capacity(components.len());
    for component in components {
        let mut module = component.module;
        let final_entry: FunctionId = if let Some(name) = component.final_name_override.clone() {
            name
        } else {
            match component.kind {
                crate::component::ComponentKind::SlowPath => {
                    let name: FunctionId = format!("_slow_path_{}", slow_path_counter).into();
                    slow_path_counter += 1;
                    name
                }
                _ => component.entry.clone(),
            }
        };

        match component.wrapper {
            Some(mut wrapper) => {
                wrapper.name = final_entry.clone();
                wrapper.linkage = Linkage::External;
                module.add_function(wrapper);
            }
            None => {
                if final_entry != component.entry {
                    let mut f = module
                        .functions
                        .remove(&component.entry)
                        .expect("component entry missing from its own module");
                    f.name = final_entry.clone();
                    module.functions.insert(final_entry.clone(), f);
                }
            }
        }

        reservation.reserve(final_entry.0.clone())?;
        let section = section_for(component.kind, false);
        final_entries.push((final_entry.clone(), section));

        for (name, func) in module.functions {
            if name == final_entry {
                dest.functions.insert(name, func);
            } else {
                // Non-entry helper functions pulled in from a component's
                // own module; internalize unconditionally; prune_unreachable
                // below removes anything not actually used.
                let mut func = func;
                func.linkage = Linkage::Internal;
                dest.functions.entry(name).or_insert(func);
            }
        }
    }
    Ok(final_entries)
}

/// Removes every function in `module` not reachable from the set of
/// externally-visible entry points, after the merge above has internalized
/// everything that isn't one of those entries.
pub fn prune_unreachable(module: &mut Module, externally_visible: &[FunctionId]) {
    let mut reachable: FxHashSet<FunctionId> = FxHashSet::default();
    let mut stack: Vec<FunctionId> = externally_visible.to_vec();
    while let Some(name) = stack.pop() {
        if !reachable.insert(name.clone()) {
            continue;
        }
        if let Some(f) = module.get(&name) {
            for r in f.referenced_functions() {
                if !reachable.contains(&r) {
                    stack.push(r);
                }
            }
        }
    }
    module.functions.retain(|name, _| reachable.contains(name));
}

/// A deterministic checksum of the final linked module's symbol set, used
/// by downstream audit tooling to detect an unintended change in which
/// symbols a build produced.
pub fn symbol_set_digest(module: &Module) -> String {
    let mut names = module.sorted_function_names();
    names.sort();
    let mut hasher = Sha256::new();
    for name in &names {
        hasher.update(name.0.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentKind;
    use crate::ir::Function;

    #[test]
    fn name_reservation_rejects_duplicate_insert() {
        let mut r = NameReservation::new();
        r.reserve("Main_impl").unwrap();
        let err = r.reserve("Main_impl").unwrap_err();
        assert!(matches!(err, LinkError::NameCollision(_)));
    }

    #[test]
    fn merge_components_renames_slow_paths_deterministically() {
        let mut dest = Module::new("final");
        let mut slow_module = Module::new("comp");
        slow_module.add_function(Function::new("Main_impl"));
        let comp = crate::component::Component {
            kind: ComponentKind::SlowPath,
            entry: "Main_impl".into(),
            module: slow_module,
            final_name_override: None,
            wrapper: None,
        };
        let mut reservation = NameReservation::new();
        let entries = merge_components(&mut dest, vec![comp], &mut reservation).unwrap();
        assert!(dest.get(&"_slow_path_0".into()).is_some());
        assert!(dest.get(&"Main_impl".into()).is_none());
        assert_eq!(entries, vec![(FunctionId::from("_slow_path_0"), Section::Cold)]);
    }

    #[test]
    fn merge_components_honors_a_final_name_override() {
        let mut dest = Module::new("final");
        let mut module = Module::new("comp");
        module.add_function(Function::new("Main_impl"));
        let comp = crate::component::Component {
            kind: ComponentKind::QuickeningSlowPath,
            entry: "Main_impl".into(),
            module,
            final_name_override: Some("Add_quickening_slowpath".into()),
            wrapper: None,
        };
        let mut reservation = NameReservation::new();
        merge_components(&mut dest, vec![comp], &mut reservation).unwrap();
        assert!(dest.get(&"Add_quickening_slowpath".into()).is_some());
        assert!(dest.get(&"Main_impl".into()).is_none());
    }

    #[test]
    fn merge_components_promotes_the_wrapper_and_keeps_impl_as_an_internal_helper() {
        let mut dest = Module::new("final");
        let mut module = Module::new("comp");
        module.add_function(Function::new("Main_impl"));
        let comp = crate::component::Component {
            kind: ComponentKind::Main,
            entry: "Main_impl".into(),
            module,
            final_name_override: Some("Add".into()),
            wrapper: Some(Function::new("Main_wrapper")),
        };
        let mut reservation = NameReservation::new();
        let entries = merge_components(&mut dest, vec![comp], &mut reservation).unwrap();
        assert_eq!(entries, vec![(FunctionId::from("Add"), Section::Hot)]);
        let entry_fn = dest.get(&"Add".into()).unwrap();
        assert_eq!(entry_fn.linkage, Linkage::External);
        let impl_fn = dest.get(&"Main_impl".into()).unwrap();
        assert_eq!(impl_fn.linkage, Linkage::Internal);
    }

    #[test]
    fn prune_unreachable_drops_unused_helpers() {
        let mut module = Module::new("final");
        module.add_function(Function::new("Main_impl"));
        module.add_function(Function::new("Unused_helper"));
        prune_unreachable(&mut module, &["Main_impl".into()]);
        assert!(module.get(&"Unused_helper".into()).is_none());
        assert!(module.get(&"Main_impl".into()).is_some());
    }

    #[test]
    fn symbol_set_digest_is_stable_for_same_input() {
        let mut m = Module::new("final");
        m.add_function(Function::new("Main_impl"));
        m.add_function(Function::new("_slow_path_0"));
        let a = symbol_set_digest(&m);
        let b = symbol_set_digest(&m);
        assert_eq!(a, b);
    }

    #[test]
    fn ic_bodies_are_always_hot() {
        assert_eq!(section_for(ComponentKind::SlowPath, true), Section::Hot);
        assert_eq!(section_for(ComponentKind::SlowPath, false), Section::Cold);
    }

    #[test]
    fn fused_ic_specializations_and_quickening_slow_paths_land_in_the_expected_sections() {
        assert_eq!(section_for(ComponentKind::FusedInInlineCacheEffect, false), Section::Hot);
        assert_eq!(section_for(ComponentKind::QuickeningSlowPath, false), Section::Cold);
    }
}
