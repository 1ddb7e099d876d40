//! Top-level entry point: runs the nine pipeline stages over one bytecode
//! handler definition in order and produces the external-interface
//! artifacts a downstream consumer needs.

use crate::builder_gen;
use crate::component::{Component, ComponentFactory, ComponentKind};
use crate::config::BuildConfig;
use crate::diagnostics::PipelineError;
use crate::discovery::discover;
use crate::ic::{extract_sites, fused_component_name, lower_site, validate_fusion};
use crate::ir::{Function, FunctionId, Module};
use crate::link::{merge_components, prune_unreachable, symbol_set_digest, NameReservation, Section};
use crate::lowering::{
    check_fully_lowered, normalize_linkage, peephole_collapse_trivial_moves, rewrite_meta_api_targets,
    run_final_lowering,
};
use crate::metadata::MetadataRegistry;
use crate::optimize::Optimizer;
use crate::variant::{finalize_same_length_constraints, BytecodeVariantDefinition};
use crate::wrapper::synthesize_wrapper;
use rustc_hash::FxHashMap;

/// Computes the final, same-length-constraint-equalized encoded bytecode
/// struct length for every variant in a sibling group (e.g. an opcode's
/// base variant together with all of its quickenings), so callers can feed
/// the result into `lower_bytecode`'s `bytecode_struct_size` override
/// instead of each variant's unequalized `tentative_length`.
///
/// `variants` need not all share the same `same_length_constraints` list
/// verbatim; every constraint any member declares is applied to the whole
/// group's tentative lengths.
pub fn finalize_variant_group_lengths(
    variants: &[BytecodeVariantDefinition],
    config: &BuildConfig,
) -> FxHashMap<String, u32> {
    let opcode_width = config.opcode_width.bytes();
    let mut tentative: FxHashMap<String, u32> = FxHashMap::default();
    for v in variants {
        tentative.insert(v.name.clone(), v.tentative_length(opcode_width));
    }
    let mut constraints = Vec::new();
    for v in variants {
        constraints.extend(v.same_length_constraints.iter().cloned());
    }
    finalize_same_length_constraints(&tentative, &constraints)
}

/// One generated audit artifact: a human-readable side record of what a
/// build produced, for downstream tooling to diff across runs without
/// parsing the generated header itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditFile {
    pub name: String,
    pub contents: String,
}

/// Everything a consumer of the lowering pipeline gets back for one
/// bytecode handler: the final linked module, the inline-cache lowering
/// results for every site observed in the handler's Main component, and the
/// generated-header/extern-C/audit artifacts a downstream build driver
/// writes to disk (§6's entry-point contract).
#[derive(Debug)]
pub struct LoweredOpcode {
    /// The linked, pruned module: every surviving component's final entry
    /// (a synthesized wrapper where one was built, the renamed `impl`
    /// otherwise) plus whatever internal helpers are actually reachable
    /// from those entries.
    pub processed_module: Module,
    /// Main's externally-visible final entry name (the variant's own name,
    /// carried by its synthesized wrapper).
    pub entry: FunctionId,
    pub ic_sites: Vec<crate::ic::IcSiteLowering>,
    pub symbol_digest: String,
    /// Every externally-visible entry this build produced, together with
    /// the hot/cold section it was assigned at link time.
    pub sections: Vec<(FunctionId, Section)>,
    pub generated_header_file: String,
    pub all_extern_c_declarations: Vec<String>,
    pub audit_files: Vec<AuditFile>,
}

/// Lowers one bytecode handler, defined in `source` rooted at `main_entry`,
/// against `variant`, using `config` for width/alignment knobs.
///
/// The variant's own `fixed_operand_width` is used for stage 5's metadata
/// placement. Callers whose variant participates in a `SameLengthConstraint`
/// group should use `lower_bytecode_with_finalized_length` instead, passing
/// the length `finalize_variant_group_lengths` computed across the whole
/// sibling group.
pub fn lower_bytecode(
    source: &Module,
    main_entry: &FunctionId,
    variant: &BytecodeVariantDefinition,
    config: &BuildConfig,
) -> Result<LoweredOpcode, PipelineError> {
    lower_bytecode_with_finalized_length(source, main_entry, variant, config, None)
}

/// As `lower_bytecode`, but uses `finalized_length` (when given) as the
/// encoded bytecode-struct size stage 5 places this variant's metadata
/// after, rather than recomputing it from the variant alone. Pass the value
/// `finalize_variant_group_lengths` returned for this variant's name.
pub fn lower_bytecode_with_finalized_length(
    source: &Module,
    main_entry: &FunctionId,
    variant: &BytecodeVariantDefinition,
    config: &BuildConfig,
    finalized_length: Option<u32>,
) -> Result<LoweredOpcode, PipelineError> {
    // A variant's fused-IC declaration and its quickening list are mutually
    // exclusive; reject the malformed combination before anything else runs.
    validate_fusion(variant)?;

    // Stage 1: control-flow discovery.
    let discovery = discover(source, main_entry)?;

    // Stage 2: component factory. One component for Main, one for every
    // discovered return continuation and slow path, visited in
    // lexicographic order for determinism, plus one quickening slow path
    // when the variant declares a quickening fast path. Main and every
    // return continuation get a `final_name_override` here, since their
    // link-time name depends on the owning variant rather than a dense
    // counter `merge_components` can assign on its own (§6's entry-point
    // naming: return continuations are named `<variant>_retcont_<k>`, `k`
    // dense over the lexicographic order of their original names).
    let factory = ComponentFactory::new(source);
    let mut components: Vec<Component> = Vec::new();
    let mut main_component = factory.build(ComponentKind::Main, main_entry)?;
    main_component.final_name_override = Some(variant.name.clone().into());
    components.push(main_component);

    let mut conts: Vec<FunctionId> = discovery.return_continuations.iter().cloned().collect();
    conts.sort();
    for (k, c) in conts.iter().enumerate() {
        let mut cont_component = factory.build(ComponentKind::ReturnContinuation, c)?;
        cont_component.final_name_override = Some(format!("{}_retcont_{}", variant.name, k).into());
        components.push(cont_component);
    }

    let mut slow_paths: Vec<FunctionId> = discovery.slow_paths.iter().cloned().collect();
    slow_paths.sort();
    for s in &slow_paths {
        components.push(factory.build(ComponentKind::SlowPath, s)?);
    }

    if variant.has_quickening() {
        let mut quickening_slow_path = factory.build(ComponentKind::QuickeningSlowPath, main_entry)?;
        quickening_slow_path.final_name_override =
            Some(format!("{}_quickening_slowpath", variant.name).into());
        components.push(quickening_slow_path);
    }

    // Translates `MakeCall`'s pre-merge continuation name and
    // `EnterSlowPath`'s pre-merge target name into the name that function
    // will actually carry once linked. A return continuation has no
    // synthesized wrapper (it is a direct tail-dispatch target, not a
    // bytecode-decoded interpreter entry), so it is renamed in place to its
    // override at merge time and must be addressed by that name; a slow
    // path likewise has no wrapper and is renamed to its dense
    // `_slow_path_<k>` name, in the same order `merge_components` assigns
    // it.
    let mut component_final_names: FxHashMap<FunctionId, FunctionId> = FxHashMap::default();
    for (k, c) in conts.iter().enumerate() {
        component_final_names.insert(c.clone(), format!("{}_retcont_{}", variant.name, k).into());
    }
    for (k, s) in slow_paths.iter().enumerate() {
        component_final_names.insert(s.clone(), format!("_slow_path_{}", k).into());
    }

    // Stage 3: per-component optimization, each component's pass variant
    // chosen from its kind and whether the variant has a quickening.
    for component in &mut components {
        let optimizer = Optimizer::for_component(component.kind, variant.has_quickening());
        if let Some(f) = component.module.get_mut(&component.entry) {
            optimizer.optimize(f);
        }
    }

    // Stage 4: inline-cache lowering, scanned from the (now optimized) Main
    // component only, matching the decided ordering in SPEC_FULL.md. If the
    // variant declares a fused IC site, one `FusedInInlineCacheEffect` Main
    // specialization is instantiated per effect kind observed at that site
    // instead of a generic IC body. For a non-fused site, the real
    // `PreserveMost` body function `lower_site` built is inserted into
    // Main's own module and every occurrence of that effect kind is
    // rewritten from a bare marker into a genuine call, so the body is
    // reachable from the linked module rather than pruned away as dead.
    let main_component_entry = components[0].entry.clone();
    let main_func = components[0]
        .module
        .get(&main_component_entry)
        .expect("Main component always contains its own entry");
    let raw_sites = extract_sites(main_func);
    let mut site_names: Vec<String> = raw_sites.keys().cloned().collect();
    site_names.sort();
    let mut ic_sites = Vec::with_capacity(site_names.len());
    for name in &site_names {
        let fused = variant.fused_ic_site.as_deref() == Some(name.as_str());
        ic_sites.push(lower_site(&main_component_entry, name, &raw_sites[name], fused)?);
    }
    for site in &ic_sites {
        if site.fused {
            for effect in &site.metadata_slots {
                let mut fused_component = factory.build(ComponentKind::FusedInInlineCacheEffect, main_entry)?;
                let optimizer = Optimizer::for_component(fused_component.kind, false);
                if let Some(f) = fused_component.module.get_mut(&fused_component.entry) {
                    optimizer.optimize(f);
                }
                fused_component.final_name_override = Some(fused_component_name(main_entry, effect));
                components.push(fused_component);
            }
        } else {
            for body in &site.bodies {
                components[0].module.add_function(body.function.clone());
                let main_func = components[0]
                    .module
                    .get_mut(&main_component_entry)
                    .expect("Main component always contains its own entry");
                crate::ic::rewrite_site_occurrences_to_calls(
                    main_func,
                    &site.site,
                    &body.effect,
                    body.function.name.clone(),
                );
            }
        }
    }

    // Stage 5: metadata layout finalization. The bytecode-struct size a
    // variant's metadata is placed after is the same-length-constraint-
    // equalized length when the caller supplied one (a sibling group member),
    // falling back to this variant's own tentative length otherwise.
    let mut metadata = MetadataRegistry::new(config.clone());
    let bytecode_struct_size =
        finalized_length.unwrap_or_else(|| variant.tentative_length(config.opcode_width.bytes()));
    if let Some(layout) = &variant.metadata {
        metadata.register(&variant.name, layout.size, layout.alignment, bytecode_struct_size)?;
    }
    let metadata_ptr_offset =
        metadata.entries().iter().find(|e| e.variant_name == variant.name).map(|e| e.offset as i32);

    // Stage 6: wrapper synthesis. Only the components genuinely invoked
    // through the interpreter's bytecode-decode dispatch ABI get a
    // synthesized wrapper: Main, its fused-IC specializations, and the
    // quickening slow path (which re-materializes already-decoded operands
    // instead of reloading them). Return continuations and ordinary slow
    // paths are reached by a direct, argument-passing tail call from
    // within an already-running handler, not by bytecode dispatch, so they
    // keep no wrapper and are simply renamed to their final entry at link
    // time.
    let quickening_final_name: Option<FunctionId> = components
        .iter()
        .find(|c| c.kind == ComponentKind::QuickeningSlowPath)
        .and_then(|c| c.final_name_override.clone());
    for component in &mut components {
        if !matches!(
            component.kind,
            ComponentKind::Main | ComponentKind::FusedInInlineCacheEffect | ComponentKind::QuickeningSlowPath
        ) {
            continue;
        }
        let impl_entry = component.entry.clone();
        let wrapper_name: FunctionId = format!("{}_wrapper", component.entry).into();
        let quickening_slow_path_entry = if matches!(
            component.kind,
            ComponentKind::Main | ComponentKind::FusedInInlineCacheEffect
        ) {
            quickening_final_name.as_ref()
        } else {
            None
        };
        let build =
            synthesize_wrapper(wrapper_name, variant, component.kind, &impl_entry, quickening_slow_path_entry)?;
        component.wrapper = Some(build.function);
    }

    // Stage 7: final lowering. Every function in every component's module
    // (not just its own entry), plus each component's synthesized wrapper,
    // is brought through the ordered meta-API lowering sequence, after
    // first translating any `MakeCall`/`EnterSlowPath` reference to the
    // name that function will carry once linked.
    for component in &mut components {
        for f in component.module.functions.values_mut() {
            rewrite_meta_api_targets(f, &component_final_names);
            run_final_lowering(f, metadata_ptr_offset);
            peephole_collapse_trivial_moves(f);
            check_fully_lowered(f)?;
        }
        if let Some(wrapper) = component.wrapper.as_mut() {
            rewrite_meta_api_targets(wrapper, &component_final_names);
            run_final_lowering(wrapper, metadata_ptr_offset);
            peephole_collapse_trivial_moves(wrapper);
            check_fully_lowered(wrapper)?;
        }
    }

    // Stage 8: link & prune.
    let mut final_module = Module::new(&source.name);
    let mut reservation = NameReservation::new();

    for component in &mut components {
        let entry = component.entry.clone();
        let mut all: Vec<&mut Function> = component.module.functions.values_mut().collect();
        normalize_linkage(&mut all, &entry);
    }

    // `merge_components` returns each component's final, post-rename entry
    // name (e.g. `_slow_path_0` rather than the pre-rename `Foo_slow_0_impl`)
    // together with its hot/cold section, so pruning below roots its
    // reachability walk at names that actually exist in `final_module`.
    let entries = merge_components(&mut final_module, components, &mut reservation)?;
    let entry_names: Vec<FunctionId> = entries.iter().map(|(name, _)| name.clone()).collect();
    prune_unreachable(&mut final_module, &entry_names);

    let digest = symbol_set_digest(&final_module);

    // Stage 9: builder generator. Produces the generated dispatch header,
    // the extern-C declarations a downstream build driver emits into it,
    // and the audit side files that let tooling detect an unintended
    // change in a regenerated build without diffing the whole header.
    let (generated_header_file, all_extern_c_declarations, audit_files) = render_header(variant, &entries)?;

    let main_final_entry: FunctionId = variant.name.clone().into();

    Ok(LoweredOpcode {
        entry: main_final_entry,
        processed_module: final_module,
        ic_sites,
        symbol_digest: digest,
        sections: entries,
        generated_header_file,
        all_extern_c_declarations,
        audit_files,
    })
}

/// Renders the generated dispatch header's extern-C declaration list (one
/// per externally-visible entry this build produced) and an audit file
/// recording the variant's builder dispatch-tree shape alongside a sample
/// encoded bytecode struct, so a downstream consumer can detect a change in
/// either without diffing the whole generated header.
fn render_header(
    variant: &BytecodeVariantDefinition,
    entries: &[(FunctionId, Section)],
) -> Result<(String, Vec<String>, Vec<AuditFile>), PipelineError> {
    let tree = builder_gen::build_dispatch_tree(variant)?;

    let mut declarations = Vec::with_capacity(entries.len());
    for (name, _) in entries {
        declarations.push(format!("extern \"C\" void {}(void);", name));
    }

    let mut header = String::new();
    header.push_str(&format!("// Generated interpreter dispatch header for `{}`.\n", variant.name));
    header.push_str("#pragma once\n\n");
    for decl in &declarations {
        header.push_str(decl);
        header.push('\n');
    }

    let checksum = builder_gen::header_checksum(header.as_bytes());
    let sample_bytes = builder_gen::encode_bytecode_struct(0, variant, &[]);

    let audit_files = vec![AuditFile {
        name: format!("{}.audit.txt", variant.name),
        contents: format!(
            "variant={}\ndispatch_arms={}\nentries={}\nheader_checksum={:08x}\nsample_bytecode_struct={}\n",
            variant.name,
            tree.arms.len(),
            entries.len(),
            checksum,
            hex::encode(&sample_bytes),
        ),
    }];

    Ok((header, declarations, audit_files))
}
