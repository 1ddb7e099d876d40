//! End-to-end scenarios exercising the full lowering pipeline against
//! small, hand-built bytecode handler definitions, mirroring the shape of
//! a real `Add`-style arithmetic opcode with a call-based slow path and a
//! quickened fast path.

use opforge::component::ComponentKind;
use opforge::config::BuildConfig;
use opforge::ir::{BinOp, Function, Instr, Module, Terminator, ValueKind};
use opforge::pipeline::lower_bytecode;
use opforge::stencil::{BytecodeBaselineJitTraits, CondBranchLatePatch, CondBranchLatePatchKind};
use opforge::typemask::{TypeMask, TypePrimitive};
use opforge::variant::{BytecodeVariantDefinition, MetadataPlacement, MetadataStructLayout, OperandKind, Quickening};

fn make_add_handler() -> Module {
    let mut module = Module::new("add_opcode");

    let mut main = Function::new("Main");
    let lhs = main.alloc_reg(ValueKind::Tagged);
    let rhs = main.alloc_reg(ValueKind::Tagged);
    let check = main.alloc_reg(ValueKind::Boolean);
    let sum = main.alloc_reg(ValueKind::Int64);

    let entry = main.entry;
    main.block_mut(entry).unwrap().instrs.push(Instr::TypeCheck {
        dst: check,
        value: lhs,
        mask: TypeMask::single(TypePrimitive::Int32),
    });
    main.block_mut(entry).unwrap().instrs.push(Instr::Binary {
        dst: sum,
        op: BinOp::Add,
        lhs,
        rhs,
    });
    main.block_mut(entry).unwrap().terminator = Terminator::Return(Some(sum));
    module.add_function(main);

    module
}

fn make_add_handler_with_call_slow_path() -> Module {
    let mut module = make_add_handler();

    let mut main = module.functions.remove(&"Main".into()).unwrap();
    let callee = main.alloc_reg(ValueKind::Pointer);
    let result = main.alloc_reg(ValueKind::Tagged);
    let entry = main.entry;
    main.block_mut(entry).unwrap().instrs.push(Instr::MakeCall {
        dst: result,
        callee,
        args: vec![],
        cont: "Main_cont_0".into(),
    });
    module.add_function(main);

    let mut cont = Function::new("Main_cont_0");
    let v = cont.alloc_reg(ValueKind::Tagged);
    cont.block_mut(cont.entry).unwrap().instrs.push(Instr::ReturnValueAccessor { dst: v });
    cont.block_mut(cont.entry).unwrap().terminator = Terminator::Return(Some(v));
    module.add_function(cont);

    module
}

fn add_variant() -> BytecodeVariantDefinition {
    BytecodeVariantDefinition::new("Add")
        .with_operand("lhs", OperandKind::Slot, Some(2))
        .with_operand("rhs", OperandKind::Slot, Some(2))
        .with_quickening(Quickening {
            name: "Add_II".into(),
            speculated: vec![("lhs".into(), TypeMask::single(TypePrimitive::Int32))],
        })
}

#[test]
fn simple_arithmetic_handler_lowers_to_a_linked_module() {
    let module = make_add_handler();
    let variant = add_variant();
    let config = BuildConfig::default();

    let result = lower_bytecode(&module, &"Main".into(), &variant, &config).expect("lowering should succeed");

    assert!(result.processed_module.get(&"Main_impl".into()).is_some());
    assert!(result.ic_sites.is_empty());
}

#[test]
fn handler_with_call_and_continuation_links_both_components() {
    let module = make_add_handler_with_call_slow_path();
    let variant = add_variant();
    let config = BuildConfig::default();

    let result = lower_bytecode(&module, &"Main".into(), &variant, &config).expect("lowering should succeed");

    assert!(result.processed_module.get(&"Main_impl".into()).is_some());
    assert!(result.processed_module.get(&"Add_retcont_0".into()).is_some());
}

#[test]
fn quickened_handler_also_links_a_quickening_slow_path_component() {
    let module = make_add_handler();
    let variant = add_variant();
    let config = BuildConfig::default();

    let result = lower_bytecode(&module, &"Main".into(), &variant, &config).expect("lowering should succeed");

    assert!(result.processed_module.get(&"Add_quickening_slowpath".into()).is_some());
}

#[test]
fn handler_with_fused_inline_cache_site_links_one_component_per_effect_kind() {
    let mut module = Module::new("get_by_id");
    let mut main = Function::new("Main");
    let obj = main.alloc_reg(ValueKind::Tagged);
    let entry = main.entry;
    main.block_mut(entry).unwrap().instrs.push(Instr::InlineCacheSite {
        site: "Ic0".into(),
        effect: "Hit".into(),
        value: obj,
    });
    main.block_mut(entry).unwrap().instrs.push(Instr::InlineCacheSite {
        site: "Ic0".into(),
        effect: "Miss".into(),
        value: obj,
    });
    main.block_mut(entry).unwrap().terminator = Terminator::Return(Some(obj));
    module.add_function(main);

    let variant = BytecodeVariantDefinition::new("GetById")
        .with_operand("obj", OperandKind::Slot, Some(2))
        .with_fused_ic_site("Ic0");
    let config = BuildConfig::default();

    let result = lower_bytecode(&module, &"Main".into(), &variant, &config).expect("lowering should succeed");

    assert!(result.ic_sites[0].fused);
    assert!(result.processed_module.get(&"Main_fused_Hit".into()).is_some());
    assert!(result.processed_module.get(&"Main_fused_Miss".into()).is_some());
    // A fused IC site rolls the effect into Main's own identity: no generic
    // per-effect IC body should exist alongside the fused specializations.
    assert!(result.processed_module.get(&"Main_impl_ic_Ic0_Hit".into()).is_none());
}

#[test]
fn variant_declaring_both_fused_ic_and_quickening_is_rejected() {
    let module = make_add_handler();
    let variant = BytecodeVariantDefinition::new("Add")
        .with_fused_ic_site("Ic0")
        .with_quickening(Quickening {
            name: "Add_II".into(),
            speculated: vec![("lhs".into(), TypeMask::single(TypePrimitive::Int32))],
        });
    let config = BuildConfig::default();

    let result = lower_bytecode(&module, &"Main".into(), &variant, &config);
    assert!(result.is_err());
}

#[test]
fn handler_with_inline_cache_site_reports_effect_kinds() {
    let mut module = Module::new("get_property");
    let mut main = Function::new("Main");
    let obj = main.alloc_reg(ValueKind::Tagged);
    let entry = main.entry;
    main.block_mut(entry).unwrap().instrs.push(Instr::InlineCacheSite {
        site: "Ic0".into(),
        effect: "Hit".into(),
        value: obj,
    });
    main.block_mut(entry).unwrap().instrs.push(Instr::InlineCacheSite {
        site: "Ic0".into(),
        effect: "Miss".into(),
        value: obj,
    });
    main.block_mut(entry).unwrap().terminator = Terminator::Return(Some(obj));
    module.add_function(main);

    let variant = BytecodeVariantDefinition::new("GetProperty").with_operand("obj", OperandKind::Slot, Some(2));
    let config = BuildConfig::default();

    let result = lower_bytecode(&module, &"Main".into(), &variant, &config).expect("lowering should succeed");

    assert_eq!(result.ic_sites.len(), 1);
    assert_eq!(result.ic_sites[0].site, "Ic0");
    assert_eq!(result.ic_sites[0].metadata_slots, vec!["Hit".to_string(), "Miss".to_string()]);
}

#[test]
fn lowering_is_reproducible_given_the_same_input() {
    let module = make_add_handler_with_call_slow_path();
    let variant = add_variant();
    let config = BuildConfig::default();

    let r1 = lower_bytecode(&module, &"Main".into(), &variant, &config).unwrap();
    let r2 = lower_bytecode(&module, &"Main".into(), &variant, &config).unwrap();

    assert_eq!(r1.symbol_digest, r2.symbol_digest);
}

#[test]
fn metadata_struct_with_large_size_goes_out_of_line() {
    let mut variant = add_variant();
    variant.metadata = Some(MetadataStructLayout {
        placement: MetadataPlacement::OutOfLine,
        size: 64,
        alignment: 8,
    });

    let module = make_add_handler();
    let config = BuildConfig::default();
    let result = lower_bytecode(&module, &"Main".into(), &variant, &config);
    assert!(result.is_ok());
}

#[test]
fn stencil_trait_record_stays_within_its_fixed_size() {
    let traits = BytecodeBaselineJitTraits::empty();
    assert_eq!(std::mem::size_of_val(&traits), BytecodeBaselineJitTraits::SIZE_BYTES);
}

#[test]
fn cond_branch_late_patch_int64_adds_in_place_semantics_are_exposed() {
    let patch = CondBranchLatePatch {
        patch_offset: 16,
        dst_bytecode_ptr_low32: 0,
        kind: CondBranchLatePatchKind::Int64,
    };
    let bytes = patch.compute_patch_bytes(0xDEAD_BEEF, 0);
    assert_eq!(bytes.len(), 8);
}

#[test]
fn component_kind_values_are_distinct() {
    assert_ne!(
        format!("{:?}", ComponentKind::Main),
        format!("{:?}", ComponentKind::SlowPath)
    );
}
