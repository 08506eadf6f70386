//! Function prototype materialization.

use inkwell::context::Context;
use pretty_assertions::assert_eq;

use crate::engine::FnState;
use crate::{CodegenEngine, FnPrototype, LogicalType};

#[test]
fn generates_declaration_without_builder() {
    let context = Context::create();
    let engine = CodegenEngine::new(&context, "proto").unwrap();

    let mut proto = FnPrototype::new(&engine, "eval_slot", Some(engine.llvm_type(LogicalType::BigInt)));
    proto
        .add_arg("row", engine.ptr_type().into())
        .add_arg("slot_idx", engine.llvm_type(LogicalType::Int));
    let (function, params) = proto.generate(None);

    assert_eq!(function.get_name().to_string_lossy(), "eval_slot");
    assert_eq!(params.len(), 2);
    assert_eq!(function.count_basic_blocks(), 0);
    assert_eq!(engine.state_of(function), Some(FnState::Declared));
    assert_eq!(
        function.get_params()[1].get_name().to_string_lossy(),
        "slot_idx"
    );
}

#[test]
fn generate_with_builder_creates_entry_block() {
    let context = Context::create();
    let engine = CodegenEngine::new(&context, "proto").unwrap();
    let builder = context.create_builder();

    let proto = FnPrototype::new(&engine, "const_true", Some(context.bool_type().into()));
    let (function, _) = proto.generate(Some(&builder));
    builder.build_return(Some(&engine.true_value())).unwrap();

    assert_eq!(function.count_basic_blocks(), 1);
    assert_eq!(engine.state_of(function), Some(FnState::Defined));
    assert!(engine.verify_function(function));
}

#[test]
fn void_return_type() {
    let context = Context::create();
    let engine = CodegenEngine::new(&context, "proto").unwrap();
    let builder = context.create_builder();

    let mut proto = FnPrototype::new(&engine, "do_nothing", None);
    proto.add_arg("row", engine.ptr_type().into());
    let (function, _) = proto.generate(Some(&builder));
    builder.build_return(None).unwrap();

    assert!(function.get_type().get_return_type().is_none());
    assert!(engine.verify_function(function));
}

#[test]
fn reuses_existing_declaration() {
    let context = Context::create();
    let engine = CodegenEngine::new(&context, "proto").unwrap();

    let mut first = FnPrototype::new(&engine, "shared", Some(context.i64_type().into()));
    first.add_arg("row", engine.ptr_type().into());
    let (declared, _) = first.generate(None);

    // Defining through a second prototype picks up the declaration instead
    // of minting a duplicate symbol.
    let builder = context.create_builder();
    let mut second = FnPrototype::new(&engine, "shared", Some(context.i64_type().into()));
    second.add_arg("row", engine.ptr_type().into());
    let (defined, _) = second.generate(Some(&builder));
    let ret = context.i64_type().const_int(1, false);
    builder.build_return(Some(&ret)).unwrap();

    assert_eq!(declared, defined);
    assert_eq!(engine.state_of(defined), Some(FnState::Defined));
}

#[test]
#[should_panic(expected = "different signature")]
fn reuse_with_mismatched_signature_panics() {
    let context = Context::create();
    let engine = CodegenEngine::new(&context, "proto").unwrap();

    let mut first = FnPrototype::new(&engine, "shared", Some(context.i64_type().into()));
    first.add_arg("row", engine.ptr_type().into());
    let _ = first.generate(None);

    // Same name, narrower return type: silently reusing the declaration
    // would hand back a function with the wrong type.
    let mut second = FnPrototype::new(&engine, "shared", Some(context.i32_type().into()));
    second.add_arg("row", engine.ptr_type().into());
    let _ = second.generate(None);
}

#[test]
#[should_panic(expected = "after the module is compiled")]
fn generate_after_compile_panics() {
    let context = Context::create();
    let engine = CodegenEngine::new(&context, "proto").unwrap();
    engine.enable_optimizations(false);
    engine.optimize_module().unwrap();

    let mut proto = FnPrototype::new(&engine, "too_late", None);
    let _ = proto.generate(None);
}
