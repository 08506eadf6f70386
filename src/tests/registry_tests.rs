//! Function registries and template loading.

use std::io::Write as _;

use inkwell::context::Context;
use pretty_assertions::assert_eq;

use crate::error::CodegenError;
use crate::tests::{TEMPLATE_IR, TEMPLATE_IR_FULL};
use crate::{CodegenEngine, FnPrototype, TemplateFn};

fn trivial_fn<'ctx>(
    engine: &CodegenEngine<'ctx>,
    context: &'ctx Context,
    name: &str,
) -> inkwell::values::FunctionValue<'ctx> {
    let builder = context.create_builder();
    let proto = FnPrototype::new(engine, name, Some(context.i64_type().into()));
    let (function, _) = proto.generate(Some(&builder));
    let ret = context.i64_type().const_int(0, false);
    builder.build_return(Some(&ret)).unwrap();
    function
}

#[test]
fn expr_fn_registration_is_write_once() {
    let context = Context::create();
    let engine = CodegenEngine::new(&context, "registry").unwrap();
    let f = trivial_fn(&engine, &context, "expr_a");
    let g = trivial_fn(&engine, &context, "expr_b");

    assert!(engine.lookup_expr_fn(17).is_none());
    engine.register_expr_fn(17, f).unwrap();
    assert_eq!(engine.lookup_expr_fn(17), Some(f));

    let err = engine.register_expr_fn(17, g).unwrap_err();
    assert!(matches!(err, CodegenError::DuplicateExprId(17)));
    // The original registration survives the rejected duplicate.
    assert_eq!(engine.lookup_expr_fn(17), Some(f));
}

#[test]
fn defined_functions_excludes_declarations() {
    let context = Context::create();
    let engine = CodegenEngine::new(&context, "registry").unwrap();
    let defined = trivial_fn(&engine, &context, "has_body");

    let mut decl = FnPrototype::new(&engine, "body_elsewhere", None);
    decl.add_arg("row", engine.ptr_type().into());
    let (declared, _) = decl.generate(None);

    let functions = engine.defined_functions();
    assert!(functions.contains(&defined));
    assert!(!functions.contains(&declared));
}

#[test]
fn get_template_resolves_loaded_symbols() {
    let context = Context::create();
    let engine = CodegenEngine::from_ir(&context, "templates", TEMPLATE_IR).unwrap();

    let batch = engine.get_template(TemplateFn::AggProcessBatch).unwrap();
    assert_eq!(
        batch.get_name().to_string_lossy(),
        "reef_agg_process_batch"
    );
    assert!(!engine.is_corrupt());
}

#[test]
fn missing_template_marks_engine_corrupt() {
    let context = Context::create();
    let engine = CodegenEngine::from_ir(&context, "templates", TEMPLATE_IR).unwrap();

    assert!(engine.get_template(TemplateFn::SortCompareRows).is_none());
    assert!(engine.is_corrupt());
}

#[test]
fn malformed_ir_is_rejected() {
    let context = Context::create();
    let err = CodegenEngine::from_ir(&context, "bad", "define i32 @broken(").unwrap_err();
    assert!(matches!(err, CodegenError::TemplateLoad(_)));
}

#[test]
fn template_file_load_requires_every_symbol() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(TEMPLATE_IR.as_bytes()).unwrap();

    let context = Context::create();
    let err = CodegenEngine::from_template_file(&context, file.path()).unwrap_err();
    assert!(matches!(
        err,
        CodegenError::MissingTemplate("reef_join_process_build_batch")
    ));
}

#[test]
fn template_file_load_resolves_full_module() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(TEMPLATE_IR_FULL.as_bytes()).unwrap();

    let context = Context::create();
    let engine = CodegenEngine::from_template_file(&context, file.path()).unwrap();
    for kind in TemplateFn::ALL {
        assert!(engine.get_template(kind).is_some(), "missing {kind:?}");
    }
    assert!(!engine.is_corrupt());
}
