//! Template cloning and call-site replacement.

use inkwell::context::Context;
use pretty_assertions::assert_eq;

use crate::engine::FnState;
use crate::error::CodegenError;
use crate::tests::{count_calls_to, count_instructions, TEMPLATE_IR};
use crate::{CodegenEngine, FnPrototype, TemplateFn};

/// An update function compatible with the `reef_agg_update_row` signature:
/// triples the row's first slot instead of doubling it.
fn triple_update<'ctx>(
    engine: &CodegenEngine<'ctx>,
    context: &'ctx Context,
) -> inkwell::values::FunctionValue<'ctx> {
    let builder = context.create_builder();
    let mut proto = FnPrototype::new(engine, "my_update", Some(context.i64_type().into()));
    proto.add_arg("row", engine.ptr_type().into());
    let (function, params) = proto.generate(Some(&builder));

    let slot = builder
        .build_load(context.i64_type(), params[0].into_pointer_value(), "slot")
        .unwrap()
        .into_int_value();
    let tripled = builder
        .build_int_mul(slot, context.i64_type().const_int(3, false), "tripled")
        .unwrap();
    builder.build_return(Some(&tripled)).unwrap();
    function
}

#[test]
fn replace_call_sites_clones_by_default() {
    let context = Context::create();
    let engine = CodegenEngine::from_ir(&context, "spec", TEMPLATE_IR).unwrap();
    let template = engine.get_template(TemplateFn::AggProcessBatch).unwrap();
    let update = triple_update(&engine, &context);

    let (clone, replaced) = engine
        .replace_call_sites(template, false, update, "reef_agg_update_row")
        .unwrap();

    assert_eq!(replaced, 1);
    assert_ne!(clone, template);
    assert!(clone.get_name().to_string_lossy().contains(".clone"));
    assert_eq!(engine.state_of(clone), Some(FnState::Defined));

    // The clone is structurally identical and the original is untouched.
    assert_eq!(count_instructions(clone), count_instructions(template));
    assert_eq!(count_calls_to(template, "reef_agg_update_row"), 1);
    assert_eq!(count_calls_to(clone, "reef_agg_update_row"), 0);
    assert_eq!(count_calls_to(clone, "my_update"), 1);

    assert!(engine.verify_function(clone));
    assert!(engine.verify_function(template));
}

#[test]
fn repeated_clones_get_distinct_names() {
    let context = Context::create();
    let engine = CodegenEngine::from_ir(&context, "spec", TEMPLATE_IR).unwrap();
    let template = engine.get_template(TemplateFn::AggProcessBatch).unwrap();
    let update = triple_update(&engine, &context);

    let (first, _) = engine
        .replace_call_sites(template, false, update, "reef_agg_update_row")
        .unwrap();
    let (second, _) = engine
        .replace_call_sites(template, false, update, "reef_agg_update_row")
        .unwrap();

    assert_ne!(first.get_name(), second.get_name());
}

#[test]
fn zero_matches_is_not_an_error() {
    let context = Context::create();
    let engine = CodegenEngine::from_ir(&context, "spec", TEMPLATE_IR).unwrap();
    let template = engine.get_template(TemplateFn::AggProcessBatch).unwrap();
    let update = triple_update(&engine, &context);

    let (clone, replaced) = engine
        .replace_call_sites(template, false, update, "no_such_symbol")
        .unwrap();
    assert_eq!(replaced, 0);
    assert_eq!(count_calls_to(clone, "reef_agg_update_row"), 1);
}

#[test]
fn in_place_replacement_mutates_the_caller() {
    let context = Context::create();
    let engine = CodegenEngine::from_ir(&context, "spec", TEMPLATE_IR).unwrap();
    let template = engine.get_template(TemplateFn::AggProcessBatch).unwrap();
    let update = triple_update(&engine, &context);

    // Clone first so the shared template stays pristine, then rewrite the
    // clone in place.
    let (clone, _) = engine
        .replace_call_sites(template, false, update, "no_such_symbol")
        .unwrap();
    let (rewritten, replaced) = engine
        .replace_call_sites(clone, true, update, "reef_agg_update_row")
        .unwrap();

    assert_eq!(rewritten, clone);
    assert_eq!(replaced, 1);
    assert_eq!(count_calls_to(clone, "my_update"), 1);
}

#[test]
fn in_place_replacement_of_linked_function_is_rejected() {
    let context = Context::create();
    let engine = CodegenEngine::from_ir(&context, "spec", TEMPLATE_IR).unwrap();
    let template = engine.get_template(TemplateFn::AggProcessBatch).unwrap();
    let update = triple_update(&engine, &context);

    let (clone, _) = engine
        .replace_call_sites(template, false, update, "reef_agg_update_row")
        .unwrap();
    engine.finalize_function(clone).unwrap();
    engine.enable_optimizations(false);
    engine.optimize_module().unwrap();
    engine.link(clone).unwrap();

    let err = engine
        .replace_call_sites(clone, true, update, "my_update")
        .unwrap_err();
    assert!(matches!(err, CodegenError::AlreadyLinked(_)));
}
