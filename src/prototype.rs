//! Declarative function prototypes.
//!
//! Operators describe a signature (name, return type, ordered named
//! arguments) and materialize it into an LLVM function declaration in one
//! step, optionally with an entry block and handles to the argument values.
//! The prototype itself is transient; it has no existence after
//! [`generate`](FnPrototype::generate).

use inkwell::builder::Builder;
use inkwell::types::{BasicMetadataTypeEnum, BasicType, BasicTypeEnum};
use inkwell::values::{BasicValueEnum, FunctionValue};

use crate::engine::{CodegenEngine, FnState};

/// A variable name paired with its LLVM type.
#[derive(Debug, Clone)]
pub struct NamedArg<'ctx> {
    pub name: String,
    pub ty: BasicTypeEnum<'ctx>,
}

/// Builder for a function signature.
pub struct FnPrototype<'a, 'ctx> {
    engine: &'a CodegenEngine<'ctx>,
    name: String,
    /// `None` means void.
    ret_type: Option<BasicTypeEnum<'ctx>>,
    args: Vec<NamedArg<'ctx>>,
}

impl<'a, 'ctx> FnPrototype<'a, 'ctx> {
    /// Start a prototype for `name` returning `ret_type` (`None` for void).
    pub fn new(
        engine: &'a CodegenEngine<'ctx>,
        name: impl Into<String>,
        ret_type: Option<BasicTypeEnum<'ctx>>,
    ) -> Self {
        Self {
            engine,
            name: name.into(),
            ret_type,
            args: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an argument. Arguments appear in the order added.
    pub fn add_arg(&mut self, name: impl Into<String>, ty: BasicTypeEnum<'ctx>) -> &mut Self {
        self.args.push(NamedArg {
            name: name.into(),
            ty,
        });
        self
    }

    /// Materialize the prototype.
    ///
    /// Returns the function and one value handle per argument, in
    /// declaration order. If `builder` is given, the function's entry block
    /// is created and the builder positioned there, ready for body codegen.
    ///
    /// A prototype whose name matches an existing *declaration* (an external
    /// or template function) reuses it - this is how an operator refers to a
    /// library function it does not define. Generating a second *definition*
    /// for the same name is a contract violation and asserts.
    pub fn generate(
        &self,
        builder: Option<&Builder<'ctx>>,
    ) -> (FunctionValue<'ctx>, Vec<BasicValueEnum<'ctx>>) {
        let engine = self.engine;
        assert!(
            !engine.is_compiled(),
            "no function may be created after the module is compiled"
        );

        let param_types: Vec<BasicMetadataTypeEnum<'ctx>> =
            self.args.iter().map(|a| a.ty.into()).collect();
        let fn_type = match self.ret_type {
            Some(ret) => ret.fn_type(&param_types, false),
            None => engine.llcx().void_type().fn_type(&param_types, false),
        };

        let function = match engine.module().get_function(&self.name) {
            Some(existing) => {
                assert!(
                    existing.get_type() == fn_type,
                    "function '{}' already exists with a different signature ({:?} vs {:?})",
                    self.name,
                    existing.get_type(),
                    fn_type,
                );
                assert!(
                    builder.is_none() || existing.count_basic_blocks() == 0,
                    "function '{}' is already defined in the module",
                    self.name
                );
                existing
            }
            None => {
                let function = engine.module().add_function(&self.name, fn_type, None);
                engine.record_codegend_fn(function);
                engine.set_state(function, FnState::Declared);
                function
            }
        };

        let params = function.get_params();
        for (param, arg) in params.iter().zip(&self.args) {
            param.set_name(&arg.name);
        }

        if let Some(builder) = builder {
            let entry = engine.llcx().append_basic_block(function, "entry");
            builder.position_at_end(entry);
            engine.set_state(function, FnState::Defined);
        }

        (function, params)
    }
}
