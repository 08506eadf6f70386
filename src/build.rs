//! Shared IR construction helpers.
//!
//! Operators emit most of their bodies directly through the inkwell builder;
//! the helpers here cover the recurring patterns - entry-block allocas,
//! if/else scaffolding, per-logical-type compare/assign/min-max, memcpy - so
//! every operator lowers them the same way. Variable-length strings are the
//! deliberate exception: comparing them takes a loop, so `equals` and
//! `min_max_fn` reject [`LogicalType::String`] and callers go through
//! generated expression functions instead. `assign` does handle strings,
//! copying the descriptor struct field by field.

use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder;
use inkwell::types::BasicTypeEnum;
use inkwell::values::{BasicValueEnum, FunctionValue, IntValue, PointerValue};
use inkwell::{FloatPredicate, IntPredicate};

use crate::engine::CodegenEngine;
use crate::prototype::FnPrototype;
use crate::types::LogicalType;

impl<'ctx> CodegenEngine<'ctx> {
    /// Create an alloca at the top of `function`'s entry block, regardless of
    /// where body codegen currently is.
    ///
    /// Allocas anywhere else defeat LLVM's mem2reg pass; stack slots inside a
    /// loop body would also reallocate per iteration. Distinct from the
    /// scratch-buffer allocator: this is stack memory scoped to one call of
    /// the generated function.
    pub fn entry_block_alloca(
        &self,
        function: FunctionValue<'ctx>,
        ty: BasicTypeEnum<'ctx>,
        name: &str,
    ) -> PointerValue<'ctx> {
        let entry = function
            .get_first_basic_block()
            .expect("function has no entry block");
        let builder = self.llcx().create_builder();
        match entry.get_first_instruction() {
            Some(first) => builder.position_before(&first),
            None => builder.position_at_end(entry),
        }
        builder.build_alloca(ty, name).expect("entry alloca")
    }

    /// Create the two target blocks of a conditional branch, in order.
    ///
    /// With `insert_before`, both blocks are placed ahead of that block so
    /// the function reads top-down in source order; otherwise they are
    /// appended. The caller emits the branch and the blocks' bodies.
    pub fn if_else_blocks(
        &self,
        function: FunctionValue<'ctx>,
        if_name: &str,
        else_name: &str,
        insert_before: Option<BasicBlock<'ctx>>,
    ) -> (BasicBlock<'ctx>, BasicBlock<'ctx>) {
        match insert_before {
            Some(before) => {
                let if_block = self.llcx().prepend_basic_block(before, if_name);
                let else_block = self.llcx().prepend_basic_block(before, else_name);
                (if_block, else_block)
            }
            None => {
                let if_block = self.llcx().append_basic_block(function, if_name);
                let else_block = self.llcx().append_basic_block(function, else_name);
                (if_block, else_block)
            }
        }
    }

    /// Function computing `min(v1, v2)` (or max) over a fixed-width logical
    /// type: `fn(ty, ty) -> ty`. Built once per `(type, is_min)` pair and
    /// memoized; the returned function is already finalized.
    ///
    /// # Panics
    ///
    /// If `ty` is [`LogicalType::String`]; variable-length comparison goes
    /// through generated expression functions.
    pub fn min_max_fn(&self, ty: LogicalType, is_min: bool) -> FunctionValue<'ctx> {
        assert!(
            ty != LogicalType::String,
            "min/max over strings goes through generated expression functions"
        );
        if let Some(&function) = self.min_max_fns.borrow().get(&(ty, is_min)) {
            return function;
        }

        let tag = if is_min { "min" } else { "max" };
        let name = format!("reef_{tag}_{}", format!("{ty:?}").to_ascii_lowercase());
        let llvm_ty = self.llvm_type(ty);
        let builder = self.llcx().create_builder();
        let mut proto = FnPrototype::new(self, name, Some(llvm_ty));
        proto.add_arg("v1", llvm_ty).add_arg("v2", llvm_ty);
        let (function, args) = proto.generate(Some(&builder));

        let take_first = match ty {
            // i1 holds 0/1; unsigned order is the boolean order.
            LogicalType::Boolean => builder
                .build_int_compare(
                    if is_min { IntPredicate::ULT } else { IntPredicate::UGT },
                    args[0].into_int_value(),
                    args[1].into_int_value(),
                    "cmp",
                )
                .expect("icmp"),
            LogicalType::TinyInt
            | LogicalType::SmallInt
            | LogicalType::Int
            | LogicalType::BigInt
            | LogicalType::Timestamp => builder
                .build_int_compare(
                    if is_min { IntPredicate::SLT } else { IntPredicate::SGT },
                    args[0].into_int_value(),
                    args[1].into_int_value(),
                    "cmp",
                )
                .expect("icmp"),
            LogicalType::Float | LogicalType::Double => builder
                .build_float_compare(
                    if is_min { FloatPredicate::OLT } else { FloatPredicate::OGT },
                    args[0].into_float_value(),
                    args[1].into_float_value(),
                    "cmp",
                )
                .expect("fcmp"),
            LogicalType::String => unreachable!(),
        };
        let result = builder
            .build_select(take_first, args[0], args[1], "sel")
            .expect("select");
        builder.build_return(Some(&result)).expect("ret");

        let function = self
            .finalize_function(function)
            .expect("min/max function verifies");
        self.min_max_fns.borrow_mut().insert((ty, is_min), function);
        function
    }

    /// Emit a memcpy of `num_bytes` from `src` to `dst` at the builder's
    /// current position. Byte-aligned; the regions must not overlap.
    pub fn memcpy(
        &self,
        builder: &Builder<'ctx>,
        dst: PointerValue<'ctx>,
        src: PointerValue<'ctx>,
        num_bytes: u64,
    ) {
        debug_assert!(num_bytes > 0, "zero-sized memcpy");
        let size = self.llcx().i64_type().const_int(num_bytes, false);
        builder.build_memcpy(dst, 1, src, 1, size).expect("memcpy");
    }

    /// Emit `lhs == rhs` for two values of logical type `ty`, yielding an
    /// `i1`. Float comparison is ordered: NaN compares unequal to everything.
    ///
    /// # Panics
    ///
    /// If `ty` is [`LogicalType::String`]; variable-length comparison goes
    /// through generated expression functions.
    pub fn equals(
        &self,
        builder: &Builder<'ctx>,
        lhs: BasicValueEnum<'ctx>,
        rhs: BasicValueEnum<'ctx>,
        ty: LogicalType,
    ) -> IntValue<'ctx> {
        match ty {
            LogicalType::Boolean
            | LogicalType::TinyInt
            | LogicalType::SmallInt
            | LogicalType::Int
            | LogicalType::BigInt
            | LogicalType::Timestamp => builder
                .build_int_compare(
                    IntPredicate::EQ,
                    lhs.into_int_value(),
                    rhs.into_int_value(),
                    "eq",
                )
                .expect("icmp"),
            LogicalType::Float | LogicalType::Double => builder
                .build_float_compare(
                    FloatPredicate::OEQ,
                    lhs.into_float_value(),
                    rhs.into_float_value(),
                    "eq",
                )
                .expect("fcmp"),
            LogicalType::String => {
                panic!("string equality goes through generated expression functions")
            }
        }
    }

    /// Emit a store of `src` into the slot at `dst`.
    ///
    /// Fixed-width types are a single store. Strings store the descriptor
    /// struct field by field (data pointer, then length) into the
    /// `StringValue`-shaped slot; the character data itself is not copied.
    pub fn assign(
        &self,
        builder: &Builder<'ctx>,
        dst: PointerValue<'ctx>,
        src: BasicValueEnum<'ctx>,
        ty: LogicalType,
    ) {
        match ty {
            LogicalType::String => {
                let string_ty = self.string_value_type();
                let value = src.into_struct_value();
                let data = builder
                    .build_extract_value(value, 0, "src.ptr")
                    .expect("extract data pointer");
                let len = builder
                    .build_extract_value(value, 1, "src.len")
                    .expect("extract length");
                let dst_data = builder
                    .build_struct_gep(string_ty, dst, 0, "dst.ptr")
                    .expect("gep data pointer");
                builder.build_store(dst_data, data).expect("store");
                let dst_len = builder
                    .build_struct_gep(string_ty, dst, 1, "dst.len")
                    .expect("gep length");
                builder.build_store(dst_len, len).expect("store");
            }
            _ => {
                builder.build_store(dst, src).expect("store");
            }
        }
    }
}
