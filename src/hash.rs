//! Generated hash functions.
//!
//! Hash-join and aggregation operators hash row prefixes whose byte width is
//! known at plan time, so the engine emits one FNV-1a function per distinct
//! width with the length loop fully unrolled, plus a variable-length variant
//! for widths only known at execution time. Functions are memoized per
//! width; asking twice returns the same handle.
//!
//! All variants share the signature `(ptr data, i32 len, i32 seed) -> i32`
//! so call sites are interchangeable. Fixed-width variants ignore `len`.

use inkwell::values::{BasicValueEnum, FunctionValue, IntValue, PointerValue};
use inkwell::IntPredicate;

use crate::engine::CodegenEngine;
use crate::prototype::FnPrototype;

const FNV_PRIME: u64 = 0x0100_0193;

impl<'ctx> CodegenEngine<'ctx> {
    /// Hash function for the given fixed byte width, or the variable-length
    /// variant for `None`. Built on first request, memoized after.
    pub fn get_hash_fn(&self, width: Option<u32>) -> FunctionValue<'ctx> {
        if let Some(&function) = self.hash_fns.borrow().get(&width) {
            return function;
        }
        let function = match width {
            Some(w) => self.build_fixed_hash_fn(w),
            None => self.build_variable_hash_fn(),
        };
        self.hash_fns.borrow_mut().insert(width, function);
        function
    }

    /// Drop the memo table and delete the generated functions from the
    /// module, so a later request builds fresh ones. Test hook.
    #[cfg(test)]
    pub(crate) fn clear_hash_fns(&self) {
        for (_, function) in self.hash_fns.borrow_mut().drain() {
            self.forget_codegend_fn(function);
            unsafe { function.delete() };
        }
    }

    fn hash_fn_prototype(&self, name: &str) -> FnPrototype<'_, 'ctx> {
        let i32_type = self.llcx().i32_type();
        let mut proto = FnPrototype::new(self, name, Some(i32_type.into()));
        proto
            .add_arg("data", self.ptr_type().into())
            .add_arg("len", i32_type.into())
            .add_arg("seed", i32_type.into());
        proto
    }

    /// FNV-1a over a compile-time byte count, loop fully unrolled.
    fn build_fixed_hash_fn(&self, width: u32) -> FunctionValue<'ctx> {
        let builder = self.llcx().create_builder();
        let proto = self.hash_fn_prototype(&format!("reef_hash_{width}"));
        let (function, params) = proto.generate(Some(&builder));

        let data = params[0].into_pointer_value();
        let seed = params[2].into_int_value();
        let i32_type = self.llcx().i32_type();
        let i8_type = self.llcx().i8_type();

        let mut hash = seed;
        for i in 0..width {
            let index = i32_type.const_int(u64::from(i), false);
            let byte_ptr = unsafe {
                builder
                    .build_in_bounds_gep(i8_type, data, &[index], "byte_ptr")
                    .expect("gep")
            };
            let byte = builder
                .build_load(i8_type, byte_ptr, "byte")
                .expect("load")
                .into_int_value();
            let byte = builder.build_int_z_extend(byte, i32_type, "byte32").expect("zext");
            let mixed = builder.build_xor(hash, byte, "mixed").expect("xor");
            hash = builder
                .build_int_mul(mixed, i32_type.const_int(FNV_PRIME, false), "hash")
                .expect("mul");
        }
        builder.build_return(Some(&hash)).expect("ret");

        self.finalize_function(function)
            .expect("generated hash function must verify")
    }

    /// FNV-1a with a runtime length: a counted loop over the input bytes.
    fn build_variable_hash_fn(&self) -> FunctionValue<'ctx> {
        let builder = self.llcx().create_builder();
        let proto = self.hash_fn_prototype("reef_hash_var");
        let (function, params) = proto.generate(Some(&builder));

        let data: PointerValue<'ctx> = params[0].into_pointer_value();
        let len: IntValue<'ctx> = params[1].into_int_value();
        let seed: IntValue<'ctx> = params[2].into_int_value();
        let i32_type = self.llcx().i32_type();
        let i8_type = self.llcx().i8_type();

        let entry = function.get_first_basic_block().expect("entry block");
        let loop_block = self.llcx().append_basic_block(function, "loop");
        let body_block = self.llcx().append_basic_block(function, "body");
        let exit_block = self.llcx().append_basic_block(function, "exit");

        builder.position_at_end(entry);
        builder.build_unconditional_branch(loop_block).expect("br");

        builder.position_at_end(loop_block);
        let index = builder.build_phi(i32_type, "i").expect("phi");
        let hash = builder.build_phi(i32_type, "hash").expect("phi");
        let more = builder
            .build_int_compare(
                IntPredicate::SLT,
                index.as_basic_value().into_int_value(),
                len,
                "more",
            )
            .expect("icmp");
        builder
            .build_conditional_branch(more, body_block, exit_block)
            .expect("condbr");

        builder.position_at_end(body_block);
        let byte_ptr = unsafe {
            builder
                .build_in_bounds_gep(
                    i8_type,
                    data,
                    &[index.as_basic_value().into_int_value()],
                    "byte_ptr",
                )
                .expect("gep")
        };
        let byte = builder
            .build_load(i8_type, byte_ptr, "byte")
            .expect("load")
            .into_int_value();
        let byte = builder.build_int_z_extend(byte, i32_type, "byte32").expect("zext");
        let mixed = builder
            .build_xor(hash.as_basic_value().into_int_value(), byte, "mixed")
            .expect("xor");
        let hash_next = builder
            .build_int_mul(mixed, i32_type.const_int(FNV_PRIME, false), "hash_next")
            .expect("mul");
        let index_next = builder
            .build_int_add(
                index.as_basic_value().into_int_value(),
                i32_type.const_int(1, false),
                "i_next",
            )
            .expect("add");
        builder.build_unconditional_branch(loop_block).expect("br");

        let zero: BasicValueEnum<'ctx> = i32_type.const_int(0, false).into();
        index.add_incoming(&[(&zero, entry), (&index_next, body_block)]);
        hash.add_incoming(&[(&seed, entry), (&hash_next, body_block)]);

        builder.position_at_end(exit_block);
        builder
            .build_return(Some(&hash.as_basic_value()))
            .expect("ret");

        self.finalize_function(function)
            .expect("generated hash function must verify")
    }
}
