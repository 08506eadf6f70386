//! Logical-type to LLVM-type mapping and IR constants.
//!
//! The engine's logical value types are the column types the planner hands
//! to operators. Codegen maps each to its LLVM representation once per
//! context; named aggregate types (such as the variable-length
//! `StringValue` struct) come from the cross-compiled template module.

use inkwell::types::{BasicTypeEnum, PointerType, StructType};
use inkwell::values::{IntValue, PointerValue};

use crate::engine::CodegenEngine;

/// Logical value types of the query engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalType {
    Boolean,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    /// Microseconds since the epoch.
    Timestamp,
    /// Variable-length; represented by the named `StringValue` struct.
    String,
}

impl<'ctx> CodegenEngine<'ctx> {
    /// LLVM type for a logical type.
    pub fn llvm_type(&self, ty: LogicalType) -> BasicTypeEnum<'ctx> {
        let llcx = self.llcx();
        match ty {
            LogicalType::Boolean => llcx.bool_type().into(),
            LogicalType::TinyInt => llcx.i8_type().into(),
            LogicalType::SmallInt => llcx.i16_type().into(),
            LogicalType::Int => llcx.i32_type().into(),
            LogicalType::BigInt | LogicalType::Timestamp => llcx.i64_type().into(),
            LogicalType::Float => llcx.f32_type().into(),
            LogicalType::Double => llcx.f64_type().into(),
            LogicalType::String => self.string_value_type().into(),
        }
    }

    /// Pointer to the representation of a logical type. Pointers are opaque
    /// under LLVM 17; the method exists so call sites document intent.
    pub fn llvm_ptr_type(&self, _ty: LogicalType) -> PointerType<'ctx> {
        self.ptr_type()
    }

    /// A named aggregate type defined by the pre-compiled template module,
    /// e.g. `"struct.reef.StringValue"`. Types generated at runtime are
    /// unnamed; only cross-compiled types are addressable this way.
    /// `None` means the name does not exist, which is a caller bug.
    pub fn named_struct(&self, name: &str) -> Option<StructType<'ctx>> {
        self.module().get_struct_type(name)
    }

    /// Integer constant `value` of logical type `ty`.
    ///
    /// # Panics
    ///
    /// If `ty` is not an integer type.
    pub fn const_int(&self, ty: LogicalType, value: i64) -> IntValue<'ctx> {
        let int_ty = match self.llvm_type(ty) {
            BasicTypeEnum::IntType(t) => t,
            other => panic!("const_int on non-integer logical type: {other:?}"),
        };
        int_ty.const_int(value as u64, true)
    }

    /// Null pointer constant.
    pub fn null_ptr(&self) -> PointerValue<'ctx> {
        self.ptr_type().const_null()
    }

    /// Materialize a host pointer as an IR constant, for passing addresses
    /// of engine-owned objects into generated code.
    pub fn host_ptr(&self, addr: usize) -> PointerValue<'ctx> {
        self.llcx()
            .i64_type()
            .const_int(addr as u64, false)
            .const_to_pointer(self.ptr_type())
    }
}
