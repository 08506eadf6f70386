//! Call-site specialization.
//!
//! The specialization pattern used throughout the engine: one generic
//! template operator body (a per-row comparison loop, an aggregation batch
//! loop) is cloned once per physical operator instance in the plan, and each
//! clone's placeholder call sites are redirected to that instance's bespoke,
//! tuple-layout-specific generated function.
//!
//! inkwell does not wrap function cloning, so the clone machinery works on
//! the LLVM C API directly: append fresh blocks, `LLVMInstructionClone` each
//! instruction, then remap operands through a value map. Phi nodes store
//! their incoming blocks outside the operand list and are rebuilt explicitly.

use inkwell::values::{AsValueRef, FunctionValue};
use llvm_sys::core::{
    LLVMAddIncoming, LLVMAppendBasicBlockInContext, LLVMBasicBlockAsValue, LLVMBuildPhi,
    LLVMCountIncoming, LLVMCountParams, LLVMCreateBuilderInContext, LLVMDisposeBuilder,
    LLVMGetBasicBlockName, LLVMGetFirstBasicBlock, LLVMGetFirstInstruction,
    LLVMGetGlobalParent, LLVMGetIncomingBlock, LLVMGetIncomingValue, LLVMGetInstructionOpcode,
    LLVMGetModuleContext, LLVMGetNextBasicBlock, LLVMGetNextInstruction, LLVMGetOperand,
    LLVMGetNumOperands, LLVMGetParam, LLVMGetValueName2, LLVMInsertIntoBuilder,
    LLVMInstructionClone, LLVMPositionBuilderAtEnd, LLVMSetOperand, LLVMSetValueName2,
    LLVMTypeOf, LLVMValueAsBasicBlock, LLVMValueIsBasicBlock,
};
use llvm_sys::prelude::{LLVMBasicBlockRef, LLVMBuilderRef, LLVMValueRef};
use llvm_sys::LLVMOpcode;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::engine::{CodegenEngine, FnState};
use crate::error::CodegenError;

/// RAII wrapper for a raw `LLVMBuilderRef`.
pub(crate) struct RawBuilder {
    builder: LLVMBuilderRef,
}

impl RawBuilder {
    /// Create a builder in the context owning `function`'s module.
    pub(crate) fn for_function(function: LLVMValueRef) -> Self {
        let builder = unsafe {
            let module = LLVMGetGlobalParent(function);
            LLVMCreateBuilderInContext(LLVMGetModuleContext(module))
        };
        Self { builder }
    }

    pub(crate) fn as_ptr(&self) -> LLVMBuilderRef {
        self.builder
    }

    pub(crate) fn position_at_end(&self, block: LLVMBasicBlockRef) {
        unsafe { LLVMPositionBuilderAtEnd(self.builder, block) };
    }
}

impl Drop for RawBuilder {
    fn drop(&mut self) {
        unsafe { LLVMDisposeBuilder(self.builder) };
    }
}

/// Copy the value name from `src` to `dest` (instruction names are not
/// carried over by `LLVMInstructionClone`).
unsafe fn copy_value_name(src: LLVMValueRef, dest: LLVMValueRef) {
    let mut len = 0usize;
    let name = LLVMGetValueName2(src, &mut len);
    if len > 0 {
        LLVMSetValueName2(dest, name, len);
    }
}

/// Clone every basic block of `src_fn` into `dest_fn`, remapping operands
/// through `value_map`. The map must be pre-seeded with any values that
/// differ between source and destination (function arguments); it is
/// extended with every cloned instruction.
///
/// Returns the source-to-destination block map. `dest_fn` may already have
/// blocks (the inliner clones a callee body into the middle of a caller).
pub(crate) unsafe fn clone_body(
    src_fn: LLVMValueRef,
    dest_fn: LLVMValueRef,
    value_map: &mut FxHashMap<LLVMValueRef, LLVMValueRef>,
) -> FxHashMap<LLVMBasicBlockRef, LLVMBasicBlockRef> {
    let ctx = LLVMGetModuleContext(LLVMGetGlobalParent(dest_fn));
    let builder = RawBuilder::for_function(dest_fn);

    // Pass 1: append destination blocks, one per source block.
    let mut block_map: FxHashMap<LLVMBasicBlockRef, LLVMBasicBlockRef> = FxHashMap::default();
    let mut src_blocks = Vec::new();
    let mut block = LLVMGetFirstBasicBlock(src_fn);
    while !block.is_null() {
        let name = LLVMGetBasicBlockName(block);
        let new_block = LLVMAppendBasicBlockInContext(ctx, dest_fn, name);
        block_map.insert(block, new_block);
        src_blocks.push(block);
        block = LLVMGetNextBasicBlock(block);
    }

    // Pass 2: clone instructions. Phis get placeholder nodes; their incoming
    // lists are rebuilt in pass 4 once every value has a mapping.
    let mut cloned: Vec<(LLVMValueRef, LLVMValueRef)> = Vec::new();
    let mut phis: Vec<(LLVMValueRef, LLVMValueRef)> = Vec::new();
    for &src_block in &src_blocks {
        builder.position_at_end(block_map[&src_block]);
        let mut inst = LLVMGetFirstInstruction(src_block);
        while !inst.is_null() {
            if LLVMGetInstructionOpcode(inst) == LLVMOpcode::LLVMPHI {
                let mut len = 0usize;
                let name = LLVMGetValueName2(inst, &mut len);
                let phi = LLVMBuildPhi(builder.as_ptr(), LLVMTypeOf(inst), name);
                value_map.insert(inst, phi);
                phis.push((inst, phi));
            } else {
                let clone = LLVMInstructionClone(inst);
                copy_value_name(inst, clone);
                LLVMInsertIntoBuilder(builder.as_ptr(), clone);
                value_map.insert(inst, clone);
                cloned.push((inst, clone));
            }
            inst = LLVMGetNextInstruction(inst);
        }
    }

    // Pass 3: remap operands of the cloned instructions. A clone initially
    // references the source function's values and blocks.
    for &(_, clone) in &cloned {
        let num_operands = LLVMGetNumOperands(clone);
        for i in 0..num_operands {
            let operand = LLVMGetOperand(clone, i as u32);
            if operand.is_null() {
                continue;
            }
            if LLVMValueIsBasicBlock(operand) != 0 {
                let target = LLVMValueAsBasicBlock(operand);
                if let Some(&mapped) = block_map.get(&target) {
                    LLVMSetOperand(clone, i as u32, LLVMBasicBlockAsValue(mapped));
                }
            } else if let Some(&mapped) = value_map.get(&operand) {
                LLVMSetOperand(clone, i as u32, mapped);
            }
        }
    }

    // Pass 4: rebuild phi incoming lists with mapped values and blocks.
    for &(src_phi, new_phi) in &phis {
        let count = LLVMCountIncoming(src_phi);
        for i in 0..count {
            let value = LLVMGetIncomingValue(src_phi, i);
            let block = LLVMGetIncomingBlock(src_phi, i);
            let mut mapped_value = value_map.get(&value).copied().unwrap_or(value);
            let mut mapped_block = block_map.get(&block).copied().unwrap_or(block);
            LLVMAddIncoming(new_phi, &mut mapped_value, &mut mapped_block, 1);
        }
    }

    block_map
}

impl<'ctx> CodegenEngine<'ctx> {
    /// Clone `src` into a new function with a fresh name and an independent
    /// body. The clone is recorded as a codegen'd function in `Defined`
    /// state; the original is untouched.
    pub(crate) fn clone_function(&self, src: FunctionValue<'ctx>) -> FunctionValue<'ctx> {
        let base = src.get_name().to_string_lossy().into_owned();
        let clone_name = self.next_clone_name(&base);
        let dest = self
            .module()
            .add_function(&clone_name, src.get_type(), None);
        self.record_codegend_fn(dest);

        unsafe {
            let src_ref = src.as_value_ref();
            let dest_ref = dest.as_value_ref();
            let mut value_map: FxHashMap<LLVMValueRef, LLVMValueRef> = FxHashMap::default();
            let params = LLVMCountParams(src_ref);
            for i in 0..params {
                let src_param = LLVMGetParam(src_ref, i);
                let dest_param = LLVMGetParam(dest_ref, i);
                copy_value_name(src_param, dest_param);
                value_map.insert(src_param, dest_param);
            }
            clone_body(src_ref, dest_ref, &mut value_map);
        }

        self.set_state(dest, FnState::Defined);
        dest
    }

    /// Redirect every call instruction in `caller` whose callee name
    /// contains `target_name` to call `new_fn` instead, preserving argument
    /// lists positionally.
    ///
    /// The match is a case-sensitive substring over the unmangled callee
    /// name. Call targets are emitted with engine-controlled unmangled
    /// names, so the loose match is adequate in practice; names that overlap
    /// as substrings would collide.
    ///
    /// With `update_in_place` false, `caller` is first cloned and the
    /// rewrite is applied to the clone, leaving the original untouched; the
    /// clone is returned. With `update_in_place` true, `caller` itself is
    /// mutated - rejected with [`CodegenError::AlreadyLinked`] if `caller`
    /// has been linked, because the rewrite would invalidate code another
    /// thread may be executing.
    ///
    /// A replaced count of zero is a valid outcome (the target is not
    /// present in the caller).
    pub fn replace_call_sites(
        &self,
        caller: FunctionValue<'ctx>,
        update_in_place: bool,
        new_fn: FunctionValue<'ctx>,
        target_name: &str,
    ) -> Result<(FunctionValue<'ctx>, usize), CodegenError> {
        let function = if update_in_place {
            if self.state_of(caller) == Some(FnState::Linked) {
                return Err(CodegenError::AlreadyLinked(
                    caller.get_name().to_string_lossy().into_owned(),
                ));
            }
            assert!(
                !self.is_compiled(),
                "no function may be rewritten after the module is compiled"
            );
            caller
        } else {
            self.clone_function(caller)
        };

        let replacement = new_fn.as_global_value().as_pointer_value();
        let mut replaced = 0usize;
        for block in function.get_basic_blocks() {
            let mut inst = block.get_first_instruction();
            while let Some(instruction) = inst {
                inst = instruction.get_next_instruction();
                if instruction.get_opcode() != inkwell::values::InstructionOpcode::Call {
                    continue;
                }
                // The callee is the call's last operand. Indirect calls have
                // unnamed callee values and never match.
                let callee_index = instruction.get_num_operands() - 1;
                let Some(callee) = instruction.get_operand(callee_index).and_then(|op| op.value())
                else {
                    continue;
                };
                let callee_name = match callee {
                    inkwell::values::BasicValueEnum::PointerValue(p) => {
                        p.get_name().to_string_lossy().into_owned()
                    }
                    _ => continue,
                };
                if callee_name.contains(target_name) {
                    instruction.set_operand(callee_index, replacement);
                    replaced += 1;
                }
            }
        }

        debug!(
            caller = %function.get_name().to_string_lossy(),
            target = target_name,
            replaced,
            in_place = update_in_place,
            "replaced call sites"
        );
        Ok((function, replaced))
    }
}
