//! Verification, per-function heuristic optimization, and the whole-module
//! pass pipeline.
//!
//! Per-function optimization is a combination of LLVM passes and engine
//! heuristics: expression call sites are inlined to a fixed point and the
//! result is scrubbed for duplicate expressions. Inlined expression trees
//! from a query's WHERE/SELECT list frequently recompute the same
//! subexpression (reading the same column slot) from what used to be
//! separate call sites, and LLVM's own passes are poor at recovering that
//! redundancy from the IR we emit.
//!
//! Whole-module optimization runs once, after all operators have finished
//! preparation, through the LLVM 17 new pass manager (`LLVMRunPasses` with a
//! `default<O2>` pipeline). The scalar/loop pass family is considerably more
//! effective across the whole module than per function.

use std::ffi::CString;

use inkwell::attributes::{Attribute, AttributeLoc};
use inkwell::targets::{CodeModel, RelocMode, Target, TargetMachine};
use inkwell::values::{AsValueRef, FunctionValue, InstructionOpcode};
use inkwell::OptimizationLevel;
use llvm_sys::core::{
    LLVMCountBasicBlocks, LLVMCountParams, LLVMGetBasicBlockParent,
    LLVMGetBasicBlockTerminator, LLVMGetCalledValue, LLVMGetEntryBasicBlock,
    LLVMGetFCmpPredicate, LLVMGetFirstBasicBlock, LLVMGetFirstInstruction, LLVMGetFirstUse,
    LLVMGetGEPSourceElementType, LLVMGetGlobalParent, LLVMGetICmpPredicate,
    LLVMGetInstructionOpcode, LLVMGetInstructionParent, LLVMGetModuleContext,
    LLVMGetNextBasicBlock, LLVMGetNextInstruction, LLVMGetNextUse, LLVMGetNumOperands,
    LLVMGetOperand, LLVMGetParam, LLVMGetTypeKind, LLVMGetUndef, LLVMGetUser,
    LLVMInsertIntoBuilder, LLVMInstructionEraseFromParent, LLVMInstructionRemoveFromParent,
    LLVMIsAFunction, LLVMIsAInstruction, LLVMMoveBasicBlockBefore, LLVMPositionBuilder,
    LLVMReplaceAllUsesWith, LLVMSetOperand, LLVMTypeOf,
};
use llvm_sys::core::{
    LLVMAddIncoming, LLVMAppendBasicBlockInContext, LLVMBasicBlockAsValue, LLVMBuildBr,
    LLVMBuildPhi,
};
use llvm_sys::prelude::{LLVMBasicBlockRef, LLVMValueRef};
use llvm_sys::transforms::pass_builder as pb;
use llvm_sys::{LLVMOpcode, LLVMTypeKind};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::engine::{CodegenEngine, FnState};
use crate::error::CodegenError;
use crate::specialize::{clone_body, RawBuilder};

impl<'ctx> CodegenEngine<'ctx> {
    /// Structural/type validity check. `false` means the function must not
    /// be used; the caller discards it and falls back to the interpreted
    /// path for that operator.
    pub fn verify_function(&self, function: FunctionValue<'ctx>) -> bool {
        let valid = function.verify(false);
        if !valid {
            warn!(
                function = %function.get_name().to_string_lossy(),
                module = %self.name(),
                "function failed verification; operator falls back to interpreted execution"
            );
        }
        valid
    }

    /// Verify `function` and mark it eligible for cross-function inlining.
    ///
    /// Must be called exactly once per codegen'd function before it can take
    /// part in whole-module optimization or be linked. Returns `None` if the
    /// function does not verify.
    pub fn finalize_function(
        &self,
        function: FunctionValue<'ctx>,
    ) -> Option<FunctionValue<'ctx>> {
        if !self.verify_function(function) {
            return None;
        }
        let kind = Attribute::get_named_enum_kind_id("alwaysinline");
        function.add_attribute(
            AttributeLoc::Function,
            self.llcx().create_enum_attribute(kind, 0),
        );
        self.set_state(function, FnState::Finalized);
        Some(function)
    }

    /// Inline every direct call inside `function` whose callee has a body,
    /// one level only: calls inside a freshly inlined body are not expanded
    /// in the same pass. Returns the number of call sites inlined; call
    /// repeatedly until it returns zero to reach a fixed point.
    ///
    /// With `skip_registered_fns`, calls to registered expression functions
    /// are left intact - those are shared across the plan, not duplicated.
    pub fn inline_all_call_sites(
        &self,
        function: FunctionValue<'ctx>,
        skip_registered_fns: bool,
    ) -> usize {
        let function_ref = function.as_value_ref();
        let mut call_sites: Vec<LLVMValueRef> = Vec::new();

        for block in function.get_basic_blocks() {
            let mut inst = block.get_first_instruction();
            while let Some(instruction) = inst {
                inst = instruction.get_next_instruction();
                if instruction.get_opcode() != InstructionOpcode::Call {
                    continue;
                }
                unsafe {
                    let call = instruction.as_value_ref();
                    let callee = LLVMGetCalledValue(call);
                    if LLVMIsAFunction(callee).is_null() {
                        // Indirect call; nothing to inline.
                        continue;
                    }
                    if LLVMCountBasicBlocks(callee) == 0 {
                        continue;
                    }
                    if callee == function_ref {
                        // Direct recursion never terminates under inlining.
                        continue;
                    }
                    if skip_registered_fns && self.is_registered_expr(callee as usize) {
                        continue;
                    }
                    call_sites.push(call);
                }
            }
        }

        for &call in &call_sites {
            unsafe { inline_call_site(call) };
        }
        call_sites.len()
    }

    /// Optimize `function` with engine heuristics: inline expression call
    /// sites to a fixed point, then merge duplicate expressions.
    ///
    /// Call this for every function that calls expression functions, before
    /// `optimize_module`, and at the outermost composed function so the
    /// maximum number of redundant expressions is visible at once.
    pub fn optimize_fn_with_exprs(&self, function: FunctionValue<'ctx>) -> FunctionValue<'ctx> {
        let mut inlined = 0usize;
        loop {
            let n = self.inline_all_call_sites(function, true);
            if n == 0 {
                break;
            }
            inlined += n;
        }
        let merged = self.eliminate_duplicate_exprs(function);
        debug!(
            function = %function.get_name().to_string_lossy(),
            inlined,
            merged,
            "optimized function with expressions"
        );
        function
    }

    /// Merge identical instructions - same operation, same operand values,
    /// regardless of textual position - so that each surviving instance
    /// serves all former uses.
    ///
    /// Scope is a basic block plus its chain of sole predecessors: a block's
    /// only predecessor always dominates it, so expressions seen along that
    /// chain are available here and merging cannot move a use above its
    /// definition. Wider scopes would need a dominator tree, which the C API
    /// does not expose. Loads and other side-effecting operations are never
    /// merged; calls are merged only for registered expression functions,
    /// which are pure by contract.
    pub(crate) fn eliminate_duplicate_exprs(&self, function: FunctionValue<'ctx>) -> usize {
        let mut merged = 0usize;
        unsafe {
            let mut block = LLVMGetFirstBasicBlock(function.as_value_ref());
            while !block.is_null() {
                let mut seen: FxHashMap<ExprKey, LLVMValueRef> = FxHashMap::default();
                for pred in dominating_chain(block) {
                    let mut inst = LLVMGetFirstInstruction(pred);
                    while !inst.is_null() {
                        if let Some(key) = self.dedup_key(inst) {
                            seen.entry(key).or_insert(inst);
                        }
                        inst = LLVMGetNextInstruction(inst);
                    }
                }

                let mut inst = LLVMGetFirstInstruction(block);
                while !inst.is_null() {
                    let next = LLVMGetNextInstruction(inst);
                    if let Some(key) = self.dedup_key(inst) {
                        if let Some(&existing) = seen.get(&key) {
                            LLVMReplaceAllUsesWith(inst, existing);
                            LLVMInstructionEraseFromParent(inst);
                            merged += 1;
                        } else {
                            seen.insert(key, inst);
                        }
                    }
                    inst = next;
                }
                block = LLVMGetNextBasicBlock(block);
            }
        }
        merged
    }

    /// Dedup key for an instruction, or `None` if it is not safe to merge.
    unsafe fn dedup_key(&self, inst: LLVMValueRef) -> Option<ExprKey> {
        use LLVMOpcode::*;

        let opcode = LLVMGetInstructionOpcode(inst);
        let extra = match opcode {
            LLVMAdd | LLVMFAdd | LLVMSub | LLVMFSub | LLVMMul | LLVMFMul | LLVMAnd | LLVMOr
            | LLVMXor | LLVMShl | LLVMLShr | LLVMAShr | LLVMTrunc | LLVMZExt | LLVMSExt
            | LLVMFPTrunc | LLVMFPExt | LLVMSIToFP | LLVMUIToFP | LLVMFPToSI | LLVMFPToUI
            | LLVMPtrToInt | LLVMIntToPtr | LLVMBitCast | LLVMSelect => 0,
            LLVMICmp => LLVMGetICmpPredicate(inst) as u64,
            LLVMFCmp => LLVMGetFCmpPredicate(inst) as u64,
            LLVMGetElementPtr => LLVMGetGEPSourceElementType(inst) as u64,
            LLVMCall => {
                // Only expression functions are known pure.
                let callee = LLVMGetCalledValue(inst);
                if !self.is_registered_expr(callee as usize) {
                    return None;
                }
                0
            }
            _ => return None,
        };

        let num_operands = LLVMGetNumOperands(inst);
        let mut operands = Vec::with_capacity(num_operands as usize);
        for i in 0..num_operands {
            operands.push(LLVMGetOperand(inst, i as u32) as usize);
        }

        Some(ExprKey {
            opcode: opcode as u32,
            extra,
            ty: LLVMTypeOf(inst) as usize,
            operands,
        })
    }

    /// Optimize the entire module. Runs once, after all per-query
    /// preparation is complete, and flips the compiled flag: no function may
    /// be registered afterward.
    ///
    /// An internal pass-manager fault marks the instance corrupt; the whole
    /// fragment falls back to interpreted execution.
    pub fn optimize_module(&self) -> Result<(), CodegenError> {
        assert!(
            !self.is_compiled(),
            "optimize_module may only be called once"
        );
        if self.is_corrupt() {
            return Err(CodegenError::Corrupt);
        }

        if std::env::var("REEF_DEBUG_LLVM").is_ok() {
            eprintln!("=== IR before module optimization ({}) ===", self.name());
            eprintln!("{}", self.ir_text(true));
            eprintln!("=== END IR ===");
        }

        if self.optimizations_enabled() {
            if let Err(e) = self.run_module_passes() {
                self.mark_corrupt();
                return Err(e);
            }
        }

        self.mark_compiled();
        debug!(module = %self.name(), "module compiled");
        Ok(())
    }

    /// Run the `default<O2>` new-pass-manager pipeline over the module.
    fn run_module_passes(&self) -> Result<(), CodegenError> {
        let triple = TargetMachine::get_default_triple();
        let target =
            Target::from_triple(&triple).map_err(|e| CodegenError::Optimize(e.to_string()))?;
        let machine = target
            .create_target_machine(
                &triple,
                &TargetMachine::get_host_cpu_name().to_string(),
                &TargetMachine::get_host_cpu_features().to_string(),
                OptimizationLevel::Default,
                RelocMode::Default,
                CodeModel::JITDefault,
            )
            .ok_or_else(|| CodegenError::Optimize("failed to create target machine".into()))?;

        let options = PassOptions::create()
            .ok_or_else(|| CodegenError::Optimize("failed to create pass builder options".into()))?;

        let pipeline = CString::new("default<O2>").expect("static pipeline string");
        let error = unsafe {
            pb::LLVMRunPasses(
                self.module().as_mut_ptr(),
                pipeline.as_ptr(),
                machine.as_mut_ptr(),
                options.raw,
            )
        };

        if !error.is_null() {
            return Err(CodegenError::Optimize(unsafe { llvm_error_message(error) }));
        }
        Ok(())
    }
}

/// Identity of an expression for duplicate elimination: operation, operand
/// values, and result type. Instructions with equal keys compute the same
/// value.
#[derive(PartialEq, Eq, Hash)]
struct ExprKey {
    opcode: u32,
    /// Disambiguator for opcodes that carry state outside their operands
    /// (compare predicates, GEP source element type).
    extra: u64,
    ty: usize,
    operands: Vec<usize>,
}

/// Chain of sole predecessors of `block`, oldest first.
unsafe fn dominating_chain(block: LLVMBasicBlockRef) -> Vec<LLVMBasicBlockRef> {
    let mut chain = Vec::new();
    let mut visited: FxHashSet<LLVMBasicBlockRef> = FxHashSet::default();
    visited.insert(block);
    let mut current = block;
    while let Some(pred) = sole_predecessor(current) {
        if !visited.insert(pred) {
            // Cycle; a loop back-edge means nothing above it dominates.
            break;
        }
        chain.push(pred);
        current = pred;
    }
    chain.reverse();
    chain
}

/// The unique predecessor of `block`, or `None` if it has zero or several.
/// Multiple edges from one terminator (both arms of a conditional branch
/// targeting the same block) count as one predecessor.
unsafe fn sole_predecessor(block: LLVMBasicBlockRef) -> Option<LLVMBasicBlockRef> {
    let block_value = LLVMBasicBlockAsValue(block);
    let mut pred = None;
    let mut use_ref = LLVMGetFirstUse(block_value);
    while !use_ref.is_null() {
        let user = LLVMGetUser(use_ref);
        use_ref = LLVMGetNextUse(use_ref);
        if LLVMIsAInstruction(user).is_null() {
            continue;
        }
        // Only terminators define CFG edges; phis hold block references too
        // but their parents are not predecessors.
        match LLVMGetInstructionOpcode(user) {
            LLVMOpcode::LLVMBr
            | LLVMOpcode::LLVMSwitch
            | LLVMOpcode::LLVMIndirectBr
            | LLVMOpcode::LLVMInvoke => {}
            _ => continue,
        }
        let parent = LLVMGetInstructionParent(user);
        match pred {
            None => pred = Some(parent),
            Some(existing) if existing == parent => {}
            Some(_) => return None,
        }
    }
    pred
}

/// Inline one direct call site: clone the callee body into the caller and
/// splice it in place of the call.
///
/// The containing block is split at the call. Everything before the call
/// moves to a fresh predecessor block (taking any leading phis with it, so
/// predecessor edges stay consistent); the call's block keeps the tail and
/// becomes the continuation. Cloned `ret`s branch to the continuation, and a
/// phi merges the return value where the call used to be.
unsafe fn inline_call_site(call: LLVMValueRef) {
    let callee = LLVMGetCalledValue(call);
    let block = LLVMGetInstructionParent(call);
    let func = LLVMGetBasicBlockParent(block);
    let ctx = LLVMGetModuleContext(LLVMGetGlobalParent(func));
    let builder = RawBuilder::for_function(func);

    // Hoist everything before the call into a fresh block.
    let pre = LLVMAppendBasicBlockInContext(ctx, func, c"inline.pre".as_ptr());
    LLVMMoveBasicBlockBefore(pre, block);
    builder.position_at_end(pre);
    loop {
        let first = LLVMGetFirstInstruction(block);
        if first == call {
            break;
        }
        LLVMInstructionRemoveFromParent(first);
        LLVMInsertIntoBuilder(builder.as_ptr(), first);
    }

    // Branches that targeted the block now target the hoisted head. Phi
    // references to the block stay put: its terminator does not move, so it
    // remains the predecessor its successors record.
    let block_value = LLVMBasicBlockAsValue(block);
    let pre_value = LLVMBasicBlockAsValue(pre);
    let mut users = Vec::new();
    let mut use_ref = LLVMGetFirstUse(block_value);
    while !use_ref.is_null() {
        users.push(LLVMGetUser(use_ref));
        use_ref = LLVMGetNextUse(use_ref);
    }
    for user in users {
        if LLVMIsAInstruction(user).is_null() {
            continue;
        }
        match LLVMGetInstructionOpcode(user) {
            LLVMOpcode::LLVMBr | LLVMOpcode::LLVMSwitch | LLVMOpcode::LLVMIndirectBr => {
                let num_operands = LLVMGetNumOperands(user);
                for i in 0..num_operands {
                    if LLVMGetOperand(user, i as u32) == block_value {
                        LLVMSetOperand(user, i as u32, pre_value);
                    }
                }
            }
            _ => {}
        }
    }

    // Clone the callee body with arguments substituted for parameters.
    let mut value_map: FxHashMap<LLVMValueRef, LLVMValueRef> = FxHashMap::default();
    let params = LLVMCountParams(callee);
    for i in 0..params {
        value_map.insert(LLVMGetParam(callee, i), LLVMGetOperand(call, i));
    }
    let block_map = clone_body(callee, func, &mut value_map);

    let entry_clone = block_map[&LLVMGetEntryBasicBlock(callee)];
    builder.position_at_end(pre);
    LLVMBuildBr(builder.as_ptr(), entry_clone);

    // Rewrite cloned returns into branches back to the continuation.
    let mut returns: Vec<(LLVMBasicBlockRef, LLVMValueRef)> = Vec::new();
    for &new_block in block_map.values() {
        let terminator = LLVMGetBasicBlockTerminator(new_block);
        if terminator.is_null()
            || LLVMGetInstructionOpcode(terminator) != LLVMOpcode::LLVMRet
        {
            continue;
        }
        let ret_value = if LLVMGetNumOperands(terminator) > 0 {
            LLVMGetOperand(terminator, 0)
        } else {
            std::ptr::null_mut()
        };
        LLVMInstructionEraseFromParent(terminator);
        builder.position_at_end(new_block);
        LLVMBuildBr(builder.as_ptr(), block);
        returns.push((new_block, ret_value));
    }

    // The call is now the first instruction of the continuation, so a phi
    // built immediately before it becomes the block's leading phi.
    let call_type = LLVMTypeOf(call);
    if LLVMGetTypeKind(call_type) != LLVMTypeKind::LLVMVoidTypeKind {
        if returns.is_empty() {
            // Callee never returns; the call's value is unreachable.
            LLVMReplaceAllUsesWith(call, LLVMGetUndef(call_type));
        } else {
            LLVMPositionBuilder(builder.as_ptr(), block, call);
            let phi = LLVMBuildPhi(builder.as_ptr(), call_type, c"inline.ret".as_ptr());
            for (ret_block, ret_value) in returns {
                let mut value = ret_value;
                let mut pred = ret_block;
                LLVMAddIncoming(phi, &mut value, &mut pred, 1);
            }
            LLVMReplaceAllUsesWith(call, phi);
        }
    }
    LLVMInstructionEraseFromParent(call);
}

/// Take ownership of an LLVM error and render its message.
unsafe fn llvm_error_message(error: llvm_sys::error::LLVMErrorRef) -> String {
    let raw = llvm_sys::error::LLVMGetErrorMessage(error);
    if raw.is_null() {
        return "unknown error".to_string();
    }
    let message = std::ffi::CStr::from_ptr(raw).to_string_lossy().into_owned();
    llvm_sys::error::LLVMDisposeErrorMessage(raw);
    message
}

/// Owns a raw `LLVMPassBuilderOptionsRef` for the duration of one pass run.
struct PassOptions {
    raw: pb::LLVMPassBuilderOptionsRef,
}

impl PassOptions {
    fn create() -> Option<Self> {
        let raw = unsafe { pb::LLVMCreatePassBuilderOptions() };
        (!raw.is_null()).then_some(Self { raw })
    }
}

impl Drop for PassOptions {
    fn drop(&mut self) {
        unsafe { pb::LLVMDisposePassBuilderOptions(self.raw) };
    }
}
