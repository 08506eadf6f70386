//! Engine test suite.
//!
//! Tests construct one `Context` plus one `CodegenEngine` each; LLVM contexts
//! are cheap and isolation avoids any cross-test IR state. Template-based
//! tests load [`TEMPLATE_IR`], a hand-written stand-in for the cross-compiled
//! template module with the same symbol contract.

mod prototype_tests;
mod registry_tests;
mod specialize_tests;

use inkwell::values::{FunctionValue, InstructionOpcode};

/// Minimal template module: the aggregation batch loop and its per-row
/// update placeholder. The update placeholder doubles the row's first slot;
/// the batch loop sums the update result over `num_rows` contiguous i64 rows.
pub(crate) const TEMPLATE_IR: &str = r#"
define i64 @reef_agg_update_row(ptr %row) {
entry:
  %slot = load i64, ptr %row
  %doubled = add i64 %slot, %slot
  ret i64 %doubled
}

define i64 @reef_agg_process_batch(ptr %rows, i32 %num_rows) {
entry:
  br label %loop

loop:
  %i = phi i32 [ 0, %entry ], [ %i.next, %body ]
  %acc = phi i64 [ 0, %entry ], [ %acc.next, %body ]
  %more = icmp slt i32 %i, %num_rows
  br i1 %more, label %body, label %exit

body:
  %row = getelementptr inbounds i64, ptr %rows, i32 %i
  %val = call i64 @reef_agg_update_row(ptr %row)
  %acc.next = add i64 %acc, %val
  %i.next = add i32 %i, 1
  br label %loop

exit:
  ret i64 %acc
}
"#;

/// Template module defining every [`TemplateFn`](crate::TemplateFn) symbol,
/// for strict-load tests.
pub(crate) const TEMPLATE_IR_FULL: &str = r#"
define i64 @reef_agg_update_row(ptr %row) {
entry:
  %slot = load i64, ptr %row
  %doubled = add i64 %slot, %slot
  ret i64 %doubled
}

define i64 @reef_agg_process_batch(ptr %rows, i32 %num_rows) {
entry:
  %first = call i64 @reef_agg_update_row(ptr %rows)
  ret i64 %first
}

define i64 @reef_join_process_build_batch(ptr %rows, i32 %num_rows) {
entry:
  ret i64 0
}

define i64 @reef_join_process_probe_batch(ptr %rows, i32 %num_rows) {
entry:
  ret i64 0
}

define i32 @reef_sort_compare_rows(ptr %lhs, ptr %rhs) {
entry:
  %l = load i64, ptr %lhs
  %r = load i64, ptr %rhs
  %lt = icmp slt i64 %l, %r
  %gt = icmp sgt i64 %l, %r
  %lt.i = zext i1 %lt to i32
  %gt.i = zext i1 %gt to i32
  %cmp = sub i32 %gt.i, %lt.i
  ret i32 %cmp
}
"#;

/// Total instruction count across a function's blocks.
pub(crate) fn count_instructions(function: FunctionValue<'_>) -> usize {
    let mut count = 0;
    for block in function.get_basic_blocks() {
        let mut inst = block.get_first_instruction();
        while let Some(instruction) = inst {
            count += 1;
            inst = instruction.get_next_instruction();
        }
    }
    count
}

/// Number of call instructions in `function` whose callee name contains
/// `name`.
pub(crate) fn count_calls_to(function: FunctionValue<'_>, name: &str) -> usize {
    let mut count = 0;
    for block in function.get_basic_blocks() {
        let mut inst = block.get_first_instruction();
        while let Some(instruction) = inst {
            let current = instruction;
            inst = instruction.get_next_instruction();
            if current.get_opcode() != InstructionOpcode::Call {
                continue;
            }
            let callee_index = current.get_num_operands() - 1;
            let Some(callee) = current.get_operand(callee_index).and_then(|op| op.left()) else {
                continue;
            };
            if let inkwell::values::BasicValueEnum::PointerValue(p) = callee {
                if p.get_name().to_string_lossy().contains(name) {
                    count += 1;
                }
            }
        }
    }
    count
}
