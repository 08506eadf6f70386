//! Error types for the codegen engine.
//!
//! Two severities, matching the engine's recovery contract:
//!
//! - **Per-function**: verification failures, duplicate expression ids,
//!   rejected in-place rewrites. The caller abandons codegen for that one
//!   operator and falls back to interpreted execution; the engine stays
//!   usable.
//! - **Instance-fatal**: template module load failures and whole-module
//!   optimization faults. The engine is marked corrupt and the whole
//!   fragment falls back to interpreted execution.
//!
//! Contract violations (registering a function after `optimize_module`,
//! reserving scratch space after compilation) are not errors at all; they
//! assert, because they indicate a bug in the calling operator.

use thiserror::Error;

/// Errors produced by [`CodegenEngine`](crate::engine::CodegenEngine).
#[derive(Debug, Error)]
pub enum CodegenError {
    /// The pre-compiled template module could not be read or parsed.
    /// Instance-fatal: construction fails, no partial engine is returned.
    #[error("failed to load template module: {0}")]
    TemplateLoad(String),

    /// The template module parsed but is missing an expected function.
    /// This is a build/deployment invariant violation, not a per-query error.
    #[error("template module is missing function '{0}'")]
    MissingTemplate(&'static str),

    /// The JIT execution engine could not be created for this module.
    #[error("failed to create execution engine: {0}")]
    ExecutionEngine(String),

    /// An expression function id was registered twice. Ids are write-once;
    /// the caller should reuse the existing function via `lookup_expr_fn`.
    #[error("expression function id {0} is already registered")]
    DuplicateExprId(i64),

    /// In-place call-site replacement was requested for a function that has
    /// already been linked into the process. Rewriting it would unlink code
    /// another thread may be executing, so the request is rejected.
    #[error("function '{0}' is already linked and cannot be rewritten in place")]
    AlreadyLinked(String),

    /// A link request was made for a function that never passed
    /// `finalize_function`. The linker never links unverified functions.
    #[error("function '{0}' was not finalized before linking")]
    NotFinalized(String),

    /// The JIT could not resolve a function to a native address.
    #[error("jit link failed for '{0}': {1}")]
    Link(String, String),

    /// Whole-module optimization hit an internal LLVM fault.
    /// Instance-fatal: the engine is marked corrupt.
    #[error("module optimization failed: {0}")]
    Optimize(String),

    /// The engine was marked corrupt by an earlier instance-fatal failure;
    /// no further codegen may be attempted on it.
    #[error("codegen engine is corrupt")]
    Corrupt,
}
