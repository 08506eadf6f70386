//! Runtime LLVM code generation for the query engine.
//!
//! One [`CodegenEngine`] per query turns the plan's generic operator
//! templates and expression trees into specialized native code:
//!
//! 1. load the pre-compiled template module ([`CodegenEngine::from_template_file`]);
//! 2. per operator, build expression functions ([`FnPrototype`]), clone and
//!    specialize template bodies ([`CodegenEngine::replace_call_sites`]), and
//!    verify the results ([`CodegenEngine::finalize_function`]);
//! 3. run whole-module optimization once ([`CodegenEngine::optimize_module`]);
//! 4. exchange function handles for native entry points
//!    ([`CodegenEngine::link`]).
//!
//! Set `REEF_DEBUG_LLVM` in the environment to dump module IR before
//! optimization.

pub mod engine;
pub mod error;
pub mod prototype;
pub mod templates;
pub mod types;

mod build;
mod hash;
mod jit;
mod optimize;
mod specialize;

#[cfg(test)]
mod tests;

pub use engine::{CodegenEngine, FnState, STRING_VALUE_TYPE_NAME};
pub use error::CodegenError;
pub use jit::LinkedFunction;
pub use prototype::{FnPrototype, NamedArg};
pub use templates::TemplateFn;
pub use types::LogicalType;

use std::sync::Once;

/// Initialize LLVM's native target, once per process. Engine constructors
/// call this; it is public so embedders can front-load the cost.
pub fn initialize_llvm() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        inkwell::targets::Target::initialize_native(
            &inkwell::targets::InitializationConfig::default(),
        )
        .expect("failed to initialize native LLVM target");
    });
}

/// Install a tracing subscriber filtered by `RUST_LOG`, once per process.
/// No-op if the embedding process already installed one.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}
