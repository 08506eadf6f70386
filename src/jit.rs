//! JIT compilation and native linking.
//!
//! After `optimize_module`, operators exchange their finalized function
//! handles for native entry points. Linking is the one engine operation that
//! is safe to call from multiple fragment-execution threads concurrently:
//! everything it mutates (the address map and the linked set) sits behind
//! the jitted-function lock, and everything else it reads (the compiled
//! flag, the finalized-function snapshot, the scratch total) is frozen
//! before the engine may be shared. The engine type itself is `!Sync`, so
//! the caller supplies the cross-thread boundary and confines the shared
//! phase to `link` calls.

use inkwell::values::FunctionValue;
use tracing::debug;

use crate::engine::CodegenEngine;
use crate::error::CodegenError;

/// A natively linked function: its entry point in the running process plus
/// the scratch-buffer size generated code expects the caller to provide per
/// invocation.
///
/// The address is valid until the engine that produced it is dropped. The
/// caller transmutes it to the matching `extern "C"` signature.
#[derive(Debug, Clone, Copy)]
pub struct LinkedFunction {
    pub addr: usize,
    pub scratch_size: usize,
}

impl<'ctx> CodegenEngine<'ctx> {
    /// Compile `function` to native code (if not already compiled) and
    /// return its entry point. Idempotent: linking the same function twice,
    /// from the same thread or concurrently, returns the same address.
    ///
    /// Requires a compiled module and a function in `Finalized` or `Linked`
    /// state; a function that skipped [`finalize_function`] is rejected with
    /// [`CodegenError::NotFinalized`] rather than handed to the JIT
    /// unverified.
    ///
    /// [`finalize_function`]: CodegenEngine::finalize_function
    pub fn link(&self, function: FunctionValue<'ctx>) -> Result<LinkedFunction, CodegenError> {
        assert!(
            self.is_compiled(),
            "link requires optimize_module to have run"
        );
        if self.is_corrupt() {
            return Err(CodegenError::Corrupt);
        }

        let name = function.get_name().to_string_lossy().into_owned();
        let key = Self::fn_key(function);
        if !self.finalized_for_linking(key) {
            return Err(CodegenError::NotFinalized(name));
        }

        let mut jitted = self.jitted().lock();
        let addr = match jitted.addrs.get(&name) {
            Some(&addr) => addr,
            None => {
                let addr = self
                    .execution_engine()
                    .get_function_address(&name)
                    .map_err(|e| CodegenError::Link(name.clone(), e.to_string()))?;
                jitted.addrs.insert(name.clone(), addr);
                debug!(function = %name, addr = %format_args!("{addr:#x}"), "linked function");
                addr
            }
        };
        jitted.linked.insert(key);

        Ok(LinkedFunction {
            addr,
            scratch_size: self.scratch_size(),
        })
    }
}
