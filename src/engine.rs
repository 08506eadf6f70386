//! Top-level codegen engine.
//!
//! One [`CodegenEngine`] exists per query (or per test). It owns an LLVM
//! module and the MCJIT execution engine for that module; the LLVM context is
//! borrowed from the caller so that each query gets a fully isolated
//! type/value namespace and concurrent queries never share mutable IR state.
//!
//! The engine is mostly not thread-safe. During fragment preparation,
//! operators build prototypes, clone and specialize templates, and finalize
//! functions - all single-threaded per engine instance. After
//! [`optimize_module`](CodegenEngine::optimize_module) runs, the only
//! operation safe to call from multiple threads is
//! [`link`](CodegenEngine::link): everything `link` mutates lives behind the
//! jitted-function mutex, and everything else it reads is frozen at compile
//! time. The type itself is `!Sync` (interior mutability, raw LLVM
//! pointers), so a caller that fans `link` out across fragment threads must
//! supply the `Send`/`Sync` boundary itself, and must confine the shared
//! phase to `link` calls.
//!
//! Dropping the engine unlinks every jitted function. Callers must guarantee
//! that no thread is still executing generated code at that point.

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::sync::OnceLock;

use inkwell::context::Context;
use inkwell::execution_engine::ExecutionEngine;
use inkwell::memory_buffer::MemoryBuffer;
use inkwell::module::Module;
use inkwell::types::{PointerType, StructType};
use inkwell::values::{AnyValue, AsValueRef, FunctionValue, IntValue};
use inkwell::{AddressSpace, OptimizationLevel};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error};

use crate::error::CodegenError;
use crate::templates::TemplateFn;

/// Named struct type for the engine's variable-length string representation,
/// defined by the cross-compiled template module. Synthesized with the same
/// layout when the engine is constructed without templates.
pub const STRING_VALUE_TYPE_NAME: &str = "struct.reef.StringValue";

/// Natural alignment for scratch-buffer reservations.
const SCRATCH_ALIGN: usize = 8;

/// Alignment padding applied to the total scratch size reported by the linker.
const SCRATCH_TOTAL_ALIGN: usize = 16;

pub(crate) fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Everything the linker mutates, behind one lock so concurrent `link`
/// calls are serialized against each other.
#[derive(Default)]
pub(crate) struct JitTable {
    /// Jitted functions, name -> native address.
    pub(crate) addrs: FxHashMap<String, usize>,
    /// Value identities of linked functions; the `Linked` lifecycle state
    /// lives here rather than in the single-threaded state map.
    pub(crate) linked: FxHashSet<usize>,
}

/// Lifecycle of a function inside the engine.
///
/// Transitions are forward-only: `Declared -> Defined -> Finalized -> Linked`.
/// Operations that would regress a state are rejected; in particular an
/// in-place rewrite of a `Linked` function fails with
/// [`CodegenError::AlreadyLinked`] instead of unlinking code another thread
/// may be executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnState {
    /// Declaration only, no body.
    Declared,
    /// Has a body, still mutable.
    Defined,
    /// Verified and marked for inlining; eligible for module optimization
    /// and linking.
    Finalized,
    /// Resolved to a native address in the running process.
    Linked,
}

/// LLVM code generator for one query. The top level object to generate
/// jitted code.
///
/// Function handles fall into three disjoint categories, tracked in separate
/// registries rather than through any virtual behavior:
///
/// - *template*: loaded verbatim from the pre-compiled module, keyed by
///   [`TemplateFn`];
/// - *codegen'd*: constructed or cloned at runtime for one operator instance;
/// - *registered-expression*: codegen'd functions additionally keyed by a
///   caller-supplied 64-bit id so identical expressions elsewhere in the plan
///   can reuse them.
pub struct CodegenEngine<'ctx> {
    name: String,

    llcx: &'ctx Context,
    module: Module<'ctx>,
    execution_engine: ExecutionEngine<'ctx>,

    /// If false, `optimize_module` skips the whole-module pass pipeline.
    optimizations_enabled: Cell<bool>,
    /// An unrecoverable internal fault occurred; the instance must be
    /// discarded and the query falls back to interpreted execution.
    is_corrupt: Cell<bool>,
    /// The module has been compiled. No function registration, cloning, or
    /// scratch reservation is valid afterward.
    is_compiled: Cell<bool>,

    // Common types and constants, materialized once per context.
    ptr_type: PointerType<'ctx>,
    string_value_type: StructType<'ctx>,
    true_value: IntValue<'ctx>,
    false_value: IntValue<'ctx>,

    /// Functions parsed from the pre-compiled template module.
    templates: RefCell<FxHashMap<TemplateFn, FunctionValue<'ctx>>>,
    /// Functions generated at runtime. Does not overlap with `templates`.
    codegend_fns: RefCell<Vec<FunctionValue<'ctx>>>,
    /// Expression functions keyed by caller-chosen id. Write-once per id.
    registered_exprs: RefCell<FxHashMap<i64, FunctionValue<'ctx>>>,
    /// Value identities of everything in `registered_exprs`, for quick
    /// membership checks during inlining.
    registered_expr_set: RefCell<FxHashSet<usize>>,

    /// Per-function lifecycle states up to `Finalized`, keyed by value
    /// identity. Mutated only during single-threaded preparation; the
    /// `Linked` state is tracked in [`JitTable`] under its lock.
    fn_states: RefCell<FxHashMap<usize, FnState>>,

    /// Snapshot of the finalized function identities, frozen when the module
    /// is compiled. `link` consults this instead of `fn_states` so it never
    /// touches unsynchronized state.
    finalized_at_compile: OnceLock<FxHashSet<usize>>,

    /// Generated hash functions by fixed byte width (`None` = variable
    /// length). Entries are built once and reused.
    pub(crate) hash_fns: RefCell<FxHashMap<Option<u32>, FunctionValue<'ctx>>>,

    /// Generated min/max functions by operand type, `true` = min.
    pub(crate) min_max_fns: RefCell<FxHashMap<(crate::types::LogicalType, bool), FunctionValue<'ctx>>>,

    /// Running offset into the per-invocation scratch region.
    scratch_offset: Cell<usize>,

    /// Linker bookkeeping. Guarded by a lock: `link` is the one operation
    /// callable concurrently.
    jitted: Mutex<JitTable>,

    /// Suffix source for clone names, so repeated specializations of one
    /// template get distinct symbols.
    clone_counter: Cell<u64>,
}

impl<'ctx> CodegenEngine<'ctx> {
    /// Create an engine over an empty module. This is the test interface;
    /// the query engine constructs via [`from_template_file`].
    ///
    /// [`from_template_file`]: CodegenEngine::from_template_file
    pub fn new(context: &'ctx Context, name: &str) -> Result<Self, CodegenError> {
        crate::initialize_llvm();
        let module = context.create_module(name);
        Self::init(context, module, name)
    }

    /// Create an engine from LLVM IR text held in memory. The module is not
    /// validated against the template enumeration; whichever template
    /// symbols it defines become available through
    /// [`get_template`](CodegenEngine::get_template).
    pub fn from_ir(context: &'ctx Context, name: &str, ir: &str) -> Result<Self, CodegenError> {
        crate::initialize_llvm();
        let buffer = MemoryBuffer::create_from_memory_range_copy(ir.as_bytes(), name);
        let module = context
            .create_module_from_ir(buffer)
            .map_err(|e| CodegenError::TemplateLoad(e.to_string()))?;
        let engine = Self::init(context, module, name)?;
        engine.load_templates(false)?;
        Ok(engine)
    }

    /// Create an engine from the pre-compiled template module on disk
    /// (bitcode or IR text). Every [`TemplateFn`] entry must resolve;
    /// otherwise construction fails and no partial engine is returned.
    pub fn from_template_file(
        context: &'ctx Context,
        path: &Path,
    ) -> Result<Self, CodegenError> {
        crate::initialize_llvm();
        let bytes = std::fs::read(path)
            .map_err(|e| CodegenError::TemplateLoad(format!("{}: {e}", path.display())))?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "reef_templates".to_string());

        let buffer = MemoryBuffer::create_from_memory_range_copy(&bytes, &name);
        let module = match Module::parse_bitcode_from_buffer(&buffer, context) {
            Ok(module) => module,
            // Not bitcode; retry as textual IR.
            Err(_) => {
                let buffer = MemoryBuffer::create_from_memory_range_copy(&bytes, &name);
                context
                    .create_module_from_ir(buffer)
                    .map_err(|e| CodegenError::TemplateLoad(e.to_string()))?
            }
        };

        let engine = Self::init(context, module, &name)?;
        engine.load_templates(true)?;
        debug!(module = %name, "loaded template module");
        Ok(engine)
    }

    fn init(
        context: &'ctx Context,
        module: Module<'ctx>,
        name: &str,
    ) -> Result<Self, CodegenError> {
        let execution_engine = module
            .create_jit_execution_engine(OptimizationLevel::None)
            .map_err(|e| CodegenError::ExecutionEngine(e.to_string()))?;

        let ptr_type = context.ptr_type(AddressSpace::default());
        let string_value_type = module
            .get_struct_type(STRING_VALUE_TYPE_NAME)
            .unwrap_or_else(|| {
                let ty = context.opaque_struct_type(STRING_VALUE_TYPE_NAME);
                ty.set_body(&[ptr_type.into(), context.i32_type().into()], false);
                ty
            });

        Ok(Self {
            name: name.to_string(),
            llcx: context,
            module,
            execution_engine,
            optimizations_enabled: Cell::new(true),
            is_corrupt: Cell::new(false),
            is_compiled: Cell::new(false),
            ptr_type,
            string_value_type,
            true_value: context.bool_type().const_int(1, false),
            false_value: context.bool_type().const_int(0, false),
            templates: RefCell::new(FxHashMap::default()),
            codegend_fns: RefCell::new(Vec::new()),
            registered_exprs: RefCell::new(FxHashMap::default()),
            registered_expr_set: RefCell::new(FxHashSet::default()),
            fn_states: RefCell::new(FxHashMap::default()),
            finalized_at_compile: OnceLock::new(),
            hash_fns: RefCell::new(FxHashMap::default()),
            min_max_fns: RefCell::new(FxHashMap::default()),
            scratch_offset: Cell::new(0),
            jitted: Mutex::new(JitTable::default()),
            clone_counter: Cell::new(0),
        })
    }

    /// Index template functions found in the module. With `strict`, every
    /// enumeration entry must be present.
    fn load_templates(&self, strict: bool) -> Result<(), CodegenError> {
        for kind in TemplateFn::ALL {
            match self.module.get_function(kind.symbol()) {
                Some(function) => {
                    self.templates.borrow_mut().insert(kind, function);
                    self.set_state(function, FnState::Defined);
                }
                None if strict => return Err(CodegenError::MissingTemplate(kind.symbol())),
                None => {}
            }
        }
        Ok(())
    }

    // -- Accessors --

    /// Name of the jitted module. Useful for debugging.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The LLVM context this engine generates into.
    pub fn llcx(&self) -> &'ctx Context {
        self.llcx
    }

    /// The underlying module.
    pub fn module(&self) -> &Module<'ctx> {
        &self.module
    }

    pub(crate) fn execution_engine(&self) -> &ExecutionEngine<'ctx> {
        &self.execution_engine
    }

    /// True once `optimize_module` has run.
    pub fn is_compiled(&self) -> bool {
        self.is_compiled.get()
    }

    /// True if an instance-fatal fault occurred. The caller must discard the
    /// engine and fall back to interpreted execution for the whole fragment.
    pub fn is_corrupt(&self) -> bool {
        self.is_corrupt.get()
    }

    /// Turn optimization passes on or off. On by default; tests turn them
    /// off to inspect unoptimized IR.
    pub fn enable_optimizations(&self, enable: bool) {
        self.optimizations_enabled.set(enable);
    }

    pub(crate) fn optimizations_enabled(&self) -> bool {
        self.optimizations_enabled.get()
    }

    pub(crate) fn mark_corrupt(&self) {
        self.is_corrupt.set(true);
    }

    /// Flip the compiled flag and freeze the set of finalized functions, so
    /// the linker can check eligibility without reading mutable state.
    pub(crate) fn mark_compiled(&self) {
        let finalized: FxHashSet<usize> = self
            .fn_states
            .borrow()
            .iter()
            .filter(|(_, state)| **state == FnState::Finalized)
            .map(|(key, _)| *key)
            .collect();
        let _ = self.finalized_at_compile.set(finalized);
        self.is_compiled.set(true);
    }

    pub(crate) fn finalized_for_linking(&self, key: usize) -> bool {
        self.finalized_at_compile
            .get()
            .is_some_and(|set| set.contains(&key))
    }

    // -- Function state machine --

    pub(crate) fn fn_key(function: FunctionValue<'ctx>) -> usize {
        function.as_value_ref() as usize
    }

    /// Current lifecycle state of `function`, if the engine is tracking it.
    ///
    /// Preparation-phase only: `Linked` is tracked under the jitted lock,
    /// but the `fn_states` read makes this unsafe concurrent with `link`.
    pub fn state_of(&self, function: FunctionValue<'ctx>) -> Option<FnState> {
        let key = Self::fn_key(function);
        if self.jitted.lock().linked.contains(&key) {
            return Some(FnState::Linked);
        }
        self.fn_states.borrow().get(&key).copied()
    }

    pub(crate) fn set_state(&self, function: FunctionValue<'ctx>, state: FnState) {
        self.fn_states
            .borrow_mut()
            .insert(Self::fn_key(function), state);
    }

    // -- Registries --

    /// O(1) lookup of a pre-loaded template function.
    ///
    /// Returns `None` and marks the instance corrupt if the template module
    /// was not loaded or does not contain the entry: that is a
    /// build/deployment invariant violation, and no codegen can be trusted
    /// for this query.
    pub fn get_template(&self, kind: TemplateFn) -> Option<FunctionValue<'ctx>> {
        let function = self.templates.borrow().get(&kind).copied();
        if function.is_none() {
            error!(template = kind.symbol(), module = %self.name,
                "template function missing from module; marking engine corrupt");
            self.mark_corrupt();
        }
        function
    }

    /// Record a runtime-generated function. Called by the prototype builder
    /// and the specializer; operators do not call this directly.
    pub(crate) fn record_codegend_fn(&self, function: FunctionValue<'ctx>) {
        assert!(
            !self.is_compiled(),
            "no function may be added after the module is compiled"
        );
        self.codegend_fns.borrow_mut().push(function);
    }

    /// Drop a function from the codegen'd registry. Only the test-only hash
    /// cache clear needs this, before deleting the function from the module.
    #[cfg(test)]
    pub(crate) fn forget_codegend_fn(&self, function: FunctionValue<'ctx>) {
        self.codegend_fns.borrow_mut().retain(|f| *f != function);
    }

    /// Register an expression function under a unique id so that identical
    /// expressions elsewhere in the plan can retrieve and reuse it.
    ///
    /// Ids are write-once; a duplicate registration is a logic fault in the
    /// caller and is reported as [`CodegenError::DuplicateExprId`].
    pub fn register_expr_fn(
        &self,
        id: i64,
        function: FunctionValue<'ctx>,
    ) -> Result<(), CodegenError> {
        assert!(
            !self.is_compiled(),
            "no function may be registered after the module is compiled"
        );
        let mut map = self.registered_exprs.borrow_mut();
        if map.contains_key(&id) {
            return Err(CodegenError::DuplicateExprId(id));
        }
        map.insert(id, function);
        self.registered_expr_set
            .borrow_mut()
            .insert(Self::fn_key(function));
        Ok(())
    }

    /// Look up a registered expression function. `None` is a valid outcome,
    /// meaning the caller should build (and register) a new one.
    pub fn lookup_expr_fn(&self, id: i64) -> Option<FunctionValue<'ctx>> {
        self.registered_exprs.borrow().get(&id).copied()
    }

    pub(crate) fn is_registered_expr(&self, function_ref: usize) -> bool {
        self.registered_expr_set.borrow().contains(&function_ref)
    }

    /// All functions in the module that have bodies. Pure declarations are
    /// excluded. Used by the whole-module optimizer and by diagnostics.
    pub fn defined_functions(&self) -> Vec<FunctionValue<'ctx>> {
        self.module
            .get_functions()
            .filter(|f| f.count_basic_blocks() > 0)
            .collect()
    }

    /// Fresh symbol suffix for clones of `base`.
    pub(crate) fn next_clone_name(&self, base: &str) -> String {
        let n = self.clone_counter.get();
        self.clone_counter.set(n + 1);
        format!("{base}.clone{n}")
    }

    // -- Scratch buffer allocator --

    /// Reserve `byte_size` bytes in the per-invocation scratch region and
    /// return the offset of the reservation.
    ///
    /// Generated code uses the scratch region for values that cannot be
    /// returned through registers, e.g. intermediate `StringValue` structs.
    /// The caller supplies the actual buffer at execution time, sized by the
    /// `scratch_size` the linker reports. Offsets are strictly increasing and
    /// never overlap; each reservation is rounded up to natural alignment.
    ///
    /// Preparation-phase only: reserving after `optimize_module` asserts.
    pub fn reserve_scratch(&self, byte_size: usize) -> usize {
        assert!(
            !self.is_compiled(),
            "scratch space may not be reserved after the module is compiled"
        );
        debug_assert!(byte_size > 0, "zero-sized scratch reservation");
        let offset = self.scratch_offset.get();
        self.scratch_offset
            .set(offset + align_up(byte_size, SCRATCH_ALIGN));
        offset
    }

    /// Total scratch-region size reserved so far, padded for alignment.
    /// This is what the linker reports alongside every native pointer.
    pub fn scratch_size(&self) -> usize {
        align_up(self.scratch_offset.get(), SCRATCH_TOTAL_ALIGN)
    }

    // -- Linked-function bookkeeping (shared with jit.rs) --

    pub(crate) fn jitted(&self) -> &Mutex<JitTable> {
        &self.jitted
    }

    // -- Diagnostics --

    /// IR that was generated, for logging. If `full_module`, the entire
    /// module is printed, including the pre-compiled templates; otherwise
    /// only runtime-generated functions.
    pub fn ir_text(&self, full_module: bool) -> String {
        if full_module {
            return self.module.print_to_string().to_string();
        }
        let mut out = String::new();
        for function in self.codegend_fns.borrow().iter() {
            out.push_str(&function.print_to_string().to_string());
            out.push('\n');
        }
        out
    }

    // -- Type and constant mapper state (shared with types.rs) --

    /// Opaque pointer type (`i8*` in the pre-opaque-pointer sense).
    pub fn ptr_type(&self) -> PointerType<'ctx> {
        self.ptr_type
    }

    /// Named struct for the engine's variable-length string representation.
    pub fn string_value_type(&self) -> StructType<'ctx> {
        self.string_value_type
    }

    /// Singleton `i1 1`.
    pub fn true_value(&self) -> IntValue<'ctx> {
        self.true_value
    }

    /// Singleton `i1 0`.
    pub fn false_value(&self) -> IntValue<'ctx> {
        self.false_value
    }
}

impl Drop for CodegenEngine<'_> {
    /// Removes all jit compiled, dynamically linked functions from the
    /// process. Unsafe if any other thread is still executing them; callers
    /// must guarantee execution has completed before dropping the engine.
    fn drop(&mut self) {
        let jitted = self.jitted.lock();
        for name in jitted.addrs.keys() {
            if let Some(function) = self.module.get_function(name) {
                self.execution_engine.free_fn_machine_code(function);
            }
        }
    }
}
