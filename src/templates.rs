//! Template function enumeration.
//!
//! Template functions are generic operator bodies cross-compiled to LLVM IR
//! at build time and shipped alongside the engine as a serialized module.
//! At query preparation time each physical operator instance clones its
//! template and redirects the placeholder call sites to bespoke, tuple-layout
//! specific functions (see [`replace_call_sites`]).
//!
//! The enumeration is fixed: a deployed template module must define every
//! entry. A missing entry is a build invariant violation, not a per-query
//! error, and marks the engine instance corrupt.
//!
//! [`replace_call_sites`]: crate::engine::CodegenEngine::replace_call_sites

/// Identity of a function in the pre-compiled template module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateFn {
    /// Generic aggregation loop over a row batch; calls the per-instance
    /// update placeholder once per row.
    AggProcessBatch,
    /// Placeholder called by `AggProcessBatch` for each row. Operators
    /// replace call sites to this with their generated update function.
    AggUpdateRow,
    /// Hash-join build-side batch loop.
    JoinProcessBuildBatch,
    /// Hash-join probe-side batch loop.
    JoinProcessProbeBatch,
    /// Generic two-row comparison used by the sorter; the slot-comparison
    /// placeholder inside it is replaced per sort instance.
    SortCompareRows,
}

impl TemplateFn {
    /// All template entries a deployed module must define.
    pub const ALL: [TemplateFn; 5] = [
        TemplateFn::AggProcessBatch,
        TemplateFn::AggUpdateRow,
        TemplateFn::JoinProcessBuildBatch,
        TemplateFn::JoinProcessProbeBatch,
        TemplateFn::SortCompareRows,
    ];

    /// Unmangled symbol name of the template in the IR module.
    ///
    /// These names are engine-controlled and referenced by the call-site
    /// specializer's substring matching, so they must stay stable.
    pub fn symbol(self) -> &'static str {
        match self {
            TemplateFn::AggProcessBatch => "reef_agg_process_batch",
            TemplateFn::AggUpdateRow => "reef_agg_update_row",
            TemplateFn::JoinProcessBuildBatch => "reef_join_process_build_batch",
            TemplateFn::JoinProcessProbeBatch => "reef_join_process_probe_batch",
            TemplateFn::SortCompareRows => "reef_sort_compare_rows",
        }
    }
}
