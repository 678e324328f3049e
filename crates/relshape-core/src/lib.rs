//! Relshape Core - query rewrites, shaping and enumeration.
//!
//! This crate turns a [`ShapedQuery`](relshape_ir::ShapedQuery) into a
//! [`CompiledQuery`] and enumerates its results:
//! - [`rewrite`]: finalization passes run once per compiled query
//! - [`shaper`]: compiled row shapers and related-data loading
//! - [`execution`]: blocking and asynchronous enumerators over command providers
//! - [`memory`]: an in-memory command provider

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod error;
pub mod execution;
pub mod memory;
pub mod rewrite;
pub mod shaper;

pub use config::{QueryOptions, QuerySplittingBehavior, QueryTrackingBehavior, RetryPolicy};
pub use error::{DecodeErrorKind, Error, Result};
pub use execution::{
    AsyncQueryEnumerator, CancellationSignal, CancellationSource, CompiledQuery, DataReader,
    EnumeratorState, ExecutionStrategy, InMemoryStateManager, NoRetryStrategy, ParameterValues,
    QueryCompiler, QueryContext, QueryDiagnostics, QueryEnumerator, RecordingDiagnostics,
    RelationalCommand, RelationalCommandFactory, RetryingExecutionStrategy, StateManager,
    TracingDiagnostics,
};
pub use memory::{InMemoryStore, MemoryCommandFactory, MemoryReader};
pub use rewrite::QueryPostprocessor;
pub use shaper::{EntityInstance, EntityRef, Materialized, RowShaper, ShaperCompiler};

/// Re-export the IR.
pub use relshape_ir as ir;
