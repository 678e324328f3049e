//! Query execution.
//!
//! Compiled queries, the blocking and asynchronous enumerators that drive
//! them, and the capabilities they consume: command providers, execution
//! strategies, state tracking, diagnostics and cancellation.

pub mod async_enumerator;
pub mod cache;
pub mod command;
pub mod compiled;
pub mod concurrency;
pub mod context;
pub mod coordinator;
pub mod enumerator;
pub mod io;
pub mod strategy;

pub use async_enumerator::AsyncQueryEnumerator;
pub use cache::{CacheStats, RelationalCommandCache};
pub use command::{
    DataReader, ParameterNullability, ParameterValues, RelationalCommand, RelationalCommandFactory,
};
pub use compiled::{CompiledQuery, QueryCompiler};
pub use concurrency::{ConcurrencyDetector, ConcurrencyGuard};
pub use context::{
    CancellationSignal, CancellationSource, InMemoryStateManager, QueryContext, QueryDiagnostics,
    RecordingDiagnostics, StateManager, TracingDiagnostics,
};
pub use coordinator::ResultCoordinator;
pub use enumerator::{EnumeratorState, QueryEnumerator};
pub use io::IoMode;
pub use strategy::{
    ExecutionStrategy, NoRetryStrategy, OpenReader, OpenReaderAsync, RetryingExecutionStrategy,
};
