//! Query context: the capabilities an enumeration runs against.
//!
//! Holds the concurrency detector, state manager, execution strategy,
//! diagnostics sink, bound parameters and cancellation signal. Cloning a
//! context shares all of them.

use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use relshape_ir::CompositeKey;
use tokio::sync::watch;
use tracing::error;

use super::command::ParameterValues;
use super::concurrency::ConcurrencyDetector;
use super::strategy::{ExecutionStrategy, NoRetryStrategy};
use crate::error::{Error, Result};
use crate::shaper::EntityRef;

/// Entity state tracking.
pub trait StateManager: Send + Sync + Debug {
    /// Called when a tracking enumeration starts.
    fn initialize(&self, perform_identity_resolution: bool);

    /// Tracked instance of the entity with this key.
    fn try_get(&self, entity_type: &str, key: &CompositeKey) -> Option<EntityRef>;

    fn start_tracking(&self, entity: &EntityRef);
}

/// State manager keeping tracked entities in memory.
#[derive(Debug, Default)]
pub struct InMemoryStateManager {
    entries: DashMap<(String, CompositeKey), EntityRef>,
    initializations: AtomicUsize,
}

impl InMemoryStateManager {
    /// Create a new, empty state manager.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of tracking enumerations started.
    pub fn initializations(&self) -> usize {
        self.initializations.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl StateManager for InMemoryStateManager {
    fn initialize(&self, _perform_identity_resolution: bool) {
        self.initializations.fetch_add(1, Ordering::Relaxed);
    }

    fn try_get(&self, entity_type: &str, key: &CompositeKey) -> Option<EntityRef> {
        self.entries
            .get(&(entity_type.to_string(), key.clone()))
            .map(|entry| entry.value().clone())
    }

    fn start_tracking(&self, entity: &EntityRef) {
        self.entries
            .entry((entity.entity_type().to_string(), entity.identity_key()))
            .or_insert_with(|| entity.clone());
    }
}

/// Notified when iterating a query fails.
pub trait QueryDiagnostics: Send + Sync + Debug {
    fn query_iteration_failed(&self, context_type: &str, error: &Error);
}

/// Emits one `error!` event per failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl QueryDiagnostics for TracingDiagnostics {
    fn query_iteration_failed(&self, context_type: &str, err: &Error) {
        error!(
            context_type,
            error = %err,
            "an exception occurred while iterating over the results of a query"
        );
    }
}

/// Records failures for inspection.
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    events: Mutex<Vec<(String, Error)>>,
}

impl RecordingDiagnostics {
    /// Create a new, empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, Error)> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl QueryDiagnostics for RecordingDiagnostics {
    fn query_iteration_failed(&self, context_type: &str, error: &Error) {
        self.events.lock().push((context_type.to_string(), error.clone()));
    }
}

/// Requests cancellation of the enumerations holding its signal.
#[derive(Debug)]
pub struct CancellationSource {
    sender: watch::Sender<bool>,
}

impl CancellationSource {
    /// Create a new, uncancelled source.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    pub fn signal(&self) -> CancellationSignal {
        CancellationSignal {
            receiver: Some(self.sender.subscribe()),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observes a [`CancellationSource`]. The default signal is never cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    receiver: Option<watch::Receiver<bool>>,
}

impl CancellationSignal {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.receiver.as_ref().map(|r| *r.borrow()).unwrap_or(false)
    }

    /// Fail with [`Error::Cancelled`] if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve once cancellation is requested; never, if it cannot be.
    pub async fn cancelled(&self) {
        let Some(receiver) = self.receiver.clone() else {
            return std::future::pending().await;
        };
        let mut receiver = receiver;
        let closed = receiver.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// Run `operation` unless cancellation is requested first.
    pub async fn race<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Error::Cancelled),
            result = operation => result,
        }
    }
}

/// Capabilities and state shared by the enumerations of one logical context.
#[derive(Clone)]
pub struct QueryContext {
    pub(crate) context_type: Arc<str>,
    pub(crate) detector: Arc<ConcurrencyDetector>,
    pub(crate) state_manager: Arc<dyn StateManager>,
    pub(crate) strategy: Arc<dyn ExecutionStrategy>,
    pub(crate) diagnostics: Arc<dyn QueryDiagnostics>,
    pub(crate) parameters: Arc<ParameterValues>,
    pub(crate) cancellation: CancellationSignal,
}

impl QueryContext {
    /// Create a new context with an in-memory state manager, no retries and
    /// tracing diagnostics.
    pub fn new(context_type: impl Into<String>) -> Self {
        let context_type: String = context_type.into();
        Self {
            context_type: Arc::from(context_type),
            detector: ConcurrencyDetector::new(),
            state_manager: Arc::new(InMemoryStateManager::new()),
            strategy: Arc::new(NoRetryStrategy),
            diagnostics: Arc::new(TracingDiagnostics),
            parameters: Arc::new(ParameterValues::new()),
            cancellation: CancellationSignal::none(),
        }
    }

    pub fn with_state_manager(mut self, state_manager: Arc<dyn StateManager>) -> Self {
        self.state_manager = state_manager;
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn ExecutionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn QueryDiagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_parameters(mut self, parameters: ParameterValues) -> Self {
        self.parameters = Arc::new(parameters);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationSignal) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn context_type(&self) -> &str {
        &self.context_type
    }

    pub fn detector(&self) -> &Arc<ConcurrencyDetector> {
        &self.detector
    }

    pub fn state_manager(&self) -> &Arc<dyn StateManager> {
        &self.state_manager
    }

    pub fn strategy(&self) -> &Arc<dyn ExecutionStrategy> {
        &self.strategy
    }

    pub fn diagnostics(&self) -> &Arc<dyn QueryDiagnostics> {
        &self.diagnostics
    }

    pub fn parameters(&self) -> &ParameterValues {
        &self.parameters
    }

    pub fn cancellation(&self) -> &CancellationSignal {
        &self.cancellation
    }
}

impl Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("context_type", &self.context_type)
            .field("strategy", &self.strategy)
            .field("parameters", &self.parameters)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relshape_ir::Value;

    #[test]
    fn test_state_manager_keeps_first_instance() {
        let manager = InMemoryStateManager::new();
        let first = EntityRef::new("Blog", vec![Value::Int32(1)], vec![]);
        let second = EntityRef::new("Blog", vec![Value::Int64(1)], vec![]);
        manager.start_tracking(&first);
        manager.start_tracking(&second);
        assert_eq!(manager.tracked_count(), 1);
        let found = manager.try_get("Blog", &second.identity_key()).unwrap();
        assert!(EntityRef::ptr_eq(&found, &first));
        assert!(manager.try_get("Post", &first.identity_key()).is_none());
    }

    #[test]
    fn test_recording_diagnostics() {
        let diagnostics = RecordingDiagnostics::new();
        diagnostics.query_iteration_failed("BloggingContext", &Error::Cancelled);
        assert_eq!(diagnostics.events(), vec![("BloggingContext".to_string(), Error::Cancelled)]);
    }

    #[test]
    fn test_cancellation_signal() {
        let source = CancellationSource::new();
        let signal = source.signal();
        assert!(signal.check().is_ok());
        source.cancel();
        assert!(source.is_cancelled());
        assert_eq!(signal.check(), Err(Error::Cancelled));
        assert!(!CancellationSignal::none().is_cancelled());
    }

    #[tokio::test]
    async fn test_race_aborts_pending_operation() {
        let source = CancellationSource::new();
        let signal = source.signal();
        let pending = async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok::<_, Error>(1)
        };
        let cancel = async {
            tokio::task::yield_now().await;
            source.cancel();
        };
        let (result, ()) = tokio::join!(signal.race(pending), cancel);
        assert_eq!(result, Err(Error::Cancelled));
        assert_eq!(signal.race(async { Ok(2) }).await, Err(Error::Cancelled));
    }
}
