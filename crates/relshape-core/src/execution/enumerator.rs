//! Query enumeration.
//!
//! Each enumeration moves through
//! `Created -> Open -> Exhausted | Faulted`, and can be disposed from any
//! state. The first pull opens the primary reader; every pull shapes one
//! top-level row, loads its related data and shapes it again.

use std::sync::Arc;

use tracing::{debug, trace};

use super::command::DataReader;
use super::compiled::CompiledQuery;
use super::context::QueryContext;
use super::coordinator::ResultCoordinator;
use super::io::{open_reader, read_row, IoMode};
use crate::error::{Error, Result};
use crate::shaper::row_shaper::IdentityScope;
use crate::shaper::{Materialized, ShapingState};

/// Lifecycle state of an enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumeratorState {
    /// No I/O has happened yet.
    Created,
    Open,
    Exhausted,
    /// A pull failed; further pulls fail with [`Error::Faulted`].
    Faulted,
    Disposed,
}

impl EnumeratorState {
    /// Whether no further element can be produced.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnumeratorState::Exhausted | EnumeratorState::Faulted | EnumeratorState::Disposed
        )
    }
}

/// State machine shared by the blocking and asynchronous enumerators.
pub(crate) struct EnumeratorCore {
    query: Arc<CompiledQuery>,
    context: QueryContext,
    state: EnumeratorState,
    reader: Option<Box<dyn DataReader>>,
    coordinator: Option<ResultCoordinator>,
}

impl EnumeratorCore {
    pub fn new(query: Arc<CompiledQuery>, context: QueryContext) -> Self {
        Self {
            query,
            context,
            state: EnumeratorState::Created,
            reader: None,
            coordinator: None,
        }
    }

    pub fn state(&self) -> EnumeratorState {
        self.state
    }

    pub fn context(&self) -> &QueryContext {
        &self.context
    }

    /// Produce the next element.
    ///
    /// A failure is reported to the diagnostics sink once, faults the
    /// enumeration and is returned unchanged.
    pub async fn pull(&mut self, mode: IoMode) -> Result<Option<Materialized>> {
        match self.state {
            EnumeratorState::Disposed => return Err(Error::Disposed),
            EnumeratorState::Faulted => return Err(Error::Faulted),
            EnumeratorState::Exhausted => return Ok(None),
            EnumeratorState::Created | EnumeratorState::Open => {}
        }

        match self.pull_guarded(mode).await {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => {
                debug!(context_type = self.context.context_type(), "query results exhausted");
                self.state = EnumeratorState::Exhausted;
                Ok(None)
            }
            Err(error) => {
                self.context
                    .diagnostics
                    .query_iteration_failed(self.context.context_type(), &error);
                self.state = EnumeratorState::Faulted;
                Err(error)
            }
        }
    }

    async fn pull_guarded(&mut self, mode: IoMode) -> Result<Option<Materialized>> {
        let _guard = if self.query.options().detect_concurrent_access {
            Some(self.context.detector.enter()?)
        } else {
            None
        };

        if self.state == EnumeratorState::Created {
            self.initialize(mode).await?;
        }
        let (Some(reader), Some(coordinator)) = (self.reader.as_mut(), self.coordinator.as_mut())
        else {
            return Err(Error::Faulted);
        };

        coordinator.shaping.context.clear();
        if coordinator.buffered_row {
            coordinator.buffered_row = false;
        } else if coordinator.primary_exhausted
            || !read_row(&mut **reader, mode, &self.context.cancellation).await?
        {
            return Ok(None);
        }

        let shaper = self.query.shaper();
        shaper.shape(&mut coordinator.shaping, &**reader)?;
        self.query
            .loader()
            .load(coordinator, &mut **reader, &self.context, mode)
            .await?;
        let value = shaper.shape(&mut coordinator.shaping, &**reader)?;
        trace!("shaped row");
        Ok(Some(value))
    }

    async fn initialize(&mut self, mode: IoMode) -> Result<()> {
        let command = self.query.command_cache().get(&self.context.parameters)?;
        debug!(
            context_type = self.context.context_type(),
            command = command.command_text(),
            "opening query reader"
        );
        let reader = open_reader(&self.context, command, mode).await?;
        let identity =
            IdentityScope::new(self.query.options().tracking, &self.context.state_manager);
        self.reader = Some(reader);
        self.coordinator = Some(ResultCoordinator::new(ShapingState::new(identity)));
        self.state = EnumeratorState::Open;
        Ok(())
    }

    /// Release every reader. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if self.state == EnumeratorState::Disposed {
            return;
        }
        if let Some(mut reader) = self.reader.take() {
            reader.close();
        }
        if let Some(mut coordinator) = self.coordinator.take() {
            coordinator.close();
        }
        trace!(context_type = self.context.context_type(), "query enumerator disposed");
        self.state = EnumeratorState::Disposed;
    }
}

/// Blocking enumerator over the results of a compiled query.
pub struct QueryEnumerator {
    core: EnumeratorCore,
}

impl QueryEnumerator {
    pub(crate) fn new(query: Arc<CompiledQuery>, context: QueryContext) -> Self {
        Self {
            core: EnumeratorCore::new(query, context),
        }
    }

    /// Advance and return the next element, or `None` when exhausted.
    pub fn move_next(&mut self) -> Result<Option<Materialized>> {
        futures::executor::block_on(self.core.pull(IoMode::Blocking))
    }

    /// Restarting an enumeration is not supported.
    pub fn reset(&mut self) -> Result<()> {
        Err(Error::Unsupported("resetting a query enumerator"))
    }

    pub fn state(&self) -> EnumeratorState {
        self.core.state()
    }

    pub fn context(&self) -> &QueryContext {
        self.core.context()
    }

    pub fn dispose(&mut self) {
        self.core.dispose();
    }
}

impl Iterator for QueryEnumerator {
    type Item = Result<Materialized>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.core.state().is_terminal() {
            return None;
        }
        self.move_next().transpose()
    }
}

impl Drop for QueryEnumerator {
    fn drop(&mut self) {
        self.core.dispose();
    }
}

impl std::fmt::Debug for QueryEnumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEnumerator")
            .field("state", &self.core.state())
            .finish_non_exhaustive()
    }
}
