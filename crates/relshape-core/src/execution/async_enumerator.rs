//! Asynchronous query enumeration.

use std::sync::Arc;

use futures::stream::{self, Stream};

use super::compiled::CompiledQuery;
use super::context::QueryContext;
use super::enumerator::{EnumeratorCore, EnumeratorState};
use super::io::IoMode;
use crate::error::{Error, Result};
use crate::shaper::Materialized;

/// Asynchronous enumerator over the results of a compiled query.
///
/// Has the same states and results as
/// [`QueryEnumerator`](super::QueryEnumerator); cursor opening and row reads
/// suspend instead of blocking, and are aborted by the context's cancellation
/// signal.
pub struct AsyncQueryEnumerator {
    core: EnumeratorCore,
}

impl AsyncQueryEnumerator {
    pub(crate) fn new(query: Arc<CompiledQuery>, context: QueryContext) -> Self {
        Self {
            core: EnumeratorCore::new(query, context),
        }
    }

    /// Advance and return the next element, or `None` when exhausted.
    pub async fn move_next(&mut self) -> Result<Option<Materialized>> {
        self.core.pull(IoMode::Async).await
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

    /// Release every reader. Closing never waits, so this completes at once.
    pub async fn dispose_async(&mut self) {
        self.core.dispose();
    }

    pub fn dispose(&mut self) {
        self.core.dispose();
    }

    /// Turn the enumerator into a stream. A failed pull is yielded once as an
    /// error and ends the stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<Materialized>> + Send {
        stream::unfold(self, |mut enumerator| async move {
            if enumerator.state().is_terminal() {
                return None;
            }
            match enumerator.move_next().await {
                Ok(Some(value)) => Some((Ok(value), enumerator)),
                Ok(None) => None,
                Err(error) => Some((Err(error), enumerator)),
            }
        })
    }
}

impl Drop for AsyncQueryEnumerator {
    fn drop(&mut self) {
        self.core.dispose();
    }
}

impl std::fmt::Debug for AsyncQueryEnumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncQueryEnumerator")
            .field("state", &self.core.state())
            .finish_non_exhaustive()
    }
}
