//! Reader I/O shared by the blocking and asynchronous enumerators.

use std::sync::Arc;

use futures::future::FutureExt;

use super::command::{DataReader, RelationalCommand};
use super::context::{CancellationSignal, QueryContext};
use crate::error::Result;

/// How an enumeration waits for I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Calls block the current thread.
    Blocking,
    /// Calls suspend; cancellation is raced against every suspension point.
    Async,
}

/// Advance `reader` by one row.
pub(crate) async fn read_row(
    reader: &mut dyn DataReader,
    mode: IoMode,
    cancellation: &CancellationSignal,
) -> Result<bool> {
    cancellation.check()?;
    match mode {
        IoMode::Blocking => reader.read(),
        IoMode::Async => cancellation.race(reader.read_async()).await,
    }
}

/// Open a reader for `command` through the context's execution strategy.
///
/// Opening a fresh reader is always safe to repeat, so the operation is
/// marked idempotent.
pub(crate) async fn open_reader(
    context: &QueryContext,
    command: Arc<dyn RelationalCommand>,
    mode: IoMode,
) -> Result<Box<dyn DataReader>> {
    context.cancellation.check()?;
    let parameters = Arc::clone(&context.parameters);
    match mode {
        IoMode::Blocking => context
            .strategy
            .execute(true, &|| command.execute_reader(&parameters)),
        IoMode::Async => {
            let operation = move || {
                let command = Arc::clone(&command);
                let parameters = Arc::clone(&parameters);
                async move { command.execute_reader_async(&parameters).await }.boxed()
            };
            context
                .cancellation
                .race(context.strategy.execute_async(true, &operation))
                .await
        }
    }
}
