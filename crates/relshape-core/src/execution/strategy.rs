//! Execution strategies.
//!
//! The strategy wraps the operation that opens a reader. It decides whether a
//! failed attempt is retried; the enumerator only states that the operation is
//! idempotent.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::warn;

use super::command::DataReader;
use crate::config::RetryPolicy;
use crate::error::Result;

/// Synchronous reader-opening operation.
pub type OpenReader<'a> = &'a (dyn Fn() -> Result<Box<dyn DataReader>> + Send + Sync);

/// Asynchronous reader-opening operation.
pub type OpenReaderAsync<'a> =
    &'a (dyn Fn() -> BoxFuture<'static, Result<Box<dyn DataReader>>> + Send + Sync);

/// Resiliency strategy around opening a reader.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync + Debug {
    fn execute(&self, idempotent: bool, operation: OpenReader<'_>) -> Result<Box<dyn DataReader>>;

    async fn execute_async(
        &self,
        idempotent: bool,
        operation: OpenReaderAsync<'_>,
    ) -> Result<Box<dyn DataReader>>;
}

/// Runs the operation exactly once.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryStrategy;

#[async_trait]
impl ExecutionStrategy for NoRetryStrategy {
    fn execute(&self, _idempotent: bool, operation: OpenReader<'_>) -> Result<Box<dyn DataReader>> {
        operation()
    }

    async fn execute_async(
        &self,
        _idempotent: bool,
        operation: OpenReaderAsync<'_>,
    ) -> Result<Box<dyn DataReader>> {
        operation().await
    }
}

/// Retries idempotent operations that fail with a transient error.
#[derive(Debug, Clone, Default)]
pub struct RetryingExecutionStrategy {
    policy: RetryPolicy,
}

impl RetryingExecutionStrategy {
    /// Create a new retrying strategy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay before the next attempt, or `None` when the error is final.
    fn next_delay(&self, idempotent: bool, attempt: u32, error: &crate::Error) -> Option<Duration> {
        if !idempotent || !error.is_transient() || attempt >= self.policy.max_retries {
            return None;
        }
        let delay = self.policy.delay_for(attempt);
        warn!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying transient failure"
        );
        Some(delay)
    }
}

#[async_trait]
impl ExecutionStrategy for RetryingExecutionStrategy {
    fn execute(&self, idempotent: bool, operation: OpenReader<'_>) -> Result<Box<dyn DataReader>> {
        let mut attempt = 0;
        loop {
            match operation() {
                Ok(reader) => return Ok(reader),
                Err(error) => match self.next_delay(idempotent, attempt, &error) {
                    Some(delay) => std::thread::sleep(delay),
                    None => return Err(error),
                },
            }
            attempt += 1;
        }
    }

    async fn execute_async(
        &self,
        idempotent: bool,
        operation: OpenReaderAsync<'_>,
    ) -> Result<Box<dyn DataReader>> {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(reader) => return Ok(reader),
                Err(error) => match self.next_delay(idempotent, attempt, &error) {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return Err(error),
                },
            }
            attempt += 1;
        }
    }
}
