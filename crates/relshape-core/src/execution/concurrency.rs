//! Concurrent access detection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Detects a second pull entering while another one on the same context is
/// still running.
#[derive(Debug, Default)]
pub struct ConcurrencyDetector {
    in_use: AtomicBool,
}

impl ConcurrencyDetector {
    /// Create a new detector.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enter the critical section. Fails immediately if it is already held.
    pub fn enter(self: &Arc<Self>) -> Result<ConcurrencyGuard> {
        self.in_use
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| Error::ConcurrencyViolation)?;
        Ok(ConcurrencyGuard {
            detector: Arc::clone(self),
        })
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }
}

/// Releases the critical section when dropped, on every exit path.
#[derive(Debug)]
pub struct ConcurrencyGuard {
    detector: Arc<ConcurrencyDetector>,
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        self.detector.in_use.store(false, Ordering::Release);
    }
}
