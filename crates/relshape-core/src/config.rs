//! Query configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How queries with collection navigations are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuerySplittingBehavior {
    /// One command; collections are joined into the root query.
    #[default]
    SingleQuery,
    /// One command per collection navigation, correlated by key columns.
    SplitQuery,
}

/// Whether materialized entities are tracked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryTrackingBehavior {
    /// Entities are registered with the state manager, which resolves identity.
    #[default]
    TrackAll,
    /// Nothing is tracked; repeated keys produce distinct instances.
    NoTracking,
    /// Nothing is tracked, but identity is resolved within one enumeration.
    NoTrackingWithIdentityResolution,
}

impl QueryTrackingBehavior {
    pub fn is_tracking(&self) -> bool {
        matches!(self, QueryTrackingBehavior::TrackAll)
    }

    pub fn resolves_identity(&self) -> bool {
        !matches!(self, QueryTrackingBehavior::NoTracking)
    }
}

/// Options controlling compilation and execution of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Single or split execution of collection navigations.
    pub splitting: QuerySplittingBehavior,
    /// Entity tracking mode.
    pub tracking: QueryTrackingBehavior,
    /// Rewrite converted boolean columns in predicate position to `= TRUE`.
    /// Needed for stores without boolean truth-in-predicate semantics.
    pub compensate_converted_bools: bool,
    /// Fail fast when a second pull starts before the previous one returned.
    pub detect_concurrent_access: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            splitting: QuerySplittingBehavior::SingleQuery,
            tracking: QueryTrackingBehavior::TrackAll,
            compensate_converted_bools: true,
            detect_concurrent_access: true,
        }
    }
}

impl QueryOptions {
    /// Parse options from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Ir(relshape_ir::Error::from(e)))
    }

    /// Set the splitting behavior.
    pub fn splitting(mut self, splitting: QuerySplittingBehavior) -> Self {
        self.splitting = splitting;
        self
    }

    /// Use split queries.
    pub fn split_query(self) -> Self {
        self.splitting(QuerySplittingBehavior::SplitQuery)
    }

    /// Set the tracking behavior.
    pub fn tracking(mut self, tracking: QueryTrackingBehavior) -> Self {
        self.tracking = tracking;
        self
    }

    /// Set whether converted booleans are compensated.
    pub fn compensate_converted_bools(mut self, enabled: bool) -> Self {
        self.compensate_converted_bools = enabled;
        self
    }

    /// Set whether concurrent access is detected.
    pub fn detect_concurrent_access(mut self, enabled: bool) -> Self {
        self.detect_concurrent_access = enabled;
        self
    }

    pub fn is_split(&self) -> bool {
        self.splitting == QuerySplittingBehavior::SplitQuery
    }
}

/// Retry policy for [`RetryingExecutionStrategy`](crate::execution::RetryingExecutionStrategy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub base_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given retry count and default delays.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set the base delay.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}
