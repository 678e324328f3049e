//! Relational command cache.
//!
//! Commands are created once per parameter nullability and shared by every
//! enumeration of a compiled query.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use relshape_ir::SelectExpr;
use tracing::debug;

use super::command::{
    ParameterNullability, ParameterValues, RelationalCommand, RelationalCommandFactory,
};
use crate::error::Result;

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    /// Get hit count.
    pub fn hits(&self) -> u64 {
        self.hits.load(AtomicOrdering::Relaxed)
    }

    /// Get miss count.
    pub fn misses(&self) -> u64 {
        self.misses.load(AtomicOrdering::Relaxed)
    }

    /// Calculate hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }
}

/// Commands for one finalized select, keyed by parameter nullability.
pub struct RelationalCommandCache {
    select: SelectExpr,
    factory: Arc<dyn RelationalCommandFactory>,
    commands: DashMap<ParameterNullability, Arc<dyn RelationalCommand>>,
    stats: CacheStats,
}

impl RelationalCommandCache {
    /// Create a new, empty cache for `select`.
    pub fn new(select: SelectExpr, factory: Arc<dyn RelationalCommandFactory>) -> Self {
        Self {
            select,
            factory,
            commands: DashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Get the command for the given parameter values, creating it on a miss.
    pub fn get(&self, parameters: &ParameterValues) -> Result<Arc<dyn RelationalCommand>> {
        let nullability = ParameterNullability::of(parameters);
        if let Some(command) = self.commands.get(&nullability) {
            self.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
            return Ok(Arc::clone(command.value()));
        }

        self.stats.misses.fetch_add(1, AtomicOrdering::Relaxed);
        let command = self.factory.create(&self.select, &nullability)?;
        debug!(command = command.command_text(), "created relational command");
        let command = self.commands.entry(nullability).or_insert(command);
        Ok(Arc::clone(command.value()))
    }

    pub fn select(&self) -> &SelectExpr {
        &self.select
    }

    /// Get cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Get the current number of cached commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl fmt::Debug for RelationalCommandCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationalCommandCache")
            .field("commands", &self.commands.len())
            .field("hits", &self.stats.hits())
            .field("misses", &self.stats.misses())
            .finish()
    }
}
