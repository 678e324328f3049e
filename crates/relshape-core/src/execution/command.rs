//! Command provider interfaces.
//!
//! SQL generation and the database driver are outside this crate: a
//! [`RelationalCommandFactory`] turns a finalized select into a
//! [`RelationalCommand`], which opens [`DataReader`]s over provider-level rows.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use relshape_ir::{SelectExpr, Value};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Forward-only cursor over a result set.
#[async_trait]
pub trait DataReader: Send + Sync {
    /// Advance to the next row. Returns false when the result set is exhausted.
    fn read(&mut self) -> Result<bool>;

    /// Advance to the next row, suspending while waiting for I/O.
    async fn read_async(&mut self) -> Result<bool> {
        self.read()
    }

    fn field_count(&self) -> usize;

    /// Provider-level value at `ordinal` on the current row.
    fn value(&self, ordinal: usize) -> Result<Value>;

    /// Release the cursor. Must be safe to call more than once.
    fn close(&mut self);
}

/// An executable command.
#[async_trait]
pub trait RelationalCommand: Send + Sync + Debug {
    /// Command text, for diagnostics.
    fn command_text(&self) -> &str;

    fn execute_reader(&self, parameters: &ParameterValues) -> Result<Box<dyn DataReader>>;

    async fn execute_reader_async(
        &self,
        parameters: &ParameterValues,
    ) -> Result<Box<dyn DataReader>>;
}

/// Builds commands from finalized selects.
pub trait RelationalCommandFactory: Send + Sync + Debug {
    /// Create a command for `select`. Generated text may depend on which
    /// parameters are null, never on their values.
    fn create(
        &self,
        select: &SelectExpr,
        nullability: &ParameterNullability,
    ) -> Result<Arc<dyn RelationalCommand>>;
}

/// Parameter values bound for one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterValues {
    values: BTreeMap<String, Value>,
}

impl ParameterValues {
    /// Create a new, empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// Which parameters are null. Commands are cached per nullability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ParameterNullability(Vec<(String, bool)>);

impl ParameterNullability {
    pub fn of(parameters: &ParameterValues) -> Self {
        Self(
            parameters
                .iter()
                .map(|(name, value)| (name.to_string(), value.is_null()))
                .collect(),
        )
    }

    pub fn is_null(&self, name: &str) -> bool {
        self.0.iter().any(|(n, null)| n == name && *null)
    }
}
