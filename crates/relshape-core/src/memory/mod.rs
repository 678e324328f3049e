//! In-memory command provider.
//!
//! [`InMemoryStore`] holds named tables of provider-level values and
//! evaluates finalized select trees against them. It backs the test suite and
//! the benchmarks, and counts reader lifecycle events so disposal can be
//! observed. Transient open failures and read latency can be injected.

mod eval;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use relshape_ir::{SelectExpr, Value};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::execution::{
    DataReader, ParameterNullability, ParameterValues, RelationalCommand, RelationalCommandFactory,
};

pub use eval::{like_match, MemoryTable};

/// Reader and command counters shared by a store and its readers.
#[derive(Debug, Default)]
struct StoreCounters {
    executions: AtomicUsize,
    readers_opened: AtomicUsize,
    readers_closed: AtomicUsize,
    pending_failures: AtomicU32,
}

/// A set of in-memory tables.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<HashMap<String, MemoryTable>>,
    counters: Arc<StoreCounters>,
    read_latency: Option<Duration>,
}

impl InMemoryStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every asynchronous row read by `latency`.
    pub fn with_read_latency(mut self, latency: Duration) -> Self {
        self.read_latency = Some(latency);
        self
    }

    /// Create or replace a table.
    pub fn create_table(&self, name: &str, columns: &[&str]) {
        self.tables.write().insert(name.to_string(), MemoryTable::new(columns));
    }

    /// Append a row to a table.
    pub fn insert(&self, table: &str, row: Vec<Value>) -> Result<()> {
        let mut tables = self.tables.write();
        let stored = tables
            .get_mut(table)
            .ok_or_else(|| Error::provider(format!("unknown table {table}")))?;
        if row.len() != stored.columns.len() {
            return Err(Error::provider(format!(
                "table {table} has {} columns, row has {}",
                stored.columns.len(),
                row.len()
            )));
        }
        stored.rows.push(Arc::new(row));
        Ok(())
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, MemoryTable::len)
    }

    /// Make the next `count` command executions fail with a transient error.
    pub fn fail_next_opens(&self, count: u32) {
        self.counters.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Commands executed, including failed attempts.
    pub fn executions(&self) -> usize {
        self.counters.executions.load(Ordering::SeqCst)
    }

    pub fn readers_opened(&self) -> usize {
        self.counters.readers_opened.load(Ordering::SeqCst)
    }

    pub fn readers_closed(&self) -> usize {
        self.counters.readers_closed.load(Ordering::SeqCst)
    }

    /// Readers opened and not yet closed.
    pub fn open_readers(&self) -> usize {
        self.readers_opened().saturating_sub(self.readers_closed())
    }

    fn execute(&self, select: &SelectExpr, parameters: &ParameterValues) -> Result<MemoryReader> {
        self.counters.executions.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .counters
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::transient("injected connection failure"));
        }

        let tables = self.tables.read();
        let relation = eval::Evaluator::new(&tables, parameters).run(select)?;
        self.counters.readers_opened.fetch_add(1, Ordering::SeqCst);
        trace!(rows = relation.rows.len(), "opened memory reader");
        Ok(MemoryReader {
            rows: relation.rows,
            field_count: relation.columns.len(),
            current: None,
            next: 0,
            closed: false,
            counters: Some(Arc::clone(&self.counters)),
            read_latency: self.read_latency,
        })
    }
}

/// Creates [`MemoryCommand`]s over one store.
#[derive(Debug, Clone)]
pub struct MemoryCommandFactory {
    store: Arc<InMemoryStore>,
}

impl MemoryCommandFactory {
    /// Create a new factory.
    pub fn new(store: Arc<InMemoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }
}

impl RelationalCommandFactory for MemoryCommandFactory {
    fn create(
        &self,
        select: &SelectExpr,
        nullability: &ParameterNullability,
    ) -> Result<Arc<dyn RelationalCommand>> {
        let text = select.to_string();
        debug!(command = %text, ?nullability, "created memory command");
        Ok(Arc::new(MemoryCommand {
            store: Arc::clone(&self.store),
            select: select.clone(),
            text,
        }))
    }
}

/// A select evaluated against an [`InMemoryStore`] when executed.
#[derive(Debug)]
pub struct MemoryCommand {
    store: Arc<InMemoryStore>,
    select: SelectExpr,
    text: String,
}

#[async_trait]
impl RelationalCommand for MemoryCommand {
    fn command_text(&self) -> &str {
        &self.text
    }

    fn execute_reader(&self, parameters: &ParameterValues) -> Result<Box<dyn DataReader>> {
        Ok(Box::new(self.store.execute(&self.select, parameters)?))
    }

    async fn execute_reader_async(
        &self,
        parameters: &ParameterValues,
    ) -> Result<Box<dyn DataReader>> {
        if let Some(latency) = self.store.read_latency {
            tokio::time::sleep(latency).await;
        }
        self.execute_reader(parameters)
    }
}

/// Reader over a materialized result set.
#[derive(Debug)]
pub struct MemoryReader {
    rows: Vec<Arc<Vec<Value>>>,
    field_count: usize,
    current: Option<usize>,
    next: usize,
    closed: bool,
    counters: Option<Arc<StoreCounters>>,
    read_latency: Option<Duration>,
}

impl MemoryReader {
    /// A detached reader over the given rows.
    pub fn from_rows(rows: Vec<Vec<Value>>) -> Self {
        Self {
            field_count: rows.first().map_or(0, Vec::len),
            rows: rows.into_iter().map(Arc::new).collect(),
            current: None,
            next: 0,
            closed: false,
            counters: None,
            read_latency: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl DataReader for MemoryReader {
    fn read(&mut self) -> Result<bool> {
        if self.closed {
            return Err(Error::provider("read from a closed reader"));
        }
        if self.next < self.rows.len() {
            self.current = Some(self.next);
            self.next += 1;
            Ok(true)
        } else {
            self.current = None;
            Ok(false)
        }
    }

    async fn read_async(&mut self) -> Result<bool> {
        if let Some(latency) = self.read_latency {
            tokio::time::sleep(latency).await;
        }
        self.read()
    }

    fn field_count(&self) -> usize {
        self.field_count
    }

    fn value(&self, ordinal: usize) -> Result<Value> {
        let row = self
            .current
            .and_then(|index| self.rows.get(index))
            .ok_or_else(|| Error::provider("no current row"))?;
        row.get(ordinal)
            .cloned()
            .ok_or_else(|| {
                Error::provider(format!(
                    "ordinal {ordinal} out of range for {} fields",
                    row.len()
                ))
            })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.current = None;
        if let Some(counters) = &self.counters {
            counters.readers_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relshape_ir::{SqlExpr, TableRef};

    fn store() -> Arc<InMemoryStore> {
        let store = InMemoryStore::new();
        store.create_table("Users", &["Id", "Name"]);
        store.insert("Users", vec![Value::Int32(1), "ann".into()]).unwrap();
        store.insert("Users", vec![Value::Int32(2), Value::Null]).unwrap();
        Arc::new(store)
    }

    fn by_name() -> SelectExpr {
        let users = TableRef::new("Users", "u");
        SelectExpr::from_table(users.clone())
            .project("Id", users.column("Id", None, false))
            .filter(SqlExpr::equal(users.column("Name", None, true), SqlExpr::parameter("name")))
    }

    #[test]
    fn test_execute_binds_parameters() {
        let store = store();
        let factory = MemoryCommandFactory::new(Arc::clone(&store));
        let command = factory.create(&by_name(), &ParameterNullability::default()).unwrap();

        let mut reader = command
            .execute_reader(&ParameterValues::new().with("name", "ann"))
            .unwrap();
        assert!(reader.read().unwrap());
        assert_eq!(reader.value(0).unwrap(), Value::Int32(1));
        assert!(reader.value(1).is_err());
        assert!(!reader.read().unwrap());
        assert!(reader.value(0).is_err());

        assert_eq!(store.open_readers(), 1);
        reader.close();
        reader.close();
        assert_eq!(store.readers_closed(), 1);
        assert_eq!(store.open_readers(), 0);
    }

    #[test]
    fn test_missing_parameter_fails() {
        let factory = MemoryCommandFactory::new(store());
        let command = factory.create(&by_name(), &ParameterNullability::default()).unwrap();
        assert!(matches!(
            command.execute_reader(&ParameterValues::new()),
            Err(Error::InvalidExpression(_))
        ));
    }

    #[test]
    fn test_injected_failures_are_transient() {
        let store = store();
        store.fail_next_opens(1);
        let factory = MemoryCommandFactory::new(Arc::clone(&store));
        let command = factory.create(&by_name(), &ParameterNullability::default()).unwrap();
        let parameters = ParameterValues::new().with("name", "ann");

        assert!(matches!(command.execute_reader(&parameters), Err(e) if e.is_transient()));
        assert!(command.execute_reader(&parameters).is_ok());
        assert_eq!(store.executions(), 2);
        assert_eq!(store.readers_opened(), 1);
    }

    #[test]
    fn test_insert_checks_arity() {
        let store = store();
        assert!(store.insert("Users", vec![Value::Int32(3)]).is_err());
        assert!(store.insert("Missing", vec![]).is_err());
        assert_eq!(store.row_count("Users"), 2);
    }
}
