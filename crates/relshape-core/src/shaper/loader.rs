//! Related data loading.
//!
//! Fills the collection slots allocated by the first shaping pass of a
//! top-level row.
//!
//! In single-query mode the collections are joined into the primary result
//! set: the loader consumes the current row, then reads ahead until the
//! parent identifier changes. The first row of the next parent stays buffered
//! in the primary reader for the next pull.
//!
//! In split-query mode every collection id has its own reader, opened lazily
//! on first use. Rows are consumed while their parent identifier matches the
//! slot's; the first non-matching row is kept as lookahead for the next parent.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use relshape_ir::CompositeKey;
use tracing::{debug, trace};

use super::compiler::{read_values, ShaperProgram};
use super::row_shaper::ShapingState;
use crate::error::{Error, Result};
use crate::execution::cache::RelationalCommandCache;
use crate::execution::coordinator::{ResultCoordinator, SplitReader};
use crate::execution::io::{open_reader, read_row, IoMode};
use crate::execution::{DataReader, QueryContext};

/// The compiled related-data-loading procedure.
#[derive(Debug, Clone)]
pub struct RelatedDataLoader {
    program: Arc<ShaperProgram>,
    split_commands: HashMap<usize, Arc<RelationalCommandCache>>,
}

impl RelatedDataLoader {
    /// Create a new loader. `split_commands` holds the command cache of every
    /// split collection, keyed by collection id.
    pub fn new(
        program: Arc<ShaperProgram>,
        split_commands: HashMap<usize, Arc<RelationalCommandCache>>,
    ) -> Self {
        Self { program, split_commands }
    }

    pub fn is_split(&self) -> bool {
        self.program.has_split_collections()
    }

    /// Load every collection of the current top-level row.
    pub async fn load(
        &self,
        coordinator: &mut ResultCoordinator,
        primary: &mut dyn DataReader,
        context: &QueryContext,
        mode: IoMode,
    ) -> Result<()> {
        let roots = coordinator.shaping.context.pending.clone();
        if roots.is_empty() {
            return Ok(());
        }
        if self.is_split() {
            for slot in roots {
                self.load_split(coordinator, context, mode, slot).await?;
            }
            Ok(())
        } else {
            self.load_single(coordinator, primary, context, mode, &roots).await
        }
    }

    async fn load_single(
        &self,
        coordinator: &mut ResultCoordinator,
        primary: &mut dyn DataReader,
        context: &QueryContext,
        mode: IoMode,
        roots: &[usize],
    ) -> Result<()> {
        let mut rows = 0usize;
        loop {
            for &slot in roots {
                self.consume_row(&mut coordinator.shaping, slot, &*primary)?;
            }
            rows += 1;
            if !read_row(&mut *primary, mode, &context.cancellation).await? {
                coordinator.primary_exhausted = true;
                break;
            }
            if !self.same_parent(&coordinator.shaping, roots, &*primary)? {
                coordinator.buffered_row = true;
                break;
            }
        }
        trace!(rows, "consumed joined collection rows");
        Ok(())
    }

    fn consume_row(
        &self,
        shaping: &mut ShapingState,
        slot: usize,
        reader: &dyn DataReader,
    ) -> Result<()> {
        let collection_id = shaping.context.slot(slot)?.collection_id;
        let collection = self.program.collection(collection_id)?;
        if let Some(element) = shaping.add_element(&self.program, slot, collection, reader)? {
            for nested in shaping.nested_slots(slot, element)? {
                self.consume_row(shaping, nested, reader)?;
            }
        }
        Ok(())
    }

    fn same_parent(
        &self,
        shaping: &ShapingState,
        roots: &[usize],
        reader: &dyn DataReader,
    ) -> Result<bool> {
        for &slot in roots {
            let slot = shaping.context.slot(slot)?;
            let collection = self.program.collection(slot.collection_id)?;
            let key =
                CompositeKey::from_values(&read_values(&collection.parent_identifier, reader)?);
            if key != slot.parent_key {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn load_split<'a>(
        &'a self,
        coordinator: &'a mut ResultCoordinator,
        context: &'a QueryContext,
        mode: IoMode,
        slot: usize,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let collection_id = coordinator.shaping.context.slot(slot)?.collection_id;
            let collection = self.program.collection(collection_id)?;
            let parent_identifier = collection.split_parent_identifier.as_ref().ok_or_else(|| {
                Error::InvalidShaper(format!("collection {collection_id} has no split query"))
            })?;

            while self.position(coordinator, context, mode, collection_id).await? {
                let split = coordinator
                    .split_readers
                    .get_mut(&collection_id)
                    .ok_or_else(|| {
                        Error::InvalidShaper(format!("no reader for collection {collection_id}"))
                    })?;
                let reader: &dyn DataReader = split.reader.as_ref();
                let key = CompositeKey::from_values(&read_values(parent_identifier, reader)?);
                if key != coordinator.shaping.context.slot(slot)?.parent_key {
                    break;
                }
                split.positioned = false;
                let element = coordinator
                    .shaping
                    .add_element(&self.program, slot, collection, reader)?;
                let nested = match element {
                    Some(element) => coordinator.shaping.nested_slots(slot, element)?,
                    None => Vec::new(),
                };
                for nested in nested {
                    self.load_split(coordinator, context, mode, nested).await?;
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Make sure the reader of `collection_id` is on an unconsumed row.
    /// Returns false once it is exhausted.
    async fn position(
        &self,
        coordinator: &mut ResultCoordinator,
        context: &QueryContext,
        mode: IoMode,
        collection_id: usize,
    ) -> Result<bool> {
        if !coordinator.split_readers.contains_key(&collection_id) {
            let commands = self
                .split_commands
                .get(&collection_id)
                .ok_or_else(|| {
                    Error::InvalidShaper(format!("no split command for collection {collection_id}"))
                })?;
            let command = commands.get(&context.parameters)?;
            debug!(collection_id, command = command.command_text(), "opening split query reader");
            let reader = open_reader(context, command, mode).await?;
            coordinator.split_readers.insert(collection_id, SplitReader::new(reader));
        }
        let split = coordinator
            .split_readers
            .get_mut(&collection_id)
            .ok_or_else(|| {
                Error::InvalidShaper(format!("no reader for collection {collection_id}"))
            })?;
        if split.exhausted {
            return Ok(false);
        }
        if !split.positioned {
            if read_row(split.reader.as_mut(), mode, &context.cancellation).await? {
                split.positioned = true;
            } else {
                split.exhausted = true;
                return Ok(false);
            }
        }
        Ok(true)
    }
}
