//! Per-enumeration result coordination.

use std::collections::HashMap;

use tracing::trace;

use super::command::DataReader;
use crate::shaper::ShapingState;

/// Reader of one split collection query.
pub(crate) struct SplitReader {
    pub reader: Box<dyn DataReader>,
    /// The current row has been read but not consumed yet.
    pub positioned: bool,
    pub exhausted: bool,
}

impl SplitReader {
    pub fn new(reader: Box<dyn DataReader>) -> Self {
        Self {
            reader,
            positioned: false,
            exhausted: false,
        }
    }
}

/// State owned by exactly one enumeration.
pub struct ResultCoordinator {
    pub(crate) shaping: ShapingState,
    /// Split collection readers by collection id.
    pub(crate) split_readers: HashMap<usize, SplitReader>,
    /// The primary reader is already positioned on the next top-level row.
    pub(crate) buffered_row: bool,
    pub(crate) primary_exhausted: bool,
}

impl ResultCoordinator {
    pub(crate) fn new(shaping: ShapingState) -> Self {
        Self {
            shaping,
            split_readers: HashMap::new(),
            buffered_row: false,
            primary_exhausted: false,
        }
    }

    pub fn shaping(&self) -> &ShapingState {
        &self.shaping
    }

    pub fn open_split_readers(&self) -> usize {
        self.split_readers.len()
    }

    /// Close every split reader.
    pub(crate) fn close(&mut self) {
        for (collection_id, mut split) in self.split_readers.drain() {
            trace!(collection_id, "closing split query reader");
            split.reader.close();
        }
    }
}

impl std::fmt::Debug for ResultCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCoordinator")
            .field("shaping", &self.shaping)
            .field("split_readers", &self.split_readers.len())
            .field("buffered_row", &self.buffered_row)
            .field("primary_exhausted", &self.primary_exhausted)
            .finish()
    }
}
