use tern_batch::Collection;
use tern_interfaces::FormatLocalState;

/// What a producer is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CopyMode {
    /// Appending chunks to its local collection.
    Sinking,
    /// Over the memory budget: assisting with queued tasks instead of
    /// buffering more data.
    ProcessingTasks,
}

/// Per-producer state of one copy operation.
pub struct CopyLocalState {
    pub(crate) format_state: Box<dyn FormatLocalState>,
    /// The collection the producer is currently appending to.
    pub(crate) collection: Option<Collection>,
    /// The batch index the current collection belongs to.
    pub(crate) batch_index: Option<u64>,
    /// How many rows this producer has copied in total.
    pub(crate) rows_copied: u64,
    /// Memory usage of the current collection.
    pub(crate) local_memory_usage: u64,
    pub(crate) mode: CopyMode,
}

impl CopyLocalState {
    pub(crate) fn new(format_state: Box<dyn FormatLocalState>) -> Self {
        Self {
            format_state,
            collection: None,
            batch_index: None,
            rows_copied: 0,
            local_memory_usage: 0,
            mode: CopyMode::Sinking,
        }
    }

    pub fn rows_copied(&self) -> u64 {
        self.rows_copied
    }
}

impl std::fmt::Debug for CopyLocalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyLocalState")
            .field("batch_index", &self.batch_index)
            .field("rows_copied", &self.rows_copied)
            .field("local_memory_usage", &self.local_memory_usage)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
