use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tern_interfaces::FormatSink;

use crate::memory::MemoryController;
use crate::store::BatchStore;
use crate::task::TaskQueue;

/// Global state of one copy operation, shared by all producers and workers.
pub struct CopyGlobalState {
    /// The open format sink. `prepare` runs on it concurrently; `flush` only
    /// from inside the flushing critical section.
    pub(crate) sink: Box<dyn FormatSink>,
    /// The path the sink is writing to. Differs from the target path when a
    /// temp-file handoff was requested.
    pub(crate) write_path: PathBuf,
    /// The desired row count per flushed artifact.
    pub(crate) batch_size: usize,
    /// Raw and prepared batches plus the scheduled index, behind the store
    /// lock.
    pub(crate) store: Mutex<BatchStore>,
    pub(crate) tasks: TaskQueue,
    pub(crate) memory: MemoryController,
    /// The total number of rows copied to the file.
    pub(crate) rows_copied: AtomicU64,
    /// The next batch index to be flushed.
    pub(crate) flushed_batch_index: AtomicU64,
    /// Whether or not any thread is flushing.
    pub(crate) any_flushing: AtomicBool,
    /// Whether or not any producer has finished.
    pub(crate) any_finished: AtomicBool,
    /// Total memory usage of unflushed rows: raw collections, prepared
    /// artifacts, and producer-local collections.
    pub(crate) unflushed_memory_usage: AtomicU64,
    pub(crate) cancelled: AtomicBool,
}

impl CopyGlobalState {
    pub fn rows_copied(&self) -> u64 {
        self.rows_copied.load(Ordering::Relaxed)
    }

    pub fn flushed_batch_index(&self) -> u64 {
        self.flushed_batch_index.load(Ordering::Acquire)
    }

    pub fn unflushed_memory_usage(&self) -> u64 {
        self.unflushed_memory_usage.load(Ordering::Acquire)
    }

    pub fn available_memory(&self) -> u64 {
        self.memory.available_memory()
    }

    pub fn min_batch_index(&self) -> u64 {
        self.memory.min_batch_index()
    }

    pub fn can_increase_memory(&self) -> bool {
        self.memory.can_increase_memory()
    }

    pub fn raw_batch_count(&self) -> usize {
        self.store.lock().raw.len()
    }

    pub fn prepared_batch_count(&self) -> usize {
        self.store.lock().prepared.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn blocked_producer_count(&self) -> usize {
        self.memory.blocked_producers()
    }

    /// Request cooperative cancellation.
    ///
    /// Observed at every task-queue poll and between flush iterations;
    /// in-flight format callbacks are not interrupted.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn out_of_memory(&self, batch_index: u64) -> bool {
        self.memory
            .out_of_memory(&self.unflushed_memory_usage, batch_index)
    }
}

impl std::fmt::Debug for CopyGlobalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyGlobalState")
            .field("write_path", &self.write_path)
            .field("batch_size", &self.batch_size)
            .field("rows_copied", &self.rows_copied)
            .field("flushed_batch_index", &self.flushed_batch_index)
            .field("unflushed_memory_usage", &self.unflushed_memory_usage)
            .finish_non_exhaustive()
    }
}
