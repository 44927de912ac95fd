use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arrow_array::{Int64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use error_stack::{report, IntoReport, ResultExt};
use itertools::Itertools;
use parking_lot::Mutex;
use tern_batch::{Chunk, Collection};
use tern_interfaces::{CopyFormat, InterruptHandle, MemoryBroker, ProducerPosition, SinkResult};

use crate::local::CopyMode;
use crate::memory::{MemoryController, MINIMUM_MEMORY_PER_COLUMN_PER_THREAD};
use crate::store::BatchStore;
use crate::task::TaskQueue;
use crate::{CopyGlobalState, CopyLocalState, Error};

/// Default thread count for the finalize drain if we aren't able to
/// determine the number of cores.
const DEFAULT_THREAD_COUNT: usize = 8;

/// Options for a single copy-to-file operation.
#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// Where the output file ends up.
    pub target_path: PathBuf,
    /// Write to `<target>.tmp` and atomically rename to the target once the
    /// format has finished.
    pub use_tmp_file: bool,
}

impl CopyOptions {
    pub fn new(target_path: impl Into<PathBuf>) -> Self {
        Self {
            target_path: target_path.into(),
            use_tmp_file: false,
        }
    }

    pub fn with_tmp_file(mut self, use_tmp_file: bool) -> Self {
        self.use_tmp_file = use_tmp_file;
        self
    }
}

/// The copy-to-file operator.
///
/// Stateless itself: all per-operation state lives in [`CopyGlobalState`]
/// and per-producer state in [`CopyLocalState`], so one operator value can
/// be driven by any number of producer threads.
#[derive(Debug)]
pub struct BatchCopy {
    pub(crate) format: Arc<dyn CopyFormat>,
    pub(crate) schema: SchemaRef,
    pub(crate) options: CopyOptions,
}

impl BatchCopy {
    pub fn try_new(
        format: Arc<dyn CopyFormat>,
        schema: SchemaRef,
        options: CopyOptions,
    ) -> error_stack::Result<Self, Error> {
        error_stack::ensure!(format.desired_batch_size() > 0, Error::InvalidBatchSize);
        Ok(Self {
            format,
            schema,
            options,
        })
    }

    /// Open the sink and initialize the shared state of one copy operation.
    pub fn global_state(
        &self,
        broker: &dyn MemoryBroker,
    ) -> error_stack::Result<CopyGlobalState, Error> {
        let write_path = if self.options.use_tmp_file {
            tmp_path(&self.options.target_path)
        } else {
            self.options.target_path.clone()
        };
        let sink = self
            .format
            .new_sink(&write_path, self.schema.clone())
            .change_context(Error::Format("opening the sink"))?;
        let minimum_memory_per_thread =
            MINIMUM_MEMORY_PER_COLUMN_PER_THREAD * (self.schema.fields().len() as u64).max(1);
        Ok(CopyGlobalState {
            sink,
            write_path,
            batch_size: self.format.desired_batch_size(),
            store: Mutex::new(BatchStore::default()),
            tasks: TaskQueue::default(),
            memory: MemoryController::new(broker, minimum_memory_per_thread),
            rows_copied: AtomicU64::new(0),
            flushed_batch_index: AtomicU64::new(0),
            any_flushing: AtomicBool::new(false),
            any_finished: AtomicBool::new(false),
            unflushed_memory_usage: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        })
    }

    /// Initialize the state of one producer.
    pub fn local_state(&self) -> CopyLocalState {
        CopyLocalState::new(self.format.new_local_state())
    }

    /// Offer one chunk from a producer.
    ///
    /// Returns [`SinkResult::Blocked`] when the producer exceeded the memory
    /// budget and is not the minimum-batch-index holder; the engine then
    /// holds a clone of `interrupt` and wakes it once the minimum advances.
    pub fn sink(
        &self,
        g: &CopyGlobalState,
        l: &mut CopyLocalState,
        chunk: Chunk,
        position: ProducerPosition,
        interrupt: &InterruptHandle,
    ) -> error_stack::Result<SinkResult, Error> {
        let batch_index = position.batch_index;
        if l.mode == CopyMode::ProcessingTasks {
            self.execute_task(g)?;
            self.flush_batches(g)?;
            if batch_index > g.memory.min_batch_index() && g.out_of_memory(batch_index) {
                // No memory freed up and nothing more we can help with;
                // park until the minimum batch index advances.
                if g.memory.try_block(batch_index, interrupt.clone()) {
                    return Ok(SinkResult::Blocked);
                }
            }
            l.mode = CopyMode::Sinking;
        }
        if batch_index > g.memory.min_batch_index() {
            g.memory.update_min_batch_index(position.min_batch_index);

            // We are not processing the current minimum batch index; check
            // whether unflushed data exceeded the budget.
            if g.out_of_memory(batch_index) {
                // Stop sinking chunks and instead assist in processing
                // tasks for the minimum batch index.
                l.mode = CopyMode::ProcessingTasks;
                return self.sink(g, l, chunk, position, interrupt);
            }
        }
        if l.collection.is_none() {
            l.batch_index = Some(batch_index);
            l.local_memory_usage = 0;
        }
        let collection = l
            .collection
            .get_or_insert_with(|| Collection::new(self.schema.clone()));
        l.rows_copied += chunk.num_rows() as u64;
        collection.append(chunk).change_context(Error::Collection)?;
        let new_memory_usage = collection.size_in_bytes() as u64;
        if new_memory_usage > l.local_memory_usage {
            g.unflushed_memory_usage
                .fetch_add(new_memory_usage - l.local_memory_usage, Ordering::AcqRel);
        } else if new_memory_usage < l.local_memory_usage {
            return Err(report!(Error::MemoryUsageDecreased));
        }
        l.local_memory_usage = new_memory_usage;
        Ok(SinkResult::NeedMore)
    }

    /// Announce that the producer moves on to a new batch index.
    ///
    /// Publishes the finished collection to the raw store and gives the
    /// repartitioner a chance to cut output batches from everything below
    /// the minimum live index.
    pub fn next_batch(
        &self,
        g: &CopyGlobalState,
        l: &mut CopyLocalState,
        position: ProducerPosition,
    ) -> error_stack::Result<(), Error> {
        match (l.collection.take(), l.batch_index) {
            (Some(collection), Some(batch_index)) if !collection.is_empty() => {
                {
                    let mut store = g.store.lock();
                    store.insert_raw(batch_index, collection)?;
                }
                self.repartition_batches(g, position.min_batch_index, false)?;
                // Unblock parked producers so they can pick up the prepare
                // tasks; if none were parked, execute one here and flush.
                if !g.memory.unblock_producers() {
                    self.execute_task(g)?;
                    self.flush_batches(g)?;
                }
            }
            _ => {}
        }
        g.memory.update_min_batch_index(position.min_batch_index);
        l.batch_index = Some(position.batch_index);
        l.collection = Some(Collection::new(self.schema.clone()));
        l.local_memory_usage = 0;
        Ok(())
    }

    /// Fold a finished producer into the global state.
    pub fn combine(
        &self,
        g: &CopyGlobalState,
        l: &mut CopyLocalState,
        position: ProducerPosition,
    ) -> error_stack::Result<(), Error> {
        // Publish any residual collection; the host does not announce
        // another batch after the producer's last one.
        if let (Some(collection), Some(batch_index)) = (l.collection.take(), l.batch_index.take()) {
            if !collection.is_empty() {
                let mut store = g.store.lock();
                store.insert_raw(batch_index, collection)?;
            }
        }
        l.local_memory_usage = 0;
        g.rows_copied.fetch_add(l.rows_copied, Ordering::Relaxed);
        // Signal that a producer finished and we will move on to finalize.
        g.any_finished.store(true, Ordering::Release);
        g.memory.update_min_batch_index(position.min_batch_index);
        self.execute_tasks(g)?;
        Ok(())
    }

    /// Repartition the stragglers, drain remaining tasks, and finish the
    /// file.
    ///
    /// Must be called exactly once, after every producer has combined.
    pub fn finalize(&self, g: &CopyGlobalState) -> error_stack::Result<(), Error> {
        // Repartition any remaining batches; trailing under-sized batches
        // are cut as well.
        self.repartition_batches(g, u64::MAX, true)?;
        if g.tasks.len() <= 1 {
            // Just execute the remaining task (if any) and finish flushing.
            self.execute_tasks(g)?;
            return self.final_flush(g);
        }
        // Multiple tasks remain; drain them with a team of workers.
        let threads = self.finalize_threads(g);
        tracing::debug!(
            "Draining {} remaining prepare tasks with {threads} workers",
            g.tasks.len()
        );
        std::thread::scope(|scope| -> error_stack::Result<(), Error> {
            let workers: Vec<_> = (0..threads)
                .map(|index| {
                    std::thread::Builder::new()
                        .name(format!("copy-drain-{index}"))
                        .spawn_scoped(scope, move || -> error_stack::Result<(), Error> {
                            while self.execute_task(g)? {
                                self.flush_batches(g)?;
                            }
                            Ok(())
                        })
                        .into_report()
                        .change_context(Error::SpawnWorker)
                })
                .try_collect()?;
            for worker in workers {
                worker.join().map_err(|_| report!(Error::WorkerPanicked))??;
            }
            Ok(())
        })?;
        self.final_flush(g)
    }

    /// Emit the operator's single output row: the total row count.
    pub fn get_data(&self, g: &CopyGlobalState) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "rows_copied",
            DataType::Int64,
            false,
        )]));
        let rows = Int64Array::from(vec![g.rows_copied() as i64]);
        RecordBatch::try_new(schema, vec![Arc::new(rows)]).expect("rows_copied batch")
    }

    /// How many producer threads are worth launching, given what the memory
    /// broker granted us.
    pub fn max_threads(&self, g: &CopyGlobalState, source_max_threads: usize) -> usize {
        g.memory.max_threads(source_max_threads)
    }

    fn finalize_threads(&self, g: &CopyGlobalState) -> usize {
        let threads = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(DEFAULT_THREAD_COUNT);
        threads
            .min(g.memory.thread_cap())
            .min(g.tasks.len())
            .max(1)
    }
}

fn tmp_path(target: &Path) -> PathBuf {
    let mut file_name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    file_name.push(".tmp");
    target.with_file_name(file_name)
}

#[cfg(test)]
mod tests {
    use tern_testing::{number_chunk, number_schema};

    use super::*;
    use crate::testing::{noop_interrupt, test_copy, CountingFormat};

    #[test]
    fn test_sink_lazily_creates_the_collection() {
        let (copy, g, _) = test_copy(1000);
        let mut l = copy.local_state();
        assert!(l.collection.is_none());

        let result = copy
            .sink(
                &g,
                &mut l,
                number_chunk(0, 100),
                ProducerPosition::new(3, 3),
                &noop_interrupt(),
            )
            .unwrap();
        assert_eq!(result, SinkResult::NeedMore);
        assert_eq!(l.batch_index, Some(3));
        assert_eq!(l.rows_copied(), 100);
        assert!(l.local_memory_usage > 0);
        assert_eq!(g.unflushed_memory_usage(), l.local_memory_usage);
    }

    #[test]
    fn test_duplicate_batch_index_is_fatal() {
        let (copy, g, _) = test_copy(1000);
        let mut a = copy.local_state();
        let mut b = copy.local_state();
        let interrupt = noop_interrupt();

        copy.sink(
            &g,
            &mut a,
            number_chunk(0, 100),
            ProducerPosition::new(0, 0),
            &interrupt,
        )
        .unwrap();
        copy.next_batch(&g, &mut a, ProducerPosition::new(1, 0))
            .unwrap();

        copy.sink(
            &g,
            &mut b,
            number_chunk(0, 100),
            ProducerPosition::new(0, 0),
            &interrupt,
        )
        .unwrap();
        let result = copy.next_batch(&g, &mut b, ProducerPosition::new(1, 0));
        assert!(result.is_err());
    }

    #[test]
    fn test_combine_folds_rows_and_publishes_residual() {
        let (copy, g, _) = test_copy(1000);
        let mut l = copy.local_state();
        copy.sink(
            &g,
            &mut l,
            number_chunk(0, 250),
            ProducerPosition::new(0, 0),
            &noop_interrupt(),
        )
        .unwrap();
        copy.combine(&g, &mut l, ProducerPosition::new(0, 0))
            .unwrap();

        assert_eq!(g.rows_copied(), 250);
        assert_eq!(g.raw_batch_count(), 1);
    }

    #[test]
    fn test_invalid_batch_size_is_rejected() {
        let format = Arc::new(CountingFormat::with_batch_size(0));
        let result = BatchCopy::try_new(format, number_schema(), CopyOptions::new("/unused/out"));
        assert!(result.is_err());
    }

    #[test]
    fn test_tmp_path_appends_suffix() {
        assert_eq!(
            tmp_path(Path::new("/data/out.csv")),
            PathBuf::from("/data/out.csv.tmp")
        );
    }
}
