use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use error_stack::ResultExt;
use parking_lot::Mutex;
use tern_batch::Collection;

use crate::store::PreparedEntry;
use crate::{BatchCopy, CopyGlobalState, Error};

/// The unit of work executed by threads driving a batch copy.
///
/// Tasks carry only their payload; global state is passed by reference at
/// execution time, so tasks never hold back-pointers into the engine.
#[derive(Debug)]
pub(crate) enum CopyTask {
    /// Hand a repartitioned collection to the format's `prepare` and store
    /// the artifact under `batch_index`.
    Prepare {
        batch_index: u64,
        collection: Collection,
    },
    /// Drain ready prepared batches to the sink.
    Flush,
}

/// FIFO queue of copy tasks, shared by producers and finalize workers.
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    queue: Mutex<VecDeque<CopyTask>>,
}

impl TaskQueue {
    pub fn push(&self, task: CopyTask) {
        self.queue.lock().push_back(task);
    }

    pub fn pop(&self) -> Option<CopyTask> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl BatchCopy {
    /// Execute one queued task. Returns false if the queue was empty.
    pub(crate) fn execute_task(&self, g: &CopyGlobalState) -> error_stack::Result<bool, Error> {
        error_stack::ensure!(!g.is_cancelled(), Error::Cancelled);
        let Some(task) = g.tasks.pop() else {
            return Ok(false);
        };
        match task {
            CopyTask::Prepare {
                batch_index,
                collection,
            } => self.prepare_batch(g, batch_index, collection)?,
            CopyTask::Flush => self.flush_batches(g)?,
        }
        Ok(true)
    }

    /// Execute queued tasks until the queue runs dry.
    pub(crate) fn execute_tasks(&self, g: &CopyGlobalState) -> error_stack::Result<(), Error> {
        while self.execute_task(g)? {}
        Ok(())
    }

    /// Run the format's `prepare` on a repartitioned collection and store
    /// the artifact.
    ///
    /// If the artifact is the next one to write, a `Flush` task is enqueued
    /// so some thread drains it.
    fn prepare_batch(
        &self,
        g: &CopyGlobalState,
        batch_index: u64,
        collection: Collection,
    ) -> error_stack::Result<(), Error> {
        let _span = tracing::trace_span!("Preparing batch", batch_index).entered();
        let memory_usage = collection.size_in_bytes() as u64;
        let prepared = g
            .sink
            .prepare(collection)
            .change_context(Error::Format("preparing a batch"))?;
        {
            let mut store = g.store.lock();
            store.insert_prepared(
                batch_index,
                PreparedEntry {
                    prepared,
                    memory_usage,
                },
            )?;
        }
        if batch_index == g.flushed_batch_index.load(Ordering::Acquire) {
            g.tasks.push(CopyTask::Flush);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_pop_in_fifo_order() {
        let queue = TaskQueue::default();
        queue.push(CopyTask::Flush);
        queue.push(CopyTask::Prepare {
            batch_index: 7,
            collection: Collection::new(tern_testing::number_schema()),
        });
        assert_eq!(queue.len(), 2);

        assert!(matches!(queue.pop(), Some(CopyTask::Flush)));
        assert!(matches!(
            queue.pop(),
            Some(CopyTask::Prepare { batch_index: 7, .. })
        ));
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_prepare_task_enqueues_flush_for_next_index() {
        let (copy, g, _) = crate::testing::test_copy(1000);
        let mut collection = Collection::new(tern_testing::number_schema());
        collection
            .append(tern_testing::number_chunk(0, 100))
            .unwrap();
        g.tasks.push(CopyTask::Prepare {
            batch_index: 0,
            collection,
        });

        assert!(copy.execute_task(&g).unwrap());
        // Batch 0 is next to flush, so a flush task was scheduled behind it.
        assert_eq!(g.task_count(), 1);
        assert!(matches!(g.tasks.pop(), Some(CopyTask::Flush)));
        assert_eq!(g.prepared_batch_count(), 1);
    }

    #[test]
    fn test_cancellation_is_observed_at_the_queue() {
        let (copy, g, _) = crate::testing::test_copy(1000);
        g.cancel();
        assert!(copy.execute_task(&g).is_err());
    }
}
