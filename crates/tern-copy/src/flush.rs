use std::sync::atomic::{AtomicBool, Ordering};

use error_stack::{IntoReport, ResultExt};

use crate::{BatchCopy, CopyGlobalState, Error};

/// Clears the flushing flag on every exit path.
struct ActiveFlushGuard<'a>(&'a AtomicBool);

impl Drop for ActiveFlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BatchCopy {
    /// Flush ready prepared batches to the sink, strictly in batch-index
    /// order.
    ///
    /// At most one thread is inside the flushing critical section; everyone
    /// else returns immediately. The sink writes bytes in the order it sees
    /// `flush` calls, so this is where the otherwise parallel pipeline is
    /// serialized. The format callback runs outside the store lock.
    pub(crate) fn flush_batches(&self, g: &CopyGlobalState) -> error_stack::Result<(), Error> {
        if g.any_flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let _active = ActiveFlushGuard(&g.any_flushing);
        loop {
            if g.is_cancelled() {
                break;
            }
            let (batch_index, entry) = {
                let mut store = g.store.lock();
                let flushed_batch_index = g.flushed_batch_index.load(Ordering::Acquire);
                let Some(first) = store.prepared.first_entry() else {
                    break;
                };
                let batch_index = *first.key();
                if batch_index > flushed_batch_index {
                    // This entry is not yet ready to be flushed.
                    break;
                }
                error_stack::ensure!(
                    batch_index == flushed_batch_index,
                    Error::FlushOutOfOrder {
                        expected: flushed_batch_index,
                        actual: batch_index,
                    }
                );
                (batch_index, first.remove())
            };
            tracing::trace!("Flushing batch {batch_index}");
            g.sink
                .flush(entry.prepared)
                .change_context(Error::Format("flushing a batch"))?;
            g.unflushed_memory_usage
                .fetch_sub(entry.memory_usage, Ordering::AcqRel);
            g.flushed_batch_index.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Flush everything that remains, close the format, and move the temp
    /// file into place.
    pub(crate) fn final_flush(&self, g: &CopyGlobalState) -> error_stack::Result<(), Error> {
        error_stack::ensure!(g.tasks.is_empty(), Error::TasksRemainingAtFinalFlush);
        self.flush_batches(g)?;
        let scheduled = g.store.lock().scheduled_batch_index;
        let flushed = g.flushed_batch_index();
        error_stack::ensure!(
            scheduled == flushed,
            Error::IncompleteFile {
                unflushed: scheduled.saturating_sub(flushed),
            }
        );
        g.sink
            .finish()
            .change_context(Error::Format("finishing the sink"))?;
        if self.options.use_tmp_file {
            std::fs::rename(&g.write_path, &self.options.target_path)
                .into_report()
                .change_context_lazy(|| Error::PersistTmpFile(self.options.target_path.clone()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{prepared_rows, test_copy};

    #[test]
    fn test_flush_drains_ready_batches_in_order() {
        let (copy, g, flushed) = test_copy(1000);
        g.unflushed_memory_usage.store(60, Ordering::Release);
        {
            let mut store = g.store.lock();
            store.insert_prepared(0, prepared_rows(10)).unwrap();
            store.insert_prepared(1, prepared_rows(20)).unwrap();
            // Batch 3 is not contiguous with the flushed index and must stay.
            store.insert_prepared(3, prepared_rows(30)).unwrap();
            store.scheduled_batch_index = 4;
        }

        copy.flush_batches(&g).unwrap();
        assert_eq!(*flushed.lock(), vec![10, 20]);
        assert_eq!(g.flushed_batch_index(), 2);
        assert_eq!(g.prepared_batch_count(), 1);
        // Only the flushed batches' bytes were released.
        assert_eq!(g.unflushed_memory_usage(), 30);
    }

    #[test]
    fn test_flush_is_mutually_exclusive() {
        let (copy, g, flushed) = test_copy(1000);
        g.unflushed_memory_usage.store(10, Ordering::Release);
        g.store.lock().insert_prepared(0, prepared_rows(10)).unwrap();

        // Another thread is inside the critical section: this call must be
        // a silent no-op rather than a second writer.
        g.any_flushing.store(true, Ordering::Release);
        copy.flush_batches(&g).unwrap();
        assert!(flushed.lock().is_empty());
        assert_eq!(g.prepared_batch_count(), 1);

        g.any_flushing.store(false, Ordering::Release);
        copy.flush_batches(&g).unwrap();
        assert_eq!(*flushed.lock(), vec![10]);
    }

    #[test]
    fn test_out_of_order_prepared_entry_is_fatal() {
        let (copy, g, _) = test_copy(1000);
        g.store.lock().insert_prepared(2, prepared_rows(10)).unwrap();
        g.flushed_batch_index.store(5, Ordering::Release);

        let result = copy.flush_batches(&g);
        assert!(result.is_err());
        // The critical section was released on the error path.
        assert!(!g.any_flushing.load(Ordering::Acquire));
    }

    #[test]
    fn test_final_flush_detects_incomplete_file() {
        let (copy, g, _) = test_copy(1000);
        g.store.lock().scheduled_batch_index = 2;

        let result = copy.final_flush(&g);
        assert!(result.is_err());
    }
}
