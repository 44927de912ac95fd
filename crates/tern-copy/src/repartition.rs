use std::sync::atomic::Ordering;

use error_stack::ResultExt;
use tern_batch::{Collection, STANDARD_VECTOR_SIZE};

use crate::store::BatchStore;
use crate::task::{CopyTask, TaskQueue};
use crate::{BatchCopy, CopyGlobalState, Error};

/// Whether a collection is approximately batch-sized: off by less than one
/// vector.
fn correct_size_for_batch(collection_rows: usize, desired_rows: usize) -> bool {
    collection_rows.abs_diff(desired_rows) < STANDARD_VECTOR_SIZE
}

impl BatchCopy {
    /// Merge and split raw collections below `min_index` into collections of
    /// the desired batch size, scheduling a `Prepare` task for each.
    ///
    /// Holds the store lock throughout, so output batch indices are assigned
    /// in ascending source order -- the only anchor that makes the scheduled
    /// order meaningful downstream. With `last` set, trailing under-sized
    /// collections are cut as well instead of being deferred.
    pub(crate) fn repartition_batches(
        &self,
        g: &CopyGlobalState,
        min_index: u64,
        last: bool,
    ) -> error_stack::Result<(), Error> {
        let mut store = g.store.lock();
        if store.raw.is_empty() {
            return Ok(());
        }
        if !last {
            if g.any_finished.load(Ordering::Acquire) {
                // Only repartition mid-stream while every producer is still
                // busy; with a shrinking producer pool the merge work lands
                // on too few threads and performance gets erratic.
                return Ok(());
            }
            let candidate_rows: usize = store
                .raw
                .range(..min_index)
                .map(|(_, collection)| collection.num_rows())
                .sum();
            if candidate_rows < g.batch_size {
                // Not enough rows to cut a batch yet.
                return Ok(());
            }
        }
        // Take every raw collection below the minimum index, in order.
        let still_live = store.raw.split_off(&min_index);
        let drained = std::mem::replace(&mut store.raw, still_live);
        let Some(max_drained) = drained.keys().next_back().copied() else {
            return Ok(());
        };
        tracing::trace!(
            "Repartitioning {} collections below batch index {min_index}",
            drained.len()
        );

        let mut current: Option<Collection> = None;
        for (_, collection) in drained {
            let source = if current.is_none() {
                if correct_size_for_batch(collection.num_rows(), g.batch_size) {
                    // Approximately equal to the batch size (off by at most
                    // one vector): use it directly.
                    schedule_prepare(&mut store, &g.tasks, collection);
                    continue;
                } else if collection.num_rows() < g.batch_size {
                    // Smaller than the batch size: use it as a starting
                    // point.
                    current = Some(collection);
                    continue;
                } else {
                    // Too large for one batch: split it into a fresh
                    // accumulator.
                    current = Some(Collection::new(self.schema.clone()));
                    collection
                }
            } else {
                collection
            };
            for chunk in source.into_chunks() {
                let accumulator = current.get_or_insert_with(|| Collection::new(self.schema.clone()));
                accumulator.append(chunk).change_context(Error::Collection)?;
                if accumulator.num_rows() >= g.batch_size {
                    // The accumulator is full; move it to the output and
                    // open a fresh one.
                    if let Some(full) = current.take() {
                        schedule_prepare(&mut store, &g.tasks, full);
                    }
                    current = Some(Collection::new(self.schema.clone()));
                }
            }
        }
        if let Some(remainder) = current {
            if !remainder.is_empty() {
                if last || correct_size_for_batch(remainder.num_rows(), g.batch_size) {
                    schedule_prepare(&mut store, &g.tasks, remainder);
                } else {
                    // A deferred remnant: re-insert it so the next call
                    // merges it with newer data.
                    store.raw.insert(max_drained, remainder);
                }
            }
        }
        Ok(())
    }
}

fn schedule_prepare(store: &mut BatchStore, tasks: &TaskQueue, collection: Collection) {
    let batch_index = store.scheduled_batch_index;
    store.scheduled_batch_index += 1;
    tracing::trace!(
        "Scheduling prepare of output batch {batch_index} ({} rows)",
        collection.num_rows()
    );
    tasks.push(CopyTask::Prepare {
        batch_index,
        collection,
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tern_testing::number_chunks;

    use super::*;
    use crate::testing::test_copy;

    fn insert_raw_rows(g: &CopyGlobalState, batch_index: u64, start: i64, rows: usize) {
        let mut collection = Collection::new(tern_testing::number_schema());
        for chunk in number_chunks(start, rows, 500) {
            collection.append(chunk).unwrap();
        }
        g.store.lock().insert_raw(batch_index, collection).unwrap();
    }

    fn scheduled_sizes(g: &CopyGlobalState) -> Vec<usize> {
        let mut sizes = vec![];
        while let Some(task) = g.tasks.pop() {
            match task {
                CopyTask::Prepare { collection, .. } => sizes.push(collection.num_rows()),
                CopyTask::Flush => {}
            }
        }
        sizes
    }

    #[test]
    fn test_skips_when_below_batch_size() {
        let (copy, g, _) = test_copy(1000);
        insert_raw_rows(&g, 0, 0, 600);

        copy.repartition_batches(&g, 1, false).unwrap();
        assert!(g.tasks.is_empty());
        assert_eq!(g.raw_batch_count(), 1);
    }

    #[test]
    fn test_merges_small_collections() {
        let (copy, g, _) = test_copy(5000);
        insert_raw_rows(&g, 0, 0, 2500);
        insert_raw_rows(&g, 1, 2500, 3000);

        copy.repartition_batches(&g, 2, false).unwrap();
        // 2500 + 3000 merge into one full batch; the 500-row remnant is far
        // from the target and goes back to the raw store.
        assert_eq!(scheduled_sizes(&g), vec![5000]);
        assert_eq!(g.store.lock().scheduled_batch_index, 1);
        let store = g.store.lock();
        assert_eq!(store.raw.get(&1).map(Collection::num_rows), Some(500));
    }

    #[test]
    fn test_splits_oversized_collection() {
        let (copy, g, _) = test_copy(1000);
        insert_raw_rows(&g, 0, 0, 3500);

        copy.repartition_batches(&g, 1, false).unwrap();
        // 3×1000 plus a 500-row remainder, which is within one vector of
        // the target and is cut immediately.
        assert_eq!(scheduled_sizes(&g), vec![1000, 1000, 1000, 500]);
    }

    #[test]
    fn test_within_one_vector_is_used_directly() {
        let (copy, g, _) = test_copy(1000);
        insert_raw_rows(&g, 0, 0, 1001);

        copy.repartition_batches(&g, 1, false).unwrap();
        // Not split: the collection is approximately batch-sized.
        assert_eq!(scheduled_sizes(&g), vec![1001]);
    }

    #[test]
    fn test_undersized_remnant_is_deferred() {
        // A batch size well above the vector size makes remnants fall
        // outside the tolerance.
        let (copy, g, _) = test_copy(4096);
        insert_raw_rows(&g, 0, 0, 10_000);

        copy.repartition_batches(&g, 1, false).unwrap();
        // The split closes each output at the first chunk boundary past the
        // target; the 1000-row remnant goes back to the raw store under the
        // drained key, to be merged on the next call.
        assert_eq!(scheduled_sizes(&g), vec![4500, 4500]);
        let store = g.store.lock();
        assert_eq!(store.raw.len(), 1);
        assert_eq!(store.raw.get(&0).map(Collection::num_rows), Some(1000));
    }

    #[test]
    fn test_final_pass_cuts_the_remnant() {
        let (copy, g, _) = test_copy(4096);
        insert_raw_rows(&g, 0, 0, 404);

        copy.repartition_batches(&g, u64::MAX, true).unwrap();
        assert_eq!(scheduled_sizes(&g), vec![404]);
        assert_eq!(g.raw_batch_count(), 0);
    }

    #[test]
    fn test_any_finished_short_circuits_midstream() {
        let (copy, g, _) = test_copy(1000);
        insert_raw_rows(&g, 0, 0, 3500);
        g.any_finished.store(true, Ordering::Release);

        copy.repartition_batches(&g, 1, false).unwrap();
        assert!(g.tasks.is_empty());

        // The final pass still drains everything.
        copy.repartition_batches(&g, u64::MAX, true).unwrap();
        assert_eq!(scheduled_sizes(&g), vec![1000, 1000, 1000, 500]);
    }

    #[test]
    fn test_entries_at_or_past_min_index_stay_raw() {
        let (copy, g, _) = test_copy(1000);
        insert_raw_rows(&g, 0, 0, 1500);
        insert_raw_rows(&g, 5, 1500, 1500);

        copy.repartition_batches(&g, 1, false).unwrap();
        assert_eq!(scheduled_sizes(&g), vec![1500]);
        assert_eq!(g.raw_batch_count(), 1);
    }
}
