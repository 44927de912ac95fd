use std::collections::BTreeMap;

use error_stack::report;
use tern_batch::Collection;
use tern_interfaces::PreparedBatch;

use crate::Error;

/// A prepared artifact together with the bytes it stands for.
///
/// `memory_usage` is captured from the source collection before `prepare`
/// consumes it, and is subtracted from the unflushed total once the artifact
/// has been flushed.
pub(crate) struct PreparedEntry {
    pub prepared: Box<dyn PreparedBatch>,
    pub memory_usage: u64,
}

/// Ordered state of a copy operation, guarded by the store lock.
///
/// Both maps are keyed by batch index; in-order iteration and cheap
/// smallest-key lookup are load-bearing for the repartitioner and the
/// flusher.
#[derive(Default)]
pub(crate) struct BatchStore {
    /// Collections awaiting repartition, keyed by their input batch index.
    pub raw: BTreeMap<u64, Collection>,
    /// Ready-to-flush artifacts, keyed by their output batch index.
    pub prepared: BTreeMap<u64, PreparedEntry>,
    /// The next output batch index to assign.
    pub scheduled_batch_index: u64,
}

impl BatchStore {
    pub fn insert_raw(
        &mut self,
        batch_index: u64,
        collection: Collection,
    ) -> error_stack::Result<(), Error> {
        if self.raw.insert(batch_index, collection).is_some() {
            return Err(report!(Error::DuplicateBatchIndex(batch_index)));
        }
        Ok(())
    }

    pub fn insert_prepared(
        &mut self,
        batch_index: u64,
        entry: PreparedEntry,
    ) -> error_stack::Result<(), Error> {
        if self.prepared.insert(batch_index, entry).is_some() {
            return Err(report!(Error::DuplicateBatchIndex(batch_index)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::prepared_rows;

    #[test]
    fn test_duplicate_raw_index_is_fatal() {
        let mut store = BatchStore::default();
        store
            .insert_raw(3, Collection::new(tern_testing::number_schema()))
            .unwrap();
        let result = store.insert_raw(3, Collection::new(tern_testing::number_schema()));
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_prepared_index_is_fatal() {
        let mut store = BatchStore::default();
        store.insert_prepared(0, prepared_rows(10)).unwrap();
        let result = store.insert_prepared(0, prepared_rows(10));
        assert!(result.is_err());
    }

    #[test]
    fn test_raw_iterates_in_index_order() {
        let mut store = BatchStore::default();
        for index in [5, 1, 3] {
            store
                .insert_raw(index, Collection::new(tern_testing::number_schema()))
                .unwrap();
        }
        let keys: Vec<_> = store.raw.keys().copied().collect();
        assert_eq!(keys, vec![1, 3, 5]);
    }
}
