//! Shared helpers for the engine's unit tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arrow_schema::SchemaRef;
use parking_lot::Mutex;
use tern_batch::Collection;
use tern_interfaces::{
    CopyFormat, FormatError, FormatSink, InterruptHandle, MemoryBroker, MemoryReservation,
    PreparedBatch, SharedMemoryPool,
};
use tern_testing::number_schema;

use crate::store::PreparedEntry;
use crate::{BatchCopy, CopyGlobalState, CopyOptions};

/// A format that counts the rows flowing through `prepare` and `flush`.
#[derive(Debug)]
pub(crate) struct CountingFormat {
    batch_size: usize,
    flushed: Arc<Mutex<Vec<usize>>>,
}

impl CountingFormat {
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size,
            flushed: Arc::new(Mutex::new(vec![])),
        }
    }
}

impl CopyFormat for CountingFormat {
    fn desired_batch_size(&self) -> usize {
        self.batch_size
    }

    fn new_sink(
        &self,
        _path: &Path,
        _schema: SchemaRef,
    ) -> error_stack::Result<Box<dyn FormatSink>, FormatError> {
        Ok(Box::new(CountingSink {
            flushed: self.flushed.clone(),
        }))
    }
}

#[derive(Debug)]
struct CountingSink {
    flushed: Arc<Mutex<Vec<usize>>>,
}

impl FormatSink for CountingSink {
    fn prepare(
        &self,
        collection: Collection,
    ) -> error_stack::Result<Box<dyn PreparedBatch>, FormatError> {
        Ok(Box::new(CountedBatch {
            rows: collection.num_rows(),
        }))
    }

    fn flush(&self, prepared: Box<dyn PreparedBatch>) -> error_stack::Result<(), FormatError> {
        let batch = prepared
            .as_any()
            .downcast::<CountedBatch>()
            .map_err(|_| FormatError::Internal("unexpected prepared batch type"))?;
        self.flushed.lock().push(batch.rows);
        Ok(())
    }

    fn finish(&self) -> error_stack::Result<(), FormatError> {
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct CountedBatch {
    pub rows: usize,
}

impl PreparedBatch for CountedBatch {
    fn as_any(self: Box<Self>) -> Box<dyn std::any::Any + Send> {
        self
    }
}

/// An operator over the counting format plus the log of flushed row counts.
pub(crate) fn test_copy(
    batch_size: usize,
) -> (BatchCopy, CopyGlobalState, Arc<Mutex<Vec<usize>>>) {
    let format = CountingFormat::with_batch_size(batch_size);
    let flushed = format.flushed.clone();
    let copy = BatchCopy::try_new(
        Arc::new(format),
        number_schema(),
        CopyOptions::new("/unused/copy.out"),
    )
    .unwrap();
    let pool = SharedMemoryPool::new(1 << 30);
    let g = copy.global_state(&pool).unwrap();
    (copy, g, flushed)
}

pub(crate) fn prepared_rows(rows: usize) -> PreparedEntry {
    PreparedEntry {
        prepared: Box::new(CountedBatch { rows }),
        memory_usage: rows as u64,
    }
}

pub(crate) fn noop_interrupt() -> InterruptHandle {
    InterruptHandle::new(|| {})
}

/// A broker that never grants more than its initial slice.
#[derive(Debug)]
pub(crate) struct DeniedBroker {
    grant: u64,
    calls: Arc<AtomicUsize>,
}

impl DeniedBroker {
    pub fn new(grant: u64) -> Self {
        Self {
            grant,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// How many times `set_remaining_size` has been invoked.
    pub fn growth_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MemoryBroker for DeniedBroker {
    fn register(&self) -> Box<dyn MemoryReservation> {
        Box::new(DeniedReservation {
            grant: self.grant,
            granted: 0,
            calls: self.calls.clone(),
        })
    }

    fn query_max_memory(&self) -> u64 {
        u64::MAX
    }
}

#[derive(Debug)]
struct DeniedReservation {
    grant: u64,
    granted: u64,
    calls: Arc<AtomicUsize>,
}

impl MemoryReservation for DeniedReservation {
    fn set_remaining_size(&mut self, bytes: u64) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.granted = bytes.min(self.grant);
    }

    fn reservation(&self) -> u64 {
        self.granted
    }
}
