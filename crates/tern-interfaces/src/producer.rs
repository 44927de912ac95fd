use std::sync::Arc;

/// Result of offering a chunk to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkResult {
    /// The chunk was accepted; the producer should keep sinking.
    NeedMore,
    /// The producer is parked on memory pressure. The host scheduler should
    /// re-submit it once its [`InterruptHandle`] is woken.
    Blocked,
}

/// Where a producer currently stands in the global batch order.
///
/// Maintained by the upstream operator: `batch_index` tags the chunks the
/// producer is currently sinking, and `min_batch_index` is the smallest
/// batch index any live producer is still working on. Both are monotone
/// non-decreasing per producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerPosition {
    pub batch_index: u64,
    pub min_batch_index: u64,
}

impl ProducerPosition {
    pub fn new(batch_index: u64, min_batch_index: u64) -> Self {
        Self {
            batch_index,
            min_batch_index,
        }
    }
}

/// A wake-up callback installed by the host scheduler.
///
/// When a producer parks, the engine deposits a clone of its handle; waking
/// it tells the scheduler to re-submit the producer. Waking is cheap,
/// non-blocking, and may happen spuriously.
#[derive(Clone)]
pub struct InterruptHandle {
    callback: Arc<dyn Fn() + Send + Sync>,
}

impl InterruptHandle {
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    pub fn wake(&self) {
        (self.callback)()
    }
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandle").finish_non_exhaustive()
    }
}
