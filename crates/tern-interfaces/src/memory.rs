use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;

/// A broker granting memory reservations against a process-wide budget.
///
/// Shared across concurrent copy operations (and, in a full engine, across
/// queries). Growth requests may be declined; the engine must keep making
/// progress on its existing reservation when they are.
pub trait MemoryBroker: Send + Sync + Debug {
    /// Register a new reservation for one operation.
    fn register(&self) -> Box<dyn MemoryReservation>;

    /// Upper bound on the memory a single query may use.
    fn query_max_memory(&self) -> u64;
}

/// One operation's slice of the broker's budget.
pub trait MemoryReservation: Send + Debug {
    /// Request that the remaining reservation be set to `bytes`.
    ///
    /// Idempotent. The broker may grant less than requested; callers must
    /// re-read [`MemoryReservation::reservation`] to observe what was
    /// actually granted.
    fn set_remaining_size(&mut self, bytes: u64);

    /// The currently granted reservation, in bytes.
    fn reservation(&self) -> u64;
}

/// A simple shared memory pool: first come, first served up to a fixed
/// capacity, with reservations returned on drop.
#[derive(Debug, Clone)]
pub struct SharedMemoryPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    capacity: u64,
    reserved: Mutex<u64>,
}

impl SharedMemoryPool {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                reserved: Mutex::new(0),
            }),
        }
    }

    /// Total bytes currently reserved across all registrations.
    pub fn reserved_bytes(&self) -> u64 {
        *self.inner.reserved.lock()
    }
}

impl MemoryBroker for SharedMemoryPool {
    fn register(&self) -> Box<dyn MemoryReservation> {
        Box::new(PoolReservation {
            inner: self.inner.clone(),
            granted: 0,
        })
    }

    fn query_max_memory(&self) -> u64 {
        self.inner.capacity
    }
}

#[derive(Debug)]
struct PoolReservation {
    inner: Arc<PoolInner>,
    granted: u64,
}

impl MemoryReservation for PoolReservation {
    fn set_remaining_size(&mut self, bytes: u64) {
        let mut reserved = self.inner.reserved.lock();
        let others = *reserved - self.granted;
        let granted = bytes.min(self.inner.capacity.saturating_sub(others));
        *reserved = others + granted;
        self.granted = granted;
    }

    fn reservation(&self) -> u64 {
        self.granted
    }
}

impl Drop for PoolReservation {
    fn drop(&mut self) {
        if self.granted > 0 {
            *self.inner.reserved.lock() -= self.granted;
        }
    }
}
