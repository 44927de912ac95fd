use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tern_interfaces::{InterruptHandle, MemoryBroker, MemoryReservation};

/// We need at least 4MB of cache space per column per thread we launch.
pub(crate) const MINIMUM_MEMORY_PER_COLUMN_PER_THREAD: u64 = 4 * 1024 * 1024;

/// Tracks the memory reservation, the minimum live batch index, and the set
/// of parked producers.
///
/// Lock order: the blocked lock here is never held together with the batch
/// store lock.
pub(crate) struct MemoryController {
    /// The available memory for unflushed rows. Reads outside the blocked
    /// lock are advisory; all writes happen under it.
    available_memory: AtomicU64,
    /// The minimum live batch index over all producers. Monotone
    /// non-decreasing; advanced only under the blocked lock.
    min_batch_index: AtomicU64,
    /// Upper bound on what a single growth request may ask for.
    request_cap: u64,
    /// Minimum memory per launched thread.
    minimum_memory_per_thread: u64,
    blocked: Mutex<BlockedState>,
}

struct BlockedState {
    reservation: Box<dyn MemoryReservation>,
    /// False once a growth request was declined; no further requests are
    /// issued after that.
    can_increase_memory: bool,
    producers: SmallVec<[InterruptHandle; 4]>,
}

impl MemoryController {
    /// Register a reservation with the broker and seed it with enough memory
    /// for a single thread.
    pub fn new(broker: &dyn MemoryBroker, minimum_memory_per_thread: u64) -> Self {
        let controller = Self {
            available_memory: AtomicU64::new(0),
            min_batch_index: AtomicU64::new(0),
            // Request at most 1/4th of all available memory.
            request_cap: broker.query_max_memory() / 4,
            minimum_memory_per_thread,
            blocked: Mutex::new(BlockedState {
                reservation: broker.register(),
                can_increase_memory: true,
                producers: SmallVec::new(),
            }),
        };
        let mut blocked = controller.blocked.lock();
        controller.set_memory_size(&mut blocked, minimum_memory_per_thread);
        drop(blocked);
        controller
    }

    pub fn min_batch_index(&self) -> u64 {
        self.min_batch_index.load(Ordering::Acquire)
    }

    pub fn available_memory(&self) -> u64 {
        self.available_memory.load(Ordering::Acquire)
    }

    pub fn can_increase_memory(&self) -> bool {
        self.blocked.lock().can_increase_memory
    }

    pub fn blocked_producers(&self) -> usize {
        self.blocked.lock().producers.len()
    }

    fn set_memory_size(&self, blocked: &mut BlockedState, size: u64) {
        let size = size.min(self.request_cap);
        let available = self.available_memory.load(Ordering::Acquire);
        if size <= available {
            return;
        }
        blocked.reservation.set_remaining_size(size);
        let granted = blocked.reservation.reservation();
        if available >= granted {
            // We tried to ask for more memory but were declined; stop asking.
            tracing::debug!("Memory growth to {size} declined (still at {granted})");
            blocked.can_increase_memory = false;
        }
        self.available_memory.store(granted, Ordering::Release);
    }

    fn increase_memory(&self, blocked: &mut BlockedState) {
        if !blocked.can_increase_memory {
            return;
        }
        self.set_memory_size(blocked, self.available_memory().saturating_mul(2));
    }

    /// Whether the operation has exceeded its memory budget.
    ///
    /// Producers holding the minimum live batch index are never declared out
    /// of memory: they must make progress to unblock everyone else. Everyone
    /// else first gets one attempt at growing the reservation.
    pub fn out_of_memory(&self, unflushed_memory_usage: &AtomicU64, batch_index: u64) -> bool {
        if unflushed_memory_usage.load(Ordering::Acquire) >= self.available_memory() {
            let mut blocked = self.blocked.lock();
            if batch_index > self.min_batch_index() {
                // Exceeded available memory and we are not the minimum batch
                // index - try to increase it.
                self.increase_memory(&mut blocked);
                if unflushed_memory_usage.load(Ordering::Acquire) >= self.available_memory() {
                    return true;
                }
            }
        }
        false
    }

    /// Park a producer, re-checking that it is still past the minimum batch
    /// index under the blocked lock.
    ///
    /// Returns false if the minimum caught up in the meantime; the producer
    /// must then continue sinking instead of parking.
    pub fn try_block(&self, batch_index: u64, handle: InterruptHandle) -> bool {
        let mut blocked = self.blocked.lock();
        if batch_index > self.min_batch_index() {
            blocked.producers.push(handle);
            true
        } else {
            false
        }
    }

    /// Wake every parked producer. Returns true if any was woken.
    pub fn unblock_producers(&self) -> bool {
        let mut blocked = self.blocked.lock();
        Self::unblock_locked(&mut blocked)
    }

    fn unblock_locked(blocked: &mut BlockedState) -> bool {
        if blocked.producers.is_empty() {
            return false;
        }
        for producer in blocked.producers.drain(..) {
            producer.wake();
        }
        true
    }

    /// Monotone max of the minimum live batch index. A strict advance wakes
    /// every parked producer so they can re-evaluate memory pressure.
    pub fn update_min_batch_index(&self, current_min_batch_index: u64) {
        if self.min_batch_index() >= current_min_batch_index {
            return;
        }
        let mut blocked = self.blocked.lock();
        if current_min_batch_index > self.min_batch_index() {
            tracing::trace!("Minimum batch index advanced to {current_min_batch_index}");
            self.min_batch_index
                .store(current_min_batch_index, Ordering::Release);
            Self::unblock_locked(&mut blocked);
        }
    }

    /// Cap the threads working on this operation by the amount of memory we
    /// managed to reserve, first requesting enough for every source thread.
    pub fn max_threads(&self, source_max_threads: usize) -> usize {
        let mut blocked = self.blocked.lock();
        self.set_memory_size(
            &mut blocked,
            source_max_threads as u64 * self.minimum_memory_per_thread,
        );
        drop(blocked);
        source_max_threads.min(self.thread_cap())
    }

    /// How many threads the current reservation pays for, without asking the
    /// broker for more.
    pub fn thread_cap(&self) -> usize {
        (self.available_memory() / self.minimum_memory_per_thread) as usize + 1
    }
}

impl std::fmt::Debug for MemoryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryController")
            .field("available_memory", &self.available_memory)
            .field("min_batch_index", &self.min_batch_index)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use tern_interfaces::SharedMemoryPool;

    use super::*;
    use crate::testing::DeniedBroker;

    #[test]
    fn test_initial_reservation_is_one_thread() {
        let pool = SharedMemoryPool::new(1 << 30);
        let controller = MemoryController::new(&pool, 4096);
        assert_eq!(controller.available_memory(), 4096);
        assert!(controller.can_increase_memory());
    }

    #[test]
    fn test_growth_requests_are_capped_at_a_quarter() {
        let pool = SharedMemoryPool::new(1024);
        let controller = MemoryController::new(&pool, 64);
        let usage = AtomicU64::new(u64::MAX);

        // Repeated doubling saturates at query_max_memory / 4.
        for _ in 0..10 {
            assert!(controller.out_of_memory(&usage, 1));
        }
        assert_eq!(controller.available_memory(), 256);
        // Saturating at the cap is not a denial; requests at or below the
        // current reservation are simply skipped.
        assert!(controller.can_increase_memory());
    }

    #[test]
    fn test_denied_growth_stops_further_requests() {
        let broker = DeniedBroker::new(1000);
        let controller = MemoryController::new(&broker, 1000);
        let usage = AtomicU64::new(5000);

        assert!(controller.out_of_memory(&usage, 1));
        assert!(!controller.can_increase_memory());
        let calls = broker.growth_calls();

        assert!(controller.out_of_memory(&usage, 1));
        assert_eq!(broker.growth_calls(), calls);
    }

    #[test]
    fn test_min_batch_holder_is_never_out_of_memory() {
        let broker = DeniedBroker::new(100);
        let controller = MemoryController::new(&broker, 100);
        let usage = AtomicU64::new(u64::MAX);

        assert!(!controller.out_of_memory(&usage, 0));
        controller.update_min_batch_index(5);
        assert!(!controller.out_of_memory(&usage, 5));
        assert!(controller.out_of_memory(&usage, 6));
    }

    #[test]
    fn test_min_batch_index_is_monotone() {
        let pool = SharedMemoryPool::new(1 << 30);
        let controller = MemoryController::new(&pool, 4096);
        controller.update_min_batch_index(4);
        controller.update_min_batch_index(2);
        assert_eq!(controller.min_batch_index(), 4);
    }

    #[test]
    fn test_advance_wakes_parked_producers() {
        let pool = SharedMemoryPool::new(1 << 30);
        let controller = MemoryController::new(&pool, 4096);
        let woken = Arc::new(AtomicUsize::new(0));
        let handle = {
            let woken = woken.clone();
            InterruptHandle::new(move || {
                woken.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(controller.try_block(3, handle.clone()));
        assert_eq!(controller.blocked_producers(), 1);

        controller.update_min_batch_index(1);
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        assert_eq!(controller.blocked_producers(), 0);

        // A producer at (or below) the minimum refuses to park.
        assert!(!controller.try_block(1, handle));
    }

    #[test]
    fn test_max_threads_is_memory_capped() {
        // Pool large enough for two threads' worth of reservation.
        let pool = SharedMemoryPool::new(80);
        let controller = MemoryController::new(&pool, 10);
        // query_max_memory / 4 = 20 caps the request at two threads.
        assert_eq!(controller.max_threads(8), 3);
        assert_eq!(controller.max_threads(1), 1);
    }
}
