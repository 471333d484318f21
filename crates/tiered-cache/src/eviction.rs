use std::collections::VecDeque;
use std::sync::{Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::types::ResourceUsage;

/// A cell as seen by the eviction list.
///
/// Implemented by the per-slot cache cells; the list only ever holds weak
/// references, so a slot dropping its cells simply invalidates their entries.
pub(crate) trait Evictable: Send + Sync {
    /// Unloads the cell if the entry is still current (same `epoch`) and the
    /// cell is loaded and unpinned. Returns the freed resource on success.
    fn try_evict(&self, epoch: u64) -> Option<ResourceUsage>;

    /// The cell's key, for logging.
    fn key(&self) -> &str;
}

struct Entry {
    cell: Weak<dyn Evictable>,
    /// The cell's eviction epoch at the time the entry was created. A cell
    /// bumps its epoch whenever it is re-pinned or unloaded, which turns any
    /// outstanding entry for it into a stale no-op.
    epoch: u64,
}

struct ListState {
    committed: ResourceUsage,
    /// Loaded-and-unpinned cells, least recently unpinned first.
    lru: VecDeque<Entry>,
}

/// Process-wide admission control for cell loads.
///
/// Tracks committed memory/disk bytes against a fixed per-dimension capacity.
/// When a reservation does not fit, loaded-but-unpinned cells are evicted in
/// least-recently-unpinned order; if that is still not enough, the reserving
/// caller waits for concurrent releases until its timeout expires.
///
/// A slot constructed without an eviction list performs no admission control
/// at all: loads are unlimited and cells are only evicted manually.
pub struct EvictionList {
    capacity: ResourceUsage,
    state: Mutex<ListState>,
    released: Notify,
}

impl EvictionList {
    pub fn new(capacity: ResourceUsage) -> Self {
        Self {
            capacity,
            state: Mutex::new(ListState {
                committed: ResourceUsage::ZERO,
                lru: VecDeque::new(),
            }),
            released: Notify::new(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity())
    }

    pub fn capacity(&self) -> ResourceUsage {
        self.capacity
    }

    /// Attempts to commit `needed` against the remaining capacity.
    ///
    /// Evicts unpinned cells (oldest-unused first) as necessary, then waits up
    /// to `timeout` for concurrent releases. Returns `false` without holding
    /// any partial commitment if the reservation cannot be satisfied in time.
    pub async fn reserve(&self, needed: ResourceUsage, timeout: Duration) -> bool {
        if !needed.fits_in(&self.capacity) {
            tracing::warn!(
                needed = %needed,
                capacity = %self.capacity,
                "reservation exceeds total capacity"
            );
            return false;
        }

        let deadline = Instant::now() + timeout;
        loop {
            // Register for release notifications before looking at the list,
            // so a release between the eviction pass and the wait is not lost.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.evict_until_fits(needed) {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Returns previously committed capacity and wakes waiting reservations.
    pub fn release(&self, resource: ResourceUsage) {
        {
            let mut state = self.state.lock().unwrap();
            state.committed = state.committed.saturating_sub(resource);
        }
        self.released.notify_waiters();
    }

    /// Registers a cell that just became loaded-and-unpinned.
    pub(crate) fn insert(&self, cell: Weak<dyn Evictable>, epoch: u64) {
        let mut state = self.state.lock().unwrap();
        state.lru.push_back(Entry { cell, epoch });
    }

    fn try_reserve(&self, needed: ResourceUsage) -> bool {
        let mut state = self.state.lock().unwrap();
        if (state.committed + needed).fits_in(&self.capacity) {
            state.committed += needed;
            true
        } else {
            false
        }
    }

    /// One eviction pass: pops LRU entries and evicts their cells until the
    /// reservation fits or no evictable cells remain.
    ///
    /// Entries are popped with the list lock already released before the cell
    /// is touched; cells lock themselves first and then call back into the
    /// list, so holding both at once from this side would invert the order.
    fn evict_until_fits(&self, needed: ResourceUsage) -> bool {
        loop {
            if self.try_reserve(needed) {
                return true;
            }
            let entry = {
                let mut state = self.state.lock().unwrap();
                state.lru.pop_front()
            };
            let Some(entry) = entry else {
                return false;
            };
            let Some(cell) = entry.cell.upgrade() else {
                continue;
            };
            if let Some(freed) = cell.try_evict(entry.epoch) {
                tracing::trace!(key = cell.key(), freed = %freed, "evicted cell for reservation");
                let mut state = self.state.lock().unwrap();
                state.committed = state.committed.saturating_sub(freed);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn committed(&self) -> ResourceUsage {
        self.state.lock().unwrap().committed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_reserve_release_round_trip() {
        let list = EvictionList::new(ResourceUsage::new(1000, 100));

        assert!(list.reserve(ResourceUsage::new(600, 60), Duration::ZERO).await);
        assert_eq!(list.committed(), ResourceUsage::new(600, 60));

        // Does not fit in the memory dimension, nothing to evict.
        assert!(!list.reserve(ResourceUsage::new(500, 0), Duration::ZERO).await);
        assert_eq!(list.committed(), ResourceUsage::new(600, 60));

        list.release(ResourceUsage::new(600, 60));
        assert_eq!(list.committed(), ResourceUsage::ZERO);

        assert!(list.reserve(ResourceUsage::new(1000, 100), Duration::ZERO).await);
        assert_eq!(list.committed(), ResourceUsage::new(1000, 100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_larger_than_capacity_fails_fast() {
        let list = EvictionList::new(ResourceUsage::new(100, 0));
        assert!(
            !list
                .reserve(ResourceUsage::new(101, 0), Duration::from_secs(60))
                .await
        );
        assert_eq!(list.committed(), ResourceUsage::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_waits_for_release() {
        let list = Arc::new(EvictionList::new(ResourceUsage::new(100, 0)));
        assert!(list.reserve(ResourceUsage::new(100, 0), Duration::ZERO).await);

        let releaser = Arc::clone(&list);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            releaser.release(ResourceUsage::new(100, 0));
        });

        assert!(
            list.reserve(ResourceUsage::new(100, 0), Duration::from_secs(1))
                .await
        );
        assert_eq!(list.committed(), ResourceUsage::new(100, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_times_out_without_release() {
        let list = EvictionList::new(ResourceUsage::new(100, 0));
        assert!(list.reserve(ResourceUsage::new(100, 0), Duration::ZERO).await);

        let started = Instant::now();
        assert!(
            !list
                .reserve(ResourceUsage::new(1, 0), Duration::from_millis(200))
                .await
        );
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(list.committed(), ResourceUsage::new(100, 0));
    }
}
