use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::error::{CacheContents, CacheError};
use crate::eviction::{Evictable, EvictionList};
use crate::metrics;
use crate::types::{ResourceUsage, StorageType};

type Waiter<C> = oneshot::Sender<CacheContents<PinHandle<C>>>;

/// The load state machine of one cell.
enum State<C>
where
    C: Send + Sync + 'static,
{
    Unloaded,
    /// A load is in flight; exactly one requester dispatched it, everyone
    /// else is parked in `waiters`.
    Loading { waiters: Vec<Waiter<C>> },
    Loaded {
        payload: Arc<C>,
        pins: usize,
        since: Instant,
    },
    /// Terminal until the next pin attempt retries the load.
    Error(CacheError),
}

struct Inner<C>
where
    C: Send + Sync + 'static,
{
    state: State<C>,
    /// Bumped on every transition that invalidates outstanding eviction-list
    /// entries: re-pinning an idle cell, loading, and unloading.
    epoch: u64,
}

/// One addressable unit of cached data within a slot.
///
/// All state transitions go through the inner mutex; the payload itself is
/// shared out as an `Arc`, so pinned readers never contend with (or race)
/// the eviction path.
pub(crate) struct Cell<C>
where
    C: Send + Sync + 'static,
{
    key: String,
    size: ResourceUsage,
    storage_type: StorageType,
    list: Option<Arc<EvictionList>>,
    inner: Mutex<Inner<C>>,
}

/// The outcome of a single pin attempt.
pub(crate) enum PinTicket<C>
where
    C: Send + Sync + 'static,
{
    /// The cell was already loaded; the pin is effective immediately.
    Ready(PinHandle<C>),
    /// The cell is being loaded. `need_load` is true for exactly the one
    /// requester that must dispatch the fetch.
    Pending {
        need_load: bool,
        rx: oneshot::Receiver<CacheContents<PinHandle<C>>>,
    },
}

impl<C> Cell<C>
where
    C: Send + Sync + 'static,
{
    pub(crate) fn new(
        key: String,
        size: ResourceUsage,
        storage_type: StorageType,
        list: Option<Arc<EvictionList>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            size,
            storage_type,
            list,
            inner: Mutex::new(Inner {
                state: State::Unloaded,
                epoch: 0,
            }),
        })
    }

    pub(crate) fn size(&self) -> ResourceUsage {
        self.size
    }

    pub(crate) fn cell_key(&self) -> &str {
        &self.key
    }

    /// Pins the cell, or registers the caller on the in-flight load.
    ///
    /// An `Unloaded` or `Error` cell transitions to `Loading` and the caller
    /// becomes responsible for dispatching the fetch (`need_load`).
    pub(crate) fn pin(self: &Arc<Self>) -> PinTicket<C> {
        let mut inner = self.inner.lock().unwrap();
        let Inner { state, epoch } = &mut *inner;
        match state {
            State::Loaded { payload, pins, .. } => {
                if *pins == 0 {
                    // Invalidate the eviction-list entry created at unpin.
                    *epoch += 1;
                }
                *pins += 1;
                PinTicket::Ready(PinHandle {
                    cell: Arc::clone(self),
                    payload: Arc::clone(payload),
                })
            }
            State::Loading { waiters } => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                PinTicket::Pending {
                    need_load: false,
                    rx,
                }
            }
            State::Unloaded | State::Error(_) => {
                let (tx, rx) = oneshot::channel();
                *state = State::Loading { waiters: vec![tx] };
                PinTicket::Pending { need_load: true, rx }
            }
        }
    }

    /// Populates the cell and wakes all waiters with their own pin.
    ///
    /// Only the single loading requester calls this. Waiters whose receiver
    /// has gone away have their pin released again once the lock is dropped,
    /// so an abandoned load leaves the cell evictable rather than pinned.
    pub(crate) fn set_cell(self: &Arc<Self>, payload: C) {
        let payload = Arc::new(payload);
        let mut abandoned = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let waiters = match &mut inner.state {
                State::Loading { waiters } => std::mem::take(waiters),
                _ => {
                    tracing::trace!(key = %self.key, "cell already populated, dropping duplicate payload");
                    return;
                }
            };
            inner.epoch += 1;
            inner.state = State::Loaded {
                payload: Arc::clone(&payload),
                pins: waiters.len(),
                since: Instant::now(),
            };
            metrics::add_used_bytes(self.size);
            metric!(counter("cache.cells.loaded") += 1, "storage" => self.storage_type.as_ref());

            for tx in waiters {
                let handle = PinHandle {
                    cell: Arc::clone(self),
                    payload: Arc::clone(&payload),
                };
                if let Err(unclaimed) = tx.send(Ok(handle)) {
                    // Dropping the handle here would re-enter this mutex.
                    abandoned.push(unclaimed);
                }
            }
        }
        drop(abandoned);
    }

    /// Fails the in-flight load, waking all waiters with a shared cause.
    pub(crate) fn set_error(&self, error: CacheError) {
        let mut inner = self.inner.lock().unwrap();
        let waiters = match &mut inner.state {
            State::Loading { waiters } => std::mem::take(waiters),
            _ => {
                tracing::trace!(key = %self.key, "set_error on a cell that is not loading");
                return;
            }
        };
        inner.epoch += 1;
        inner.state = State::Error(error.clone());
        for tx in waiters {
            // A waiter that gave up just drops the error.
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// Unloads the cell if it is loaded and unpinned, returning the cell's
    /// share of committed budget to the eviction list.
    pub(crate) fn manual_evict(&self) -> bool {
        let freed = {
            let mut inner = self.inner.lock().unwrap();
            if matches!(inner.state, State::Loaded { pins: 0, .. }) {
                Some(self.unload_locked(&mut inner))
            } else {
                None
            }
        };
        match freed {
            Some(size) => {
                if let Some(list) = &self.list {
                    list.release(size);
                }
                true
            }
            None => false,
        }
    }

    fn unpin(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        let Inner { state, epoch } = &mut *inner;
        match state {
            State::Loaded { pins, .. } => {
                debug_assert!(*pins > 0, "unpinning a cell with no pins: {}", self.key);
                *pins -= 1;
                if *pins == 0 {
                    if let Some(list) = &self.list {
                        let weak = Arc::downgrade(self) as Weak<dyn Evictable>;
                        list.insert(weak, *epoch);
                    }
                }
            }
            _ => {
                debug_assert!(false, "unpinning a cell that is not loaded: {}", self.key);
            }
        }
    }

    /// Caller must have verified the state is `Loaded` with zero pins.
    fn unload_locked(&self, inner: &mut Inner<C>) -> ResourceUsage {
        if let State::Loaded { since, .. } = &inner.state {
            metric!(
                time_raw("cache.cell.lifetime_seconds") = since.elapsed().as_secs(),
                "storage" => self.storage_type.as_ref(),
            );
        }
        inner.epoch += 1;
        inner.state = State::Unloaded;
        metrics::sub_used_bytes(self.size);
        metric!(counter("cache.cells.loaded") -= 1, "storage" => self.storage_type.as_ref());
        self.size
    }
}

impl<C> Evictable for Cell<C>
where
    C: Send + Sync + 'static,
{
    fn try_evict(&self, epoch: u64) -> Option<ResourceUsage> {
        let mut inner = self.inner.lock().unwrap();
        if inner.epoch != epoch {
            return None;
        }
        if !matches!(inner.state, State::Loaded { pins: 0, .. }) {
            return None;
        }
        Some(self.unload_locked(&mut inner))
    }

    fn key(&self) -> &str {
        &self.key
    }
}

impl<C> Drop for Cell<C>
where
    C: Send + Sync + 'static,
{
    fn drop(&mut self) {
        // The owning slot must outlive any in-flight load.
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        if matches!(inner.state, State::Loading { .. }) {
            tracing::error!(key = %self.key, "cell destroyed while loading");
        }
    }
}

/// Proof that one cell is pinned.
///
/// Carries shared ownership of the payload, so reads through the handle are
/// lock-free. Dropping the handle decrements the cell's pin count; when the
/// count reaches zero the cell becomes eligible for eviction again (eviction
/// itself happens lazily, on the next resource-pressure event).
pub struct PinHandle<C>
where
    C: Send + Sync + 'static,
{
    cell: Arc<Cell<C>>,
    payload: Arc<C>,
}

impl<C> PinHandle<C>
where
    C: Send + Sync + 'static,
{
    pub fn get(&self) -> &C {
        &self.payload
    }
}

impl<C> Drop for PinHandle<C>
where
    C: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.cell.unpin();
    }
}
