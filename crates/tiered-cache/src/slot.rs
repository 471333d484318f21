use std::sync::Arc;
use std::{fmt, mem};
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::cell::{Cell, PinHandle, PinTicket};
use crate::error::{CacheContents, CacheError};
use crate::eviction::EvictionList;
use crate::translator::{CellSized, Translator};
use crate::types::{CacheWarmupPolicy, CellId, CellIdMappingMode, ResourceUsage, TranslatorMeta, UniqueId};

/// How long a pin request may wait for a resource reservation by default.
pub const DEFAULT_PIN_TIMEOUT: Duration = Duration::from_secs(100);

/// The cache slot for one logical collection (e.g. one field's data).
///
/// Owns a fixed array of cells created from its [`Translator`] and coordinates
/// loading, pinning and eviction for arbitrary subsets of them. Constructed
/// behind an [`Arc`] because the [`CellAccessor`]s it hands out keep the slot
/// alive after the call that created them has returned.
///
/// Pinning does not start any work until the returned future is first
/// polled; from then on the dispatched load runs on its own task, holds the
/// slot alive, and completes even if the pinning future is dropped.
pub struct CacheSlot<T: Translator> {
    translator: T,
    /// Each cell's id is its index. Never resized after construction.
    cells: Vec<Arc<Cell<T::Cell>>>,
    mapping: CellIdMappingMode,
    eviction: Option<Arc<EvictionList>>,
}

impl<T: Translator> CacheSlot<T> {
    /// Creates a slot from a translator and an optional global eviction list.
    ///
    /// Without an eviction list the slot admits every load unconditionally
    /// and cells are only ever evicted manually.
    pub fn new(translator: T, eviction: Option<Arc<EvictionList>>) -> Arc<Self> {
        let meta = *translator.meta();
        let num_cells = translator.num_cells();
        let cells = (0..num_cells)
            .map(|cid| {
                Cell::new(
                    format!("{}:{}", translator.key(), cid),
                    translator.estimated_byte_size_of_cell(cid),
                    meta.storage_type,
                    eviction.clone(),
                )
            })
            .collect();

        let slot = Self {
            translator,
            cells,
            mapping: meta.cell_id_mapping_mode,
            eviction,
        };
        metric!(counter("cache.slots") += 1, "storage" => meta.storage_type.as_ref());
        metric!(counter("cache.cells") += num_cells as i64, "storage" => meta.storage_type.as_ref());
        metric!(
            counter("cache.overhead_bytes") += slot.memory_overhead() as i64,
            "storage" => meta.storage_type.as_ref(),
        );
        Arc::new(slot)
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// The estimated cost of one cell. Panics if `cid` is out of range.
    pub fn size_of_cell(&self, cid: CellId) -> ResourceUsage {
        self.cells[cid].size()
    }

    pub fn meta(&self) -> &TranslatorMeta {
        self.translator.meta()
    }

    /// The translator's stable identifier for this slot.
    pub fn key(&self) -> &str {
        self.translator.key()
    }

    /// Resolves an external id to a cell id according to the mapping mode.
    pub fn cell_id_of(&self, uid: UniqueId) -> CellId {
        match self.mapping {
            CellIdMappingMode::Identical => uid,
            CellIdMappingMode::AlwaysZero => 0,
            CellIdMappingMode::Custom => self.translator.cell_id_of(uid),
        }
    }

    /// Pins the cells behind the given external ids, loading any that are not
    /// yet resident.
    ///
    /// Duplicate ids are allowed; the deduplicated set of touched cells is
    /// pinned. The call completes once every requested cell is loaded or
    /// failed; if any cell failed, the whole request fails with that cell's
    /// cause and no accessor is returned. `timeout` bounds only the resource
    /// reservation; a dispatched fetch always runs to completion.
    pub async fn pin_cells(
        self: &Arc<Self>,
        uids: &[UniqueId],
        timeout: Duration,
    ) -> CacheContents<CellAccessor<T>> {
        let mut cids = FxHashSet::default();
        match self.mapping {
            CellIdMappingMode::Identical => {
                cids.extend(uids.iter().copied());
            }
            CellIdMappingMode::AlwaysZero => {
                if !uids.is_empty() {
                    cids.insert(0);
                }
            }
            CellIdMappingMode::Custom => {
                cids.extend(uids.iter().map(|&uid| self.translator.cell_id_of(uid)));
            }
        }
        self.pin_internal(cids, timeout).await
    }

    /// Pins every cell of the slot.
    pub async fn pin_all_cells(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> CacheContents<CellAccessor<T>> {
        self.pin_internal((0..self.cells.len()).collect(), timeout)
            .await
    }

    /// Eagerly loads every cell once if the slot's warmup policy asks for it,
    /// then drops the pins again. The data stays cached but unpinned, so it is
    /// eligible for later eviction.
    pub async fn warmup(self: &Arc<Self>) -> CacheContents<()> {
        match self.translator.meta().cache_warmup_policy {
            CacheWarmupPolicy::Disable => Ok(()),
            CacheWarmupPolicy::Sync => self
                .pin_all_cells(DEFAULT_PIN_TIMEOUT)
                .await
                .map(|_accessor| ()),
        }
    }

    /// Unloads the cell if it is currently loaded and unpinned.
    /// Returns whether an eviction happened.
    pub fn manual_evict(&self, cid: CellId) -> bool {
        self.cells.get(cid).is_some_and(|cell| cell.manual_evict())
    }

    /// Unloads all cells that are loaded and unpinned.
    /// Returns whether any eviction happened.
    pub fn manual_evict_all(&self) -> bool {
        let mut evicted = false;
        for cell in &self.cells {
            evicted |= cell.manual_evict();
        }
        evicted
    }

    async fn pin_internal(
        self: &Arc<Self>,
        cids: FxHashSet<CellId>,
        timeout: Duration,
    ) -> CacheContents<CellAccessor<T>> {
        // Out-of-range ids fail before any pin or reservation, so a bad
        // request has no side effects at all.
        for &cid in &cids {
            if cid >= self.cells.len() {
                return Err(CacheError::OutOfRange {
                    cid,
                    num_cells: self.cells.len(),
                    key: self.translator.key().to_owned(),
                });
            }
        }

        let mut pins = FxHashMap::default();
        pins.reserve(cids.len());
        let mut pending = Vec::new();
        let mut need_load = Vec::new();
        let mut resource_needed = ResourceUsage::ZERO;
        for &cid in &cids {
            match self.cells[cid].pin() {
                PinTicket::Ready(handle) => {
                    pins.insert(cid, handle);
                }
                PinTicket::Pending { need_load: load, rx } => {
                    if load {
                        need_load.push(cid);
                        resource_needed += self.cells[cid].size();
                    }
                    pending.push((cid, rx));
                }
            }
        }

        if !need_load.is_empty() {
            need_load.sort_unstable();
            // The load must outlive this request: if the caller is dropped
            // mid-flight, waiters on the same cells still need an outcome.
            let slot = Arc::clone(self);
            tokio::spawn(async move {
                slot.run_load(&need_load, resource_needed, timeout).await;
            });
        }

        for (cid, rx) in pending {
            match rx.await {
                Ok(Ok(handle)) => {
                    pins.insert(cid, handle);
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    tracing::error!(
                        key = self.translator.key(),
                        cid,
                        "cell load completed without waking its waiter"
                    );
                    return Err(CacheError::InternalError);
                }
            }
        }

        Ok(CellAccessor {
            pins,
            slot: Arc::clone(self),
        })
    }

    /// Negotiates the resource budget and runs the single batch fetch for
    /// one request's `need_load` set.
    ///
    /// Always driven on its own task: once dispatched, a fetch runs to its
    /// terminal outcome even if every requester has gone away, so the
    /// affected cells are never stranded in the loading state.
    async fn run_load(&self, cids: &[CellId], resource_needed: ResourceUsage, timeout: Duration) {
        let storage = self.translator.meta().storage_type;

        if let Some(list) = &self.eviction {
            let started = Instant::now();
            let reserved = list.reserve(resource_needed, timeout).await;
            tracing::trace!(
                key = self.translator.key(),
                success = reserved,
                elapsed = ?started.elapsed(),
                "resource reservation finished"
            );
            if !reserved {
                let message = format!(
                    "failed to reserve {resource_needed} for cells {cids:?} of slot {}",
                    self.translator.key()
                );
                tracing::error!(key = self.translator.key(), needed = %resource_needed, "{message}");
                metric!(counter("cache.loads.failed") += cids.len() as i64, "storage" => storage.as_ref());
                let error = CacheError::InsufficientResource(message);
                // Nothing was committed, so there is nothing to release.
                for &cid in cids {
                    self.cells[cid].set_error(error.clone());
                }
                return;
            }
        }

        let started = Instant::now();
        match self.translator.get_cells(cids).await {
            Ok(results) => {
                let latency = started.elapsed();
                let mut requested: FxHashSet<CellId> = cids.iter().copied().collect();
                let mut loaded = 0i64;
                for (cid, payload) in results {
                    if !requested.remove(&cid) {
                        tracing::trace!(
                            key = self.translator.key(),
                            cid,
                            "translator returned a cell that was not requested, dropping"
                        );
                        continue;
                    }
                    metric!(
                        time_raw("cache.cell.loaded_size") = payload.cell_byte_size() as u64,
                        "storage" => storage.as_ref(),
                    );
                    self.cells[cid].set_cell(payload);
                    loaded += 1;
                }
                metric!(
                    time_raw("cache.load.latency_us") = latency.as_micros() as u64,
                    "storage" => storage.as_ref(),
                );
                metric!(counter("cache.loads.succeeded") += loaded, "storage" => storage.as_ref());

                // Requested cells the translator skipped fail individually,
                // and their share of the reservation goes back.
                if !requested.is_empty() {
                    let mut missing_share = ResourceUsage::ZERO;
                    for &cid in &requested {
                        missing_share += self.cells[cid].size();
                        let message = format!(
                            "translator returned no data for cell {}",
                            self.cells[cid].cell_key()
                        );
                        tracing::error!(key = self.translator.key(), cid, "{message}");
                        self.cells[cid].set_error(CacheError::LoadFailed(message));
                    }
                    metric!(counter("cache.loads.failed") += requested.len() as i64, "storage" => storage.as_ref());
                    if let Some(list) = &self.eviction {
                        list.release(missing_share);
                    }
                }
            }
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    key = self.translator.key(),
                    "batch fetch failed"
                );
                metric!(counter("cache.loads.failed") += cids.len() as i64, "storage" => storage.as_ref());
                for &cid in cids {
                    self.cells[cid].set_error(err.clone());
                }
                if let Some(list) = &self.eviction {
                    list.release(resource_needed);
                }
            }
        }
    }

    fn memory_overhead(&self) -> usize {
        mem::size_of::<Self>() + self.cells.len() * mem::size_of::<Cell<T::Cell>>()
    }
}

impl<T: Translator> Drop for CacheSlot<T> {
    fn drop(&mut self) {
        let storage = self.translator.meta().storage_type;
        metric!(counter("cache.slots") -= 1, "storage" => storage.as_ref());
        metric!(counter("cache.cells") -= self.cells.len() as i64, "storage" => storage.as_ref());
        metric!(
            counter("cache.overhead_bytes") -= self.memory_overhead() as i64,
            "storage" => storage.as_ref(),
        );
    }
}

/// A thin wrapper for reading the cells pinned by one request.
///
/// While an accessor is alive, every cell in its pin set stays loaded and is
/// readable without any lock overhead. The accessor shares ownership of its
/// slot, so the slot cannot be destroyed while accessors exist.
///
/// Accessing a cell that is not part of this accessor's pin set is a caller
/// contract violation and panics.
pub struct CellAccessor<T: Translator> {
    // Pins are declared before the slot so they release first.
    pins: FxHashMap<CellId, PinHandle<T::Cell>>,
    slot: Arc<CacheSlot<T>>,
}

impl<T: Translator> CellAccessor<T> {
    /// Returns the cell behind the given external id.
    pub fn get_cell_of(&self, uid: UniqueId) -> &T::Cell {
        self.get_ith_cell(self.slot.cell_id_of(uid))
    }

    /// Returns the cell with the given cell id.
    pub fn get_ith_cell(&self, cid: CellId) -> &T::Cell {
        match self.pins.get(&cid) {
            Some(handle) => handle.get(),
            None => panic!(
                "cell {cid} of slot {} is not pinned by this accessor",
                self.slot.key()
            ),
        }
    }

    /// The cell ids pinned by this accessor, in no particular order.
    pub fn cell_ids(&self) -> impl Iterator<Item = CellId> + '_ {
        self.pins.keys().copied()
    }

    pub fn slot(&self) -> &Arc<CacheSlot<T>> {
        &self.slot
    }
}

impl<T: Translator> fmt::Debug for CellAccessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut cids: Vec<_> = self.pins.keys().copied().collect();
        cids.sort_unstable();
        f.debug_struct("CellAccessor")
            .field("slot", &self.slot.key())
            .field("cells", &cids)
            .finish()
    }
}
