//! # Tiered caching layer
//!
//! On-demand, concurrency-safe loading of logically chunked data cells,
//! sitting between a query-execution layer that needs random, concurrent
//! access to arbitrarily large columnar data and the slower storage backing
//! it.
//!
//! ## Components
//!
//! - A [`CacheSlot`] owns a fixed array of cache cells for one logical
//!   collection (e.g. one field's data) and coordinates loading, pinning and
//!   eviction of arbitrary subsets of them. Slots are created from a
//!   [`Translator`], the external component that maps ids to cells and
//!   fetches cell bytes from storage.
//! - The [`EvictionList`] is a process-wide registry shared by all slots. It
//!   arbitrates a memory+disk budget: loads must reserve their estimated cost
//!   up front (with a timeout), evicting least-recently-unpinned cells when
//!   capacity runs out. Slots constructed without a list admit everything and
//!   only evict manually.
//! - A [`CellAccessor`] proves that a set of cells is pinned: while it lives,
//!   those cells cannot be evicted and are readable without any lock
//!   overhead. [`PinWrapper`] pairs a typed view with such a guard in
//!   type-erased form.
//!
//! ## The pin-and-load path
//!
//! A [`CacheSlot::pin_cells`] request resolves external ids to cell ids,
//! pins what is resident, and registers as loader-or-waiter on what is not:
//! for each cell at most one load is ever in flight, and every concurrent
//! requester of that cell observes the same outcome. The aggregate cost of
//! the cells that actually need loading is reserved against the eviction
//! list and the missing cells are fetched from the translator in a single
//! batch. The request completes only once every requested cell is loaded or
//! failed; any failed cell fails the request as a whole, so callers never
//! see an accessor for a partially available batch. Failed cells stay in an
//! error state and a later pin attempt retries just their fetch.
//!
//! ## Metrics
//!
//! All metrics are emitted through the [`metric!`] macro and are
//! fire-and-forget; nothing here changes behavior when statsd is not
//! configured. Per storage type, the layer reports slot/cell counts, loaded
//! cell counts, bookkeeping overhead, load latencies, load success/failure
//! counts, per-cell loaded sizes and cell lifetimes, plus process-wide
//! used-bytes gauges for both resource dimensions.

#[macro_use]
pub mod metrics;

mod cell;
mod config;
mod error;
mod eviction;
mod pin;
mod slot;
mod translator;
mod types;


pub use cell::PinHandle;
pub use config::CacheConfig;
pub use error::{CacheContents, CacheError};
pub use eviction::EvictionList;
pub use pin::PinWrapper;
pub use slot::{CacheSlot, CellAccessor, DEFAULT_PIN_TIMEOUT};
pub use translator::{CellSized, Translator};
pub use types::{
    CacheWarmupPolicy, CellId, CellIdMappingMode, ResourceUsage, StorageType, TranslatorMeta,
    UniqueId,
};
