use futures::future::BoxFuture;

use crate::error::CacheContents;
use crate::types::{CellId, ResourceUsage, TranslatorMeta, UniqueId};

/// A loaded cell must report its own memory footprint for metrics.
pub trait CellSized {
    /// The memory consumption of this cell, in bytes.
    fn cell_byte_size(&self) -> usize;
}

/// The storage backend of one [`CacheSlot`]: knows how to map external ids to
/// cells and how to fetch cell data from underlying storage.
///
/// The caching layer guarantees that [`get_cells`](Self::get_cells) is called
/// at most once per cell for any set of concurrent pin requests, and only
/// after the required resource budget has been admitted.
///
/// [`CacheSlot`]: crate::CacheSlot
pub trait Translator: Send + Sync + 'static {
    /// The cell payload type produced by this translator.
    type Cell: CellSized + Send + Sync + 'static;

    /// The number of cells in the slot. Fixed for the translator's lifetime.
    fn num_cells(&self) -> usize;

    /// The estimated cost of a cell, used for admission control before the
    /// cell is loaded.
    fn estimated_byte_size_of_cell(&self, cid: CellId) -> ResourceUsage;

    /// Maps an external id to a cell id.
    ///
    /// Only consulted when the slot's mapping mode is
    /// [`CellIdMappingMode::Custom`](crate::CellIdMappingMode::Custom).
    fn cell_id_of(&self, uid: UniqueId) -> CellId;

    /// A stable identifier for this slot, used in logs and cell keys.
    fn key(&self) -> &str;

    fn meta(&self) -> &TranslatorMeta;

    /// Fetches the given cells from underlying storage in one batch.
    ///
    /// May return fewer cells than requested; the missing ones are treated as
    /// failed by the caller. Cells that were not requested are ignored.
    fn get_cells(
        &self,
        cids: &[CellId],
    ) -> BoxFuture<'_, CacheContents<Vec<(CellId, Self::Cell)>>>;
}
