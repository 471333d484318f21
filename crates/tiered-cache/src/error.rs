use std::io;

use thiserror::Error;

use crate::types::CellId;

/// An error produced while pinning or loading cache cells.
///
/// A failed load stores one instance of this error in every affected cell,
/// and all waiters of that load observe a clone of the same cause, so the
/// variants are kept cheap to clone and comparable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// A requested cell id lies beyond the slot's bounds.
    ///
    /// This is rejected before any resource reservation or load is attempted,
    /// so a request failing with this error has no side effects.
    #[error("cell id {cid} out of range, slot {key} has {num_cells} cells")]
    OutOfRange {
        cid: CellId,
        num_cells: usize,
        key: String,
    },
    /// The resource reservation for a batch load failed or timed out.
    ///
    /// No bytes were committed; the affected cells are marked with this error
    /// and a later pin attempt will retry the load.
    #[error("insufficient resource: {0}")]
    InsufficientResource(String),
    /// The translator's batch fetch failed, or it returned no data for a
    /// requested cell. Any bytes reserved for the affected cells have been
    /// released.
    #[error("load failed: {0}")]
    LoadFailed(String),
    /// An operation was invoked on a cell or column kind that does not
    /// implement it. A local contract violation, not a load failure.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// An unexpected error inside the caching layer itself.
    ///
    /// These should never happen and are logged when they do.
    #[error("internal error")]
    InternalError,
}

impl From<io::Error> for CacheError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

/// The result of a cache operation, containing either `Ok(T)` or the reason
/// why the requested cells could not be provided.
pub type CacheContents<T = ()> = Result<T, CacheError>;
