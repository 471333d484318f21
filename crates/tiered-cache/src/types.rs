use std::fmt;
use std::ops::{Add, AddAssign};

use serde::Deserialize;

/// Index of a cell within its slot's cell array.
///
/// Cell ids are dense and stable for the lifetime of the slot; the cell array
/// is never resized or reindexed after construction.
pub type CellId = usize;

/// An external id as seen by consumers of a slot (e.g. a row or chunk id).
/// Mapped to a [`CellId`] according to the slot's [`CellIdMappingMode`].
pub type UniqueId = usize;

/// A resource cost with two independently tracked dimensions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// Bytes of process memory the cell occupies once loaded.
    pub memory_bytes: u64,
    /// Bytes of local disk the cell occupies once loaded.
    pub file_bytes: u64,
}

impl ResourceUsage {
    pub const ZERO: Self = Self {
        memory_bytes: 0,
        file_bytes: 0,
    };

    pub fn new(memory_bytes: u64, file_bytes: u64) -> Self {
        Self {
            memory_bytes,
            file_bytes,
        }
    }

    /// Whether this usage fits within `capacity` in both dimensions.
    pub fn fits_in(&self, capacity: &Self) -> bool {
        self.memory_bytes <= capacity.memory_bytes && self.file_bytes <= capacity.file_bytes
    }

    pub fn saturating_sub(&self, other: Self) -> Self {
        Self {
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            file_bytes: self.file_bytes.saturating_sub(other.file_bytes),
        }
    }
}

impl Add for ResourceUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            memory_bytes: self.memory_bytes + rhs.memory_bytes,
            file_bytes: self.file_bytes + rhs.file_bytes,
        }
    }
}

impl AddAssign for ResourceUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.memory_bytes += rhs.memory_bytes;
        self.file_bytes += rhs.file_bytes;
    }
}

impl fmt::Display for ResourceUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes memory, {} bytes disk",
            self.memory_bytes, self.file_bytes
        )
    }
}

/// Where a slot's cell data lives once loaded. Used as a metric tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Memory,
    Disk,
    Mixed,
}

impl AsRef<str> for StorageType {
    fn as_ref(&self) -> &str {
        match self {
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Mixed => "mixed",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// How external [`UniqueId`]s are resolved to [`CellId`]s.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellIdMappingMode {
    /// External id equals cell id.
    Identical,
    /// All external ids map to cell 0 (single-cell slot).
    AlwaysZero,
    /// Mapping is delegated to the translator.
    Custom,
}

/// Whether a slot eagerly loads all of its cells on [`warmup`].
///
/// [`warmup`]: crate::CacheSlot::warmup
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheWarmupPolicy {
    #[default]
    Disable,
    Sync,
}

/// Static metadata a translator reports about its slot.
#[derive(Clone, Copy, Debug)]
pub struct TranslatorMeta {
    pub storage_type: StorageType,
    pub cache_warmup_policy: CacheWarmupPolicy,
    pub cell_id_mapping_mode: CellIdMappingMode,
}
