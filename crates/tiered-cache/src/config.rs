use std::time::Duration;

use serde::Deserialize;

use crate::types::ResourceUsage;

/// Configuration for the global eviction list.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Capacity for loaded cell data held in memory, in bytes.
    pub memory_capacity_bytes: u64,
    /// Capacity for loaded cell data held on local disk, in bytes.
    pub disk_capacity_bytes: u64,
    /// How long a pin request may wait for a resource reservation before it
    /// fails with an insufficient-resource error.
    #[serde(with = "humantime_serde")]
    pub reservation_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity_bytes: 4 * 1024 * 1024 * 1024,
            disk_capacity_bytes: 32 * 1024 * 1024 * 1024,
            reservation_timeout: crate::DEFAULT_PIN_TIMEOUT,
        }
    }
}

impl CacheConfig {
    pub fn capacity(&self) -> ResourceUsage {
        ResourceUsage::new(self.memory_capacity_bytes, self.disk_capacity_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let config: CacheConfig = serde_json::from_str(
            r#"{
                "memory_capacity_bytes": 1048576,
                "reservation_timeout": "5s"
            }"#,
        )
        .unwrap();

        assert_eq!(config.memory_capacity_bytes, 1_048_576);
        assert_eq!(config.disk_capacity_bytes, 32 * 1024 * 1024 * 1024);
        assert_eq!(config.reservation_timeout, Duration::from_secs(5));
        assert_eq!(
            config.capacity(),
            ResourceUsage::new(1_048_576, 32 * 1024 * 1024 * 1024)
        );
    }
}
