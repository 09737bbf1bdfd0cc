//! Configuration structures for Treeline.

use serde::{Deserialize, Serialize};

/// Storage configuration for the index core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Buffer pool size in number of pages.
    pub buffer_pool_pages: usize,
    /// Lock acquisition timeout in milliseconds.
    pub lock_timeout_ms: u64,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            buffer_pool_pages: 1024,
            lock_timeout_ms: 200,
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the lock timeout as a `Duration`.
    pub fn lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.buffer_pool_pages, 1024);
        assert_eq!(config.lock_timeout_ms, 200);
        assert!(config.fsync_enabled);
    }

    #[test]
    fn test_lock_timeout_duration() {
        let config = StorageConfig {
            lock_timeout_ms: 50,
            ..Default::default()
        };
        assert_eq!(config.lock_timeout(), std::time::Duration::from_millis(50));
    }

    #[test]
    fn test_storage_config_clone() {
        let config1 = StorageConfig::default();
        let config2 = config1.clone();
        assert_eq!(config1.buffer_pool_pages, config2.buffer_pool_pages);
        assert_eq!(config1.lock_timeout_ms, config2.lock_timeout_ms);
    }

    #[test]
    fn test_storage_config_serde_roundtrip() {
        let original = StorageConfig::default();
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: StorageConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.buffer_pool_pages, deserialized.buffer_pool_pages);
        assert_eq!(original.lock_timeout_ms, deserialized.lock_timeout_ms);
        assert_eq!(original.fsync_enabled, deserialized.fsync_enabled);
    }
}
