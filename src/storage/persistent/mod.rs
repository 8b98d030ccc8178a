//! Durable storage backend.
//!
//! One directory per store:
//!
//! ```text
//! <dir>/LOCK            exclusive process lock
//! <dir>/wal.krsv        write-ahead log, one entry per write or transaction
//! <dir>/snapshot.krsv   tables as of the last compaction
//! <dir>/bloom.krsv      optional saved bloom filters
//! ```
//!
//! All files share the CRC32-framed JSON codec in [`codec`].

mod codec;
mod file_lock;
mod store;
mod wal;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub use store::PersistentStore;

/// Configuration for [`PersistentStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentConfig {
    /// Store directory; created if missing.
    pub dir: PathBuf,
    /// WAL size that triggers automatic compaction (bytes).
    #[serde(default = "PersistentConfig::default_max_wal_size")]
    pub max_wal_size: u64,
    /// Whether to fsync after every write (slower but safer).
    #[serde(default = "PersistentConfig::default_sync_on_write")]
    pub sync_on_write: bool,
}

impl PersistentConfig {
    /// Smallest accepted `max_wal_size`, to avoid compacting on every write.
    pub const MIN_WAL_SIZE: u64 = 4 * 1024;

    const fn default_max_wal_size() -> u64 {
        64 * 1024 * 1024
    }

    const fn default_sync_on_write() -> bool {
        true
    }

    /// Defaults for a store in `dir`: 64 MiB WAL, fsync on every write.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            max_wal_size: Self::default_max_wal_size(),
            sync_on_write: Self::default_sync_on_write(),
        }
    }

    /// Checks limits and returns the config unchanged.
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "dir",
                reason: "must not be empty".to_string(),
            });
        }
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ConfigError::Invalid {
                field: "max_wal_size",
                reason: format!(
                    "must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            });
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let cfg = PersistentConfig::new("/tmp/kyro-resolve").validate().unwrap();
        assert!(cfg.sync_on_write);

        let mut small = PersistentConfig::new("/tmp/kyro-resolve");
        small.max_wal_size = 16;
        let err = small.validate().unwrap_err();
        assert!(err.to_string().contains("max_wal_size"));

        assert!(PersistentConfig::new("").validate().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let cfg: PersistentConfig = toml::from_str("dir = \"/var/lib/resolve\"").unwrap();
        assert_eq!(cfg.dir, PathBuf::from("/var/lib/resolve"));
        assert_eq!(cfg.max_wal_size, 64 * 1024 * 1024);
    }
}
