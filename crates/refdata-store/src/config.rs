use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Configuration for the reference data store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceDataConfig {
    /// Directory holding the database file.
    pub local_dir: PathBuf,
    /// Name of the database file inside `local_dir`.
    pub db_file_name: String,
    /// Successful puts between intermediate commits. Zero commits only when
    /// the loader closes.
    pub max_puts_before_commit: usize,
    /// Number of stripes in the per-stream load lock table.
    pub loading_lock_stripes: usize,
    /// How often a blocked lock waiter checks for interruption.
    pub lock_poll_interval: Duration,
    /// Maximum idle buffers kept by the key buffer pool.
    pub buffer_pool_max_size: usize,
    /// Streams not accessed for this long are purged.
    pub purge_age: Duration,
    /// Minimum interval between last-access updates on read.
    pub processing_info_update_delay: Duration,
}

impl Default for ReferenceDataConfig {
    fn default() -> Self {
        Self {
            local_dir: PathBuf::from("reference_data"),
            db_file_name: "refdata.redb".to_string(),
            max_puts_before_commit: 0,
            loading_lock_stripes: 100,
            lock_poll_interval: Duration::from_millis(100),
            buffer_pool_max_size: 16,
            purge_age: Duration::from_secs(30 * 24 * 60 * 60),
            processing_info_update_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl ReferenceDataConfig {
    /// Default configuration rooted at the given directory.
    pub fn in_dir(local_dir: impl Into<PathBuf>) -> Self {
        Self {
            local_dir: local_dir.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document. Missing keys take their default values.
    pub fn from_toml_str(text: &str) -> StoreResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> StoreResult<String> {
        toml::to_string(self).map_err(|e| StoreError::Config(e.to_string()))
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.loading_lock_stripes == 0 {
            return Err(StoreError::Config(
                "loading_lock_stripes must be at least 1".to_string(),
            ));
        }
        if self.lock_poll_interval.is_zero() {
            return Err(StoreError::Config(
                "lock_poll_interval must be non-zero".to_string(),
            ));
        }
        if self.db_file_name.is_empty() {
            return Err(StoreError::Config("db_file_name is empty".to_string()));
        }
        Ok(())
    }

    /// Full path of the database file.
    pub fn db_path(&self) -> PathBuf {
        self.local_dir.join(&self.db_file_name)
    }
}
