//! Storage configuration.
//!
//! The page size is process-wide in spirit: the buffer pool and every heap
//! file it serves must be built from the same [`StorageConfig`].

use crate::{Result, StorageError};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_POOL_PAGES: usize = 50;
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 500;

/// Prefix for environment overrides, e.g. `HEAPDB_PAGE_SIZE=8192`.
pub const ENV_PREFIX: &str = "HEAPDB";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Size in bytes of every page on disk and in the cache.
    pub page_size: usize,
    /// Number of pages the buffer pool keeps resident.
    pub pool_pages: usize,
    /// How long a transaction waits for a page lock before it is aborted.
    pub lock_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            pool_pages: DEFAULT_POOL_PAGES,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

impl StorageConfig {
    /// Loads configuration from an optional file (any format the `config`
    /// crate recognises by extension) and `HEAPDB_*` environment variables,
    /// the latter taking precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: StorageConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_pool_pages(mut self, pool_pages: usize) -> Self {
        self.pool_pages = pool_pages;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(StorageError::Config("page_size must be > 0".into()));
        }
        if self.pool_pages == 0 {
            return Err(StorageError::Config("pool_pages must be > 0".into()));
        }
        if self.lock_timeout_ms == 0 {
            return Err(StorageError::Config("lock_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}
