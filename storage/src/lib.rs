//! Storage engine for heapdb
//!
//! This crate provides the heap-file storage layer: fixed-size pages of
//! fixed-width records, the heap file that maps a table onto those pages,
//! the transaction-scoped scan cursor, and the page cache through which all
//! transactional page access flows.

pub mod buffer;
pub mod config;
pub mod file;
pub mod page;

pub use buffer::{BufferPool, PageRef, Permission};
pub use config::StorageConfig;
pub use file::{DbFile, HeapFile, HeapFileCursor, Records};
pub use page::HeapPage;

use heapdb_core::{PageId, TransactionId};
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Page {page} is out of range (file has {page_count} pages)")]
    OutOfRange { page: PageId, page_count: u32 },

    #[error("Storage failure: {0}")]
    StorageFailure(#[from] io::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("No more records")]
    NoSuchElement,

    #[error("Transaction {tid} aborted while waiting for page {page}")]
    TransactionAborted { tid: TransactionId, page: PageId },

    #[error("Buffer pool full: all {capacity} cached pages are dirty")]
    PoolExhausted { capacity: usize },

    #[error("File {0} is not registered with the buffer pool")]
    UnknownFile(u32),

    #[error("Corrupted page image: {0}")]
    Corrupted(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// True for failures that oblige the caller to roll the transaction back.
    pub fn is_abort(&self) -> bool {
        matches!(self, StorageError::TransactionAborted { .. })
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init_logging() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}
