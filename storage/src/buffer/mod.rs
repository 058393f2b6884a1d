//! Transactional page cache.
//!
//! The buffer pool sits between heap files and everything above them:
//! - every page access during a transaction goes through [`BufferPool::get_page`],
//!   which first takes a page lock for the transaction and then serves the
//!   page from memory, reading it through the owning [`DbFile`] on a miss
//! - dirty pages are never evicted (NO-STEAL); at commit every page the
//!   transaction dirtied is written back (FORCE), at abort they are dropped
//! - locks are held until the transaction completes
//!
//! # Example
//!
//! ```no_run
//! use heapdb_core::{DataType, Schema, TransactionId, Tuple, Value};
//! use heapdb_storage::{BufferPool, DbFile, HeapFile, StorageConfig};
//! use std::sync::Arc;
//!
//! let config = StorageConfig::default();
//! let pool = BufferPool::new(config.clone());
//! let schema = Arc::new(Schema::from_types([DataType::Integer]));
//! let file = Arc::new(HeapFile::open("/tmp/t.dat", Arc::clone(&schema), &config).unwrap());
//! pool.register(file.clone());
//!
//! let tid = TransactionId::new();
//! let row = Tuple::new(schema, vec![Value::Integer(42)]);
//! pool.insert_tuple(tid, file.id(), row).unwrap();
//! pool.transaction_complete(tid, true).unwrap();
//! ```

mod lock;

use crate::config::StorageConfig;
use crate::file::DbFile;
use crate::page::HeapPage;
use crate::{Result, StorageError};
use heapdb_core::{PageId, TransactionId, Tuple};
use lock::LockManager;
use log::debug;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Shared handle to a cached page. Holding one keeps the page pinned in
/// the pool.
pub type PageRef = Arc<RwLock<HeapPage>>;

/// Intent with which a transaction fetches a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}

pub struct BufferPool {
    config: StorageConfig,
    files: RwLock<HashMap<u32, Arc<dyn DbFile>>>,
    pages: Mutex<LruCache<PageId, PageRef>>,
    locks: LockManager,
}

impl BufferPool {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            files: RwLock::new(HashMap::new()),
            pages: Mutex::new(LruCache::unbounded()),
            locks: LockManager::new(),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Makes `file` the backing store for every page whose `file_id` is
    /// `file.id()`. Registering a second file with the same id replaces the
    /// first.
    pub fn register(&self, file: Arc<dyn DbFile>) {
        debug!("registering file {}", file.id());
        self.files.write().insert(file.id(), file);
    }

    pub fn file(&self, file_id: u32) -> Result<Arc<dyn DbFile>> {
        self.files
            .read()
            .get(&file_id)
            .cloned()
            .ok_or(StorageError::UnknownFile(file_id))
    }

    /// Fetches `pid` on behalf of `tid`, blocking until the page lock implied
    /// by `perm` is granted. Fails with `TransactionAborted` if the lock
    /// cannot be obtained within the configured timeout.
    pub fn get_page(&self, tid: TransactionId, pid: PageId, perm: Permission) -> Result<PageRef> {
        self.locks
            .acquire(tid, pid, perm, self.config.lock_timeout())?;

        let mut pages = self.pages.lock();
        if let Some(page) = pages.get(&pid) {
            return Ok(Arc::clone(page));
        }

        let file = self.file(pid.file_id)?;
        debug!("page {} not cached, reading from disk", pid);
        let page = file.read_page(pid)?;

        if pages.len() >= self.config.pool_pages {
            self.evict_page(&mut pages)?;
        }
        let page = Arc::new(RwLock::new(page));
        pages.put(pid, Arc::clone(&page));
        Ok(page)
    }

    /// Drops `tid`'s lock on `pid` before the transaction ends. Only safe
    /// when the transaction has not relied on what it read from the page.
    /// A page `tid` has dirtied stays locked until the transaction completes.
    pub fn release_page(&self, tid: TransactionId, pid: PageId) {
        let dirtied = self
            .pages
            .lock()
            .peek(&pid)
            .is_some_and(|page| page.read().dirtied_by() == Some(tid));
        if dirtied {
            debug!("{} keeps its lock on dirty page {}", tid, pid);
            return;
        }
        self.locks.release(tid, pid);
    }

    pub fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        self.locks.holds_lock(tid, pid)
    }

    /// Inserts `tuple` into the file registered as `file_id`. The returned
    /// pages are already marked dirty by `tid`.
    pub fn insert_tuple(&self, tid: TransactionId, file_id: u32, tuple: Tuple) -> Result<Vec<PageRef>> {
        self.file(file_id)?.insert_tuple(self, tid, tuple)
    }

    /// Deletes `tuple` from the file its record id points into.
    pub fn delete_tuple(&self, tid: TransactionId, tuple: &Tuple) -> Result<PageRef> {
        let rid = tuple
            .record_id()
            .ok_or_else(|| StorageError::NotFound("tuple has no record id".into()))?;
        self.file(rid.page_id.file_id)?.delete_tuple(self, tid, tuple)
    }

    /// Ends `tid`. On commit every page it dirtied is written to its file
    /// and synced; on abort those pages are dropped from the cache so the
    /// next reader sees the on-disk image. All of `tid`'s locks are released
    /// either way.
    pub fn transaction_complete(&self, tid: TransactionId, commit: bool) -> Result<()> {
        let result = if commit {
            self.flush_pages(tid)
        } else {
            self.discard_pages(tid);
            Ok(())
        };
        self.locks.release_all(tid);
        debug!("{} {}", tid, if commit { "committed" } else { "aborted" });
        result
    }

    /// Writes every dirty page of `tid` back to disk.
    pub fn flush_pages(&self, tid: TransactionId) -> Result<()> {
        let pages = self.pages.lock();
        let mut touched = BTreeSet::new();
        for (pid, page) in pages.iter() {
            if page.read().dirtied_by() == Some(tid) {
                self.write_back(*pid, page)?;
                touched.insert(pid.file_id);
            }
        }
        drop(pages);
        for file_id in touched {
            self.file(file_id)?.sync()?;
        }
        Ok(())
    }

    /// Writes `pid` back if it is cached and dirty by a transaction that has
    /// already completed, which only happens when writing its commit failed.
    /// Pages of running transactions are left alone (NO-STEAL).
    pub fn flush_page(&self, pid: PageId) -> Result<()> {
        let pages = self.pages.lock();
        match pages.peek(&pid) {
            Some(page) if self.is_flushable(pid, page) => self.write_back(pid, page),
            _ => Ok(()),
        }
    }

    /// [`flush_page`](Self::flush_page) for every cached page.
    pub fn flush_all_pages(&self) -> Result<()> {
        let pages = self.pages.lock();
        for (pid, page) in pages.iter() {
            if self.is_flushable(*pid, page) {
                self.write_back(*pid, page)?;
            }
        }
        Ok(())
    }

    /// A dirty page may reach disk outside of commit only once its
    /// transaction holds no lock on it any more.
    fn is_flushable(&self, pid: PageId, page: &PageRef) -> bool {
        match page.read().dirtied_by() {
            Some(tid) if self.locks.holds_lock(tid, pid) => {
                debug!("not flushing page {}: {} is still running", pid, tid);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Drops `pid` from the cache without writing it.
    pub fn discard_page(&self, pid: PageId) {
        self.pages.lock().pop(&pid);
    }

    pub fn cached_pages(&self) -> usize {
        self.pages.lock().len()
    }

    fn discard_pages(&self, tid: TransactionId) {
        let mut pages = self.pages.lock();
        let dirty: Vec<PageId> = pages
            .iter()
            .filter(|(_, page)| page.read().dirtied_by() == Some(tid))
            .map(|(pid, _)| *pid)
            .collect();
        for pid in dirty {
            debug!("discarding page {} dirtied by {}", pid, tid);
            pages.pop(&pid);
        }
    }

    fn write_back(&self, pid: PageId, page: &PageRef) -> Result<()> {
        let file = self.file(pid.file_id)?;
        let mut page = page.write();
        file.write_page(&page)?;
        page.mark_dirty(None);
        Ok(())
    }

    /// Evicts the least recently used page that is clean and not pinned by
    /// an outstanding [`PageRef`].
    fn evict_page(&self, pages: &mut LruCache<PageId, PageRef>) -> Result<()> {
        let victim = pages
            .iter()
            .rev()
            .find(|(_, page)| Arc::strong_count(page) == 1 && page.read().dirtied_by().is_none())
            .map(|(pid, _)| *pid);
        match victim {
            Some(pid) => {
                debug!("evicting page {}", pid);
                pages.pop(&pid);
                Ok(())
            }
            None => Err(StorageError::PoolExhausted {
                capacity: self.config.pool_pages,
            }),
        }
    }
}
