// storage/src/file/mod.rs

mod cursor;

pub use cursor::{HeapFileCursor, Records};

use crate::buffer::{BufferPool, PageRef, Permission};
use crate::config::StorageConfig;
use crate::page::HeapPage;
use crate::{Result, StorageError};
use heapdb_core::{PageId, Schema, TransactionId, Tuple};
use log::{debug, warn};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Operations every table storage file offers to the buffer pool and to
/// the layers above. Heap files are the only organization there is.
pub trait DbFile: Send + Sync {
    /// Stable identifier of this file; the `file_id` of all its pages.
    fn id(&self) -> u32;

    fn schema(&self) -> &Arc<Schema>;

    /// Current number of pages, derived from the file length on every call.
    fn page_count(&self) -> Result<u32>;

    /// Reads a page image straight from disk. Meant for the buffer pool's
    /// miss path only.
    fn read_page(&self, pid: PageId) -> Result<HeapPage>;

    /// Writes a page image straight to disk. Meant for the buffer pool's
    /// flush path only.
    fn write_page(&self, page: &HeapPage) -> Result<()>;

    /// Forces written pages to stable storage.
    fn sync(&self) -> Result<()>;

    /// Adds `tuple` to the file on behalf of `tid`, returning the pages it
    /// modified.
    fn insert_tuple(&self, pool: &BufferPool, tid: TransactionId, tuple: Tuple)
        -> Result<Vec<PageRef>>;

    /// Removes the record `tuple` was read from or inserted as.
    fn delete_tuple(&self, pool: &BufferPool, tid: TransactionId, tuple: &Tuple) -> Result<PageRef>;

    /// A fresh, unopened scan over every record of the file.
    fn cursor<'a>(&'a self, pool: &'a BufferPool, tid: TransactionId) -> HeapFileCursor<'a>;
}

/// A table stored as an unordered sequence of fixed-size pages.
///
/// Page `n` occupies bytes `[n * page_size, (n + 1) * page_size)`; there is
/// no file header, so the page count is the file length divided by the page
/// size.
pub struct HeapFile {
    id: u32,
    path: PathBuf,
    file: Mutex<File>,
    schema: Arc<Schema>,
    page_size: usize,
}

impl HeapFile {
    /// Creates a new, empty heap file. Fails if `path` already exists.
    pub fn create(path: impl AsRef<Path>, schema: Arc<Schema>, config: &StorageConfig) -> Result<Self> {
        Self::check_layout(&schema, config)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        Self::from_file(file, path.as_ref(), schema, config)
    }

    /// Opens the heap file at `path`, creating an empty one if it does not
    /// exist yet.
    pub fn open(path: impl AsRef<Path>, schema: Arc<Schema>, config: &StorageConfig) -> Result<Self> {
        Self::check_layout(&schema, config)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        Self::from_file(file, path.as_ref(), schema, config)
    }

    /// Rejects configurations under which not a single record fits a page.
    fn check_layout(schema: &Schema, config: &StorageConfig) -> Result<()> {
        config.validate()?;
        if schema.num_columns() == 0 {
            return Err(StorageError::SchemaMismatch("schema has no columns".into()));
        }
        if HeapPage::slots_per_page(schema, config.page_size) == 0 {
            return Err(StorageError::SchemaMismatch(format!(
                "records of {} bytes do not fit in a {} byte page",
                schema.record_size(),
                config.page_size
            )));
        }
        Ok(())
    }

    fn from_file(file: File, path: &Path, schema: Arc<Schema>, config: &StorageConfig) -> Result<Self> {
        let len = file.metadata()?.len();
        if len % config.page_size as u64 != 0 {
            return Err(StorageError::StorageFailure(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{}: length {} is not a multiple of the page size {}",
                    path.display(),
                    len,
                    config.page_size
                ),
            )));
        }

        let path = std::fs::canonicalize(path)?;
        let id = Self::file_id(&path);
        debug!(
            "opened heap file {} as {} ({} pages)",
            path.display(),
            id,
            len / config.page_size as u64
        );

        Ok(Self {
            id,
            path,
            file: Mutex::new(file),
            schema,
            page_size: config.page_size,
        })
    }

    /// CRC-32 of the canonical path. Deterministic across runs; two distinct
    /// paths may collide, in which case the buffer pool cannot tell the
    /// files apart.
    pub fn file_id(canonical_path: &Path) -> u32 {
        crc32fast::hash(canonical_path.to_string_lossy().as_bytes())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn slots_per_page(&self) -> usize {
        HeapPage::slots_per_page(&self.schema, self.page_size)
    }

    fn pages_in(&self, file: &File) -> Result<u32> {
        let len = file.metadata()?.len();
        if len % self.page_size as u64 != 0 {
            warn!(
                "{}: length {} is not page aligned, ignoring the partial page",
                self.path.display(),
                len
            );
        }
        Ok((len / self.page_size as u64) as u32)
    }

    /// Grows the file by one zeroed page and returns its id. The length
    /// probe and the append happen under the file mutex, so concurrent
    /// callers always receive distinct page numbers.
    pub fn append_empty_page(&self) -> Result<PageId> {
        let mut file = self.file.lock();
        let page_number = self.pages_in(&file)?;

        let offset = page_number as u64 * self.page_size as u64;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&HeapPage::empty_page_data(self.page_size))?;

        let pid = PageId::new(self.id, page_number);
        debug!("allocated page {}", pid);
        Ok(pid)
    }

    fn check_file(&self, pid: PageId) -> Result<()> {
        if pid.file_id != self.id {
            return Err(StorageError::SchemaMismatch(format!(
                "page {} does not belong to file {}",
                pid, self.id
            )));
        }
        Ok(())
    }

    /// Inserts into `page` if it has room, handing the page back otherwise.
    fn try_insert(
        &self,
        page: PageRef,
        tid: TransactionId,
        tuple: &mut Option<Tuple>,
    ) -> Result<Option<PageRef>> {
        {
            let mut guard = page.write();
            if guard.num_empty_slots() == 0 {
                return Ok(None);
            }
            if let Some(tuple) = tuple.take() {
                let rid = guard.insert_tuple(tuple)?;
                guard.mark_dirty(Some(tid));
                debug!("{} inserted {}", tid, rid);
            }
        }
        Ok(Some(page))
    }
}

impl DbFile for HeapFile {
    fn id(&self) -> u32 {
        self.id
    }

    fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn page_count(&self) -> Result<u32> {
        let file = self.file.lock();
        self.pages_in(&file)
    }

    fn read_page(&self, pid: PageId) -> Result<HeapPage> {
        self.check_file(pid)?;

        let mut buffer = vec![0u8; self.page_size];
        {
            let mut file = self.file.lock();
            let page_count = self.pages_in(&file)?;
            if pid.page_number >= page_count {
                return Err(StorageError::OutOfRange {
                    page: pid,
                    page_count,
                });
            }

            let offset = pid.page_number as u64 * self.page_size as u64;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buffer)?;
        }

        HeapPage::from_bytes(pid, &buffer, Arc::clone(&self.schema))
    }

    fn write_page(&self, page: &HeapPage) -> Result<()> {
        let pid = page.id();
        self.check_file(pid)?;
        if page.page_size() != self.page_size {
            return Err(StorageError::StorageFailure(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "page {} is {} bytes, file pages are {}",
                    pid,
                    page.page_size(),
                    self.page_size
                ),
            )));
        }
        let data = page.to_bytes()?;

        let mut file = self.file.lock();
        let page_count = self.pages_in(&file)?;
        if pid.page_number > page_count {
            return Err(StorageError::StorageFailure(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "writing page {} would leave a gap after page {}",
                    pid, page_count
                ),
            )));
        }

        let offset = pid.page_number as u64 * self.page_size as u64;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&data)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all().map_err(StorageError::StorageFailure)
    }

    fn insert_tuple(
        &self,
        pool: &BufferPool,
        tid: TransactionId,
        tuple: Tuple,
    ) -> Result<Vec<PageRef>> {
        if !tuple.schema().same_types(&self.schema) {
            return Err(StorageError::SchemaMismatch(format!(
                "tuple schema {} does not match file schema {}",
                tuple.schema(),
                self.schema
            )));
        }
        self.schema
            .validate_values(tuple.values())
            .map_err(StorageError::SchemaMismatch)?;

        let mut tuple = Some(tuple);

        // First fit over the existing pages.
        for page_number in 0..self.page_count()? {
            let pid = PageId::new(self.id, page_number);
            let page = pool.get_page(tid, pid, Permission::ReadWrite)?;
            if let Some(page) = self.try_insert(page, tid, &mut tuple)? {
                return Ok(vec![page]);
            }
        }

        // Every page is full: grow the file. A page appended here can be
        // filled by another transaction before we lock it, so retry until
        // the insert lands.
        loop {
            let pid = self.append_empty_page()?;
            let page = pool.get_page(tid, pid, Permission::ReadWrite)?;
            if let Some(page) = self.try_insert(page, tid, &mut tuple)? {
                return Ok(vec![page]);
            }
        }
    }

    fn delete_tuple(&self, pool: &BufferPool, tid: TransactionId, tuple: &Tuple) -> Result<PageRef> {
        let rid = tuple
            .record_id()
            .ok_or_else(|| StorageError::NotFound("tuple has no record id".into()))?;
        self.check_file(rid.page_id)?;
        if rid.page_id.page_number >= self.page_count()? {
            return Err(StorageError::NotFound(format!(
                "record {} points past the end of file {}",
                rid, self.id
            )));
        }

        let page = pool.get_page(tid, rid.page_id, Permission::ReadWrite)?;
        {
            let mut guard = page.write();
            guard.delete_slot(rid.slot)?;
            guard.mark_dirty(Some(tid));
        }
        debug!("{} deleted {}", tid, rid);
        Ok(page)
    }

    fn cursor<'a>(&'a self, pool: &'a BufferPool, tid: TransactionId) -> HeapFileCursor<'a> {
        HeapFileCursor::new(self, pool, tid)
    }
}

impl std::fmt::Debug for HeapFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .finish()
    }
}
