//! Transaction-scoped scan over every record of a heap file.

use super::DbFile;
use crate::buffer::{BufferPool, Permission};
use crate::{Result, StorageError};
use heapdb_core::{PageId, TransactionId, Tuple};
use log::trace;
use std::vec;

enum CursorState {
    Unopened,
    Scanning {
        page_number: u32,
        records: vec::IntoIter<Tuple>,
    },
    Closed,
}

/// Walks the pages of a file in ascending page-number order and the records
/// of each page in slot order.
///
/// The page count is snapshotted by [`open`](Self::open); pages appended
/// afterwards are not visited until the cursor is rewound. Each page is read
/// through the buffer pool under a shared lock when the cursor reaches it.
/// Closing the cursor does not release those locks, they are held until the
/// transaction completes.
pub struct HeapFileCursor<'a> {
    file: &'a dyn DbFile,
    pool: &'a BufferPool,
    tid: TransactionId,
    page_count: u32,
    state: CursorState,
}

impl<'a> HeapFileCursor<'a> {
    pub(crate) fn new(file: &'a dyn DbFile, pool: &'a BufferPool, tid: TransactionId) -> Self {
        Self {
            file,
            pool,
            tid,
            page_count: 0,
            state: CursorState::Unopened,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, CursorState::Scanning { .. })
    }

    /// Positions the cursor before the first record. Opening an open cursor
    /// restarts it.
    pub fn open(&mut self) -> Result<()> {
        self.state = CursorState::Closed;
        self.page_count = self.file.page_count()?;

        let records = if self.page_count == 0 {
            Vec::new().into_iter()
        } else {
            self.load_page(0)?
        };
        self.state = CursorState::Scanning {
            page_number: 0,
            records,
        };
        Ok(())
    }

    fn load_page(&self, page_number: u32) -> Result<vec::IntoIter<Tuple>> {
        let pid = PageId::new(self.file.id(), page_number);
        trace!("{} scanning page {}", self.tid, pid);
        let page = self.pool.get_page(self.tid, pid, Permission::ReadOnly)?;
        let records: Vec<Tuple> = page.read().iter().cloned().collect();
        Ok(records.into_iter())
    }

    /// Whether another record is available. Always `false` on a cursor that
    /// is not open.
    pub fn has_next(&mut self) -> Result<bool> {
        loop {
            let next_page = match &mut self.state {
                CursorState::Unopened | CursorState::Closed => return Ok(false),
                CursorState::Scanning {
                    page_number,
                    records,
                } => {
                    if !records.as_slice().is_empty() {
                        return Ok(true);
                    }
                    if *page_number + 1 >= self.page_count {
                        return Ok(false);
                    }
                    *page_number + 1
                }
            };

            let records = self.load_page(next_page)?;
            self.state = CursorState::Scanning {
                page_number: next_page,
                records,
            };
        }
    }

    /// Returns the next record, or `NoSuchElement` when the cursor is
    /// exhausted or not open.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Tuple> {
        if !self.has_next()? {
            return Err(StorageError::NoSuchElement);
        }
        match &mut self.state {
            CursorState::Scanning { records, .. } => {
                records.next().ok_or(StorageError::NoSuchElement)
            }
            _ => Err(StorageError::NoSuchElement),
        }
    }

    pub fn rewind(&mut self) -> Result<()> {
        self.close();
        self.open()
    }

    pub fn close(&mut self) {
        self.state = CursorState::Closed;
    }

    /// Opens the cursor and adapts it to [`Iterator`]. The first error ends
    /// the iteration after being yielded.
    pub fn records(mut self) -> Records<'a> {
        let pending = self.open().err();
        Records {
            cursor: self,
            pending,
            done: false,
        }
    }
}

impl std::fmt::Debug for HeapFileCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            CursorState::Unopened => "unopened".to_string(),
            CursorState::Scanning { page_number, .. } => format!("scanning page {}", page_number),
            CursorState::Closed => "closed".to_string(),
        };
        f.debug_struct("HeapFileCursor")
            .field("file_id", &self.file.id())
            .field("tid", &self.tid)
            .field("page_count", &self.page_count)
            .field("state", &state)
            .finish()
    }
}

/// Iterator over the records of a heap file; see [`HeapFileCursor::records`].
pub struct Records<'a> {
    cursor: HeapFileCursor<'a>,
    pending: Option<StorageError>,
    done: bool,
}

impl Iterator for Records<'_> {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(err) = self.pending.take() {
            self.done = true;
            return Some(Err(err));
        }
        match self.cursor.has_next() {
            Ok(true) => Some(self.cursor.next()),
            Ok(false) => {
                self.done = true;
                self.cursor.close();
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::file::HeapFile;
    use crate::test_util::init_logging;
    use heapdb_core::{DataType, Schema, Value};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        schema: Arc<Schema>,
        file: Arc<HeapFile>,
        pool: BufferPool,
    }

    fn fixture() -> Fixture {
        init_logging();
        let dir = tempdir().unwrap();
        let config = StorageConfig::default().with_page_size(256);
        let schema = Arc::new(Schema::from_types([DataType::Integer, DataType::Integer]));
        let file = Arc::new(
            HeapFile::open(dir.path().join("c.dat"), Arc::clone(&schema), &config).unwrap(),
        );
        let pool = BufferPool::new(config);
        pool.register(file.clone());
        Fixture {
            _dir: dir,
            schema,
            file,
            pool,
        }
    }

    fn insert_committed(fx: &Fixture, values: impl IntoIterator<Item = i32>) {
        let tid = TransactionId::new();
        for v in values {
            let tuple = Tuple::new(
                Arc::clone(&fx.schema),
                vec![Value::Integer(v), Value::Integer(v * 10)],
            );
            fx.file.insert_tuple(&fx.pool, tid, tuple).unwrap();
        }
        fx.pool.transaction_complete(tid, true).unwrap();
    }

    fn first_column(tuple: &Tuple) -> i32 {
        match tuple.value(0) {
            Some(Value::Integer(v)) => *v,
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn test_unopened_cursor() {
        let fx = fixture();
        insert_committed(&fx, 0..3);

        let mut cursor = fx.file.cursor(&fx.pool, TransactionId::new());
        assert!(!cursor.is_open());
        assert!(!cursor.has_next().unwrap());
        assert!(matches!(cursor.next(), Err(StorageError::NoSuchElement)));
    }

    #[test]
    fn test_empty_file_scan() {
        let fx = fixture();
        let mut cursor = fx.file.cursor(&fx.pool, TransactionId::new());
        cursor.open().unwrap();
        assert!(cursor.is_open());
        assert!(!cursor.has_next().unwrap());
        assert!(matches!(cursor.next(), Err(StorageError::NoSuchElement)));
    }

    #[test]
    fn test_scan_crosses_pages_in_order() {
        let fx = fixture();
        // 256 byte pages hold 31 two-int records
        insert_committed(&fx, 0..100);
        assert_eq!(fx.file.page_count().unwrap(), 4);

        let mut cursor = fx.file.cursor(&fx.pool, TransactionId::new());
        cursor.open().unwrap();
        let mut seen = Vec::new();
        while cursor.has_next().unwrap() {
            let tuple = cursor.next().unwrap();
            assert!(tuple.record_id().is_some());
            seen.push(first_column(&tuple));
        }
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        assert!(matches!(cursor.next(), Err(StorageError::NoSuchElement)));
    }

    #[test]
    fn test_has_next_is_idempotent() {
        let fx = fixture();
        insert_committed(&fx, 0..2);

        let mut cursor = fx.file.cursor(&fx.pool, TransactionId::new());
        cursor.open().unwrap();
        assert!(cursor.has_next().unwrap());
        assert!(cursor.has_next().unwrap());
        assert_eq!(first_column(&cursor.next().unwrap()), 0);
        assert_eq!(first_column(&cursor.next().unwrap()), 1);
        assert!(!cursor.has_next().unwrap());
    }

    #[test]
    fn test_skips_empty_pages() {
        let fx = fixture();
        insert_committed(&fx, 0..62);

        // empty out page 0 entirely
        let tid = TransactionId::new();
        let victims: Vec<Tuple> = fx
            .file
            .cursor(&fx.pool, tid)
            .records()
            .map(Result::unwrap)
            .filter(|t| t.record_id().unwrap().page_id.page_number == 0)
            .collect();
        assert_eq!(victims.len(), 31);
        for t in &victims {
            fx.file.delete_tuple(&fx.pool, tid, t).unwrap();
        }
        fx.pool.transaction_complete(tid, true).unwrap();

        let seen: Vec<i32> = fx
            .file
            .cursor(&fx.pool, TransactionId::new())
            .records()
            .map(|t| first_column(&t.unwrap()))
            .collect();
        assert_eq!(seen, (31..62).collect::<Vec<_>>());
    }

    #[test]
    fn test_rewind_restarts() {
        let fx = fixture();
        insert_committed(&fx, 0..40);

        let mut cursor = fx.file.cursor(&fx.pool, TransactionId::new());
        cursor.open().unwrap();
        for _ in 0..35 {
            cursor.next().unwrap();
        }
        cursor.rewind().unwrap();
        assert_eq!(first_column(&cursor.next().unwrap()), 0);
    }

    #[test]
    fn test_close_stops_iteration() {
        let fx = fixture();
        insert_committed(&fx, 0..5);
        let tid = TransactionId::new();

        let mut cursor = fx.file.cursor(&fx.pool, tid);
        cursor.open().unwrap();
        cursor.next().unwrap();
        cursor.close();
        assert!(!cursor.is_open());
        assert!(!cursor.has_next().unwrap());
        assert!(matches!(cursor.next(), Err(StorageError::NoSuchElement)));

        // locks outlive the cursor
        assert!(fx.pool.holds_lock(tid, PageId::new(fx.file.id(), 0)));

        cursor.open().unwrap();
        assert_eq!(first_column(&cursor.next().unwrap()), 0);
    }

    #[test]
    fn test_page_count_snapshot() {
        let fx = fixture();
        insert_committed(&fx, 0..31);
        let tid = TransactionId::new();

        let mut cursor = fx.file.cursor(&fx.pool, tid);
        cursor.open().unwrap();

        // page 0 is full, so this lands on a new page 1
        let extra = Tuple::new(
            Arc::clone(&fx.schema),
            vec![Value::Integer(99), Value::Integer(990)],
        );
        fx.file.insert_tuple(&fx.pool, tid, extra).unwrap();
        assert_eq!(fx.file.page_count().unwrap(), 2);

        let mut count = 0;
        while cursor.has_next().unwrap() {
            cursor.next().unwrap();
            count += 1;
        }
        assert_eq!(count, 31);

        cursor.rewind().unwrap();
        let mut count = 0;
        while cursor.has_next().unwrap() {
            cursor.next().unwrap();
            count += 1;
        }
        assert_eq!(count, 32);
    }
}
