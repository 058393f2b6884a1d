//! Page-granular shared/exclusive locks held by transactions.
//!
//! Locks are only ever granted, never queued: a blocked requester sleeps on
//! the condition variable and re-checks after every release. A request that
//! is still blocked when its timeout expires aborts the requesting
//! transaction; this is the only deadlock resolution there is.

use super::Permission;
use crate::{Result, StorageError};
use heapdb_core::{PageId, TransactionId};
use log::warn;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct PageLock {
    shared: HashSet<TransactionId>,
    exclusive: Option<TransactionId>,
}

impl PageLock {
    fn try_grant(&mut self, tid: TransactionId, perm: Permission) -> bool {
        if let Some(holder) = self.exclusive {
            return holder == tid;
        }
        match perm {
            Permission::ReadOnly => {
                self.shared.insert(tid);
                true
            }
            // Upgrade is allowed when the requester is the only reader.
            Permission::ReadWrite => {
                if self.shared.iter().any(|holder| *holder != tid) {
                    return false;
                }
                self.shared.clear();
                self.exclusive = Some(tid);
                true
            }
        }
    }

    fn release(&mut self, tid: TransactionId) {
        self.shared.remove(&tid);
        if self.exclusive == Some(tid) {
            self.exclusive = None;
        }
    }

    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }

    fn held_by(&self, tid: TransactionId) -> bool {
        self.exclusive == Some(tid) || self.shared.contains(&tid)
    }
}

#[derive(Debug, Default)]
pub(crate) struct LockManager {
    table: Mutex<HashMap<PageId, PageLock>>,
    released: Condvar,
}

impl LockManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Blocks until `tid` holds `perm` on `pid`, or fails with
    /// `TransactionAborted` once `timeout` has elapsed.
    pub(crate) fn acquire(
        &self,
        tid: TransactionId,
        pid: PageId,
        perm: Permission,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut table = self.table.lock();
        loop {
            if table.entry(pid).or_default().try_grant(tid, perm) {
                return Ok(());
            }
            if self.released.wait_until(&mut table, deadline).timed_out() {
                if table.entry(pid).or_default().try_grant(tid, perm) {
                    return Ok(());
                }
                warn!(
                    "{} timed out after {:?} waiting for {:?} lock on page {}",
                    tid, timeout, perm, pid
                );
                return Err(StorageError::TransactionAborted { tid, page: pid });
            }
        }
    }

    pub(crate) fn release(&self, tid: TransactionId, pid: PageId) {
        let mut table = self.table.lock();
        if let Some(lock) = table.get_mut(&pid) {
            lock.release(tid);
            if lock.is_free() {
                table.remove(&pid);
            }
        }
        drop(table);
        self.released.notify_all();
    }

    pub(crate) fn release_all(&self, tid: TransactionId) {
        let mut table = self.table.lock();
        table.retain(|_, lock| {
            lock.release(tid);
            !lock.is_free()
        });
        drop(table);
        self.released.notify_all();
    }

    pub(crate) fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        self.table
            .lock()
            .get(&pid)
            .is_some_and(|lock| lock.held_by(tid))
    }
}
