//! Record locks.
//!
//! Strict two-phase locking over `(page, slot)` keys: a transaction keeps
//! every lock it takes until [`LockTable::release_all`] at commit or abort.
//! Deadlocks are not detected; a request that waits past the timeout fails
//! with [`StorageError::Deadlock`] and the caller is expected to abort.

use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    error::{StorageError, StorageResult},
    PageId, RecordId, Xid,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

type LockKey = (PageId, u16);

fn key(rid: RecordId) -> LockKey {
    (rid.page, rid.slot)
}

#[derive(Debug, Default)]
struct LockState {
    readers: HashSet<Xid>,
    writer: Option<Xid>,
    //  a reader waiting to become the writer; blocks new readers so it can't starve
    upgrade_request: Option<Xid>,
}

impl LockState {
    fn is_free(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none() && self.upgrade_request.is_none()
    }

    fn holds(&self, xid: Xid, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.writer == Some(xid) || self.readers.contains(&xid),
            LockMode::Exclusive => self.writer == Some(xid),
        }
    }

    fn must_wait(&self, xid: Xid, mode: LockMode) -> bool {
        let foreign_writer = self.writer.is_some_and(|w| w != xid);
        match mode {
            LockMode::Shared => {
                foreign_writer || self.upgrade_request.is_some_and(|u| u != xid)
            }
            LockMode::Exclusive => {
                foreign_writer || self.readers.iter().any(|reader| *reader != xid)
            }
        }
    }

    fn grant(&mut self, xid: Xid, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                self.readers.insert(xid);
            }
            LockMode::Exclusive => {
                self.readers.remove(&xid);
                self.writer = Some(xid);
                if self.upgrade_request == Some(xid) {
                    self.upgrade_request = None;
                }
            }
        }
    }

    fn release(&mut self, xid: Xid) {
        self.readers.remove(&xid);
        if self.writer == Some(xid) {
            self.writer = None;
        }
        if self.upgrade_request == Some(xid) {
            self.upgrade_request = None;
        }
    }
}

#[derive(Debug, Default)]
struct Locks {
    states: HashMap<LockKey, LockState>,
    held: HashMap<Xid, HashSet<LockKey>>,
}

/// Lock table shared by all transactions of a store.
#[derive(Debug)]
pub struct LockTable {
    locks: Mutex<Locks>,
    cond_var: Condvar,
    timeout: Duration,
}

impl LockTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(Locks::default()),
            cond_var: Condvar::new(),
            timeout,
        }
    }

    /// Locks `rid` for `xid` in `mode` only if no other transaction is in
    /// the way. Returns whether the lock is held afterwards.
    pub fn try_acquire(&self, xid: Xid, rid: RecordId, mode: LockMode) -> bool {
        let key = key(rid);
        let mut locks = self.locks.lock();
        let state = locks.states.entry(key).or_default();
        if state.holds(xid, mode) {
            return true;
        }
        if state.must_wait(xid, mode) {
            return false;
        }
        state.grant(xid, mode);
        locks.held.entry(xid).or_default().insert(key);
        true
    }

    /// Locks `rid` for `xid` in `mode`, waiting up to the table timeout.
    /// Re-acquiring a held lock is a no-op and a shared holder may upgrade.
    pub fn acquire(&self, xid: Xid, rid: RecordId, mode: LockMode) -> StorageResult<()> {
        let key = key(rid);
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut locks = self.locks.lock();

        let state = locks.states.entry(key).or_default();
        if state.holds(xid, mode) {
            return Ok(());
        }
        let upgrading = mode == LockMode::Exclusive && state.readers.contains(&xid);
        if upgrading {
            match state.upgrade_request {
                //  two readers upgrading would wait on each other forever
                Some(other) if other != xid => {
                    return Err(StorageError::Deadlock {
                        xid,
                        rid,
                        waited: Duration::ZERO,
                    });
                }
                _ => state.upgrade_request = Some(xid),
            }
        }

        loop {
            let state = locks.states.entry(key).or_default();
            if !state.must_wait(xid, mode) {
                state.grant(xid, mode);
                break;
            }
            if self.cond_var.wait_until(&mut locks, deadline).timed_out() {
                let state = locks.states.entry(key).or_default();
                if !state.must_wait(xid, mode) {
                    state.grant(xid, mode);
                    break;
                }
                if upgrading && state.upgrade_request == Some(xid) {
                    state.upgrade_request = None;
                    self.cond_var.notify_all();
                }
                if state.is_free() {
                    locks.states.remove(&key);
                }
                let waited = started.elapsed();
                tracing::debug!(xid, %rid, ?mode, ?waited, "lock wait timed out");
                return Err(StorageError::Deadlock { xid, rid, waited });
            }
        }
        locks.held.entry(xid).or_default().insert(key);
        Ok(())
    }

    /// Releases every lock held by `xid`.
    pub fn release_all(&self, xid: Xid) {
        let mut locks = self.locks.lock();
        let Some(keys) = locks.held.remove(&xid) else {
            return;
        };
        for key in keys {
            if let Some(state) = locks.states.get_mut(&key) {
                state.release(xid);
                if state.is_free() {
                    locks.states.remove(&key);
                }
            }
        }
        self.cond_var.notify_all();
    }

    /// Number of locks `xid` holds.
    pub fn held_by(&self, xid: Xid) -> usize {
        self.locks.lock().held.get(&xid).map_or(0, HashSet::len)
    }
}
