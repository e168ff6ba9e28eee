//! Transaction table.
//!
//! A fixed array of slots, each behind its own mutex. A transaction lives in
//! slot `xid % MAX_TRANSACTIONS`; `begin` advances the xid counter until it
//! lands on a free slot. Appending a log entry for a transaction happens under
//! its slot mutex so `prev_lsn` chains are never interleaved.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    error::{StorageError, StorageResult},
    log::{EntryBody, LogEntry, LogManager},
    Lsn, Xid, INVALID_XID,
};

pub const MAX_TRANSACTIONS: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    /// Prepared: survives crashes until it commits or aborts.
    Prepared,
    /// Rolling back.
    Aborting,
}

/// Copy of one transaction's table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionSnapshot {
    pub xid: Xid,
    pub prev_lsn: Option<Lsn>,
    pub rec_lsn: Option<Lsn>,
    pub state: TransactionState,
}

#[derive(Debug)]
struct Slot {
    xid: Xid,
    prev_lsn: Option<Lsn>,
    rec_lsn: Option<Lsn>,
    state: TransactionState,
}

impl Slot {
    fn free() -> Self {
        Self {
            xid: INVALID_XID,
            prev_lsn: None,
            rec_lsn: None,
            state: TransactionState::Active,
        }
    }

    fn is_free(&self) -> bool {
        self.xid == INVALID_XID
    }

    fn occupy(&mut self, xid: Xid) {
        *self = Slot {
            xid,
            ..Slot::free()
        };
    }

    fn snapshot(&self) -> TransactionSnapshot {
        TransactionSnapshot {
            xid: self.xid,
            prev_lsn: self.prev_lsn,
            rec_lsn: self.rec_lsn,
            state: self.state,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TransactionTable {
    slots: Vec<Mutex<Slot>>,
    next_xid: Mutex<Xid>,
    active: Arc<AtomicUsize>,
}

fn slot_index(xid: Xid) -> StorageResult<usize> {
    if xid < 0 {
        return Err(StorageError::InvalidTransaction { xid });
    }
    Ok(xid as usize % MAX_TRANSACTIONS)
}

impl TransactionTable {
    /// Creates an empty table. `active` is shared with group commit.
    pub(crate) fn new(active: Arc<AtomicUsize>) -> Self {
        active.store(0, Ordering::Release);
        Self {
            slots: (0..MAX_TRANSACTIONS).map(|_| Mutex::new(Slot::free())).collect(),
            next_xid: Mutex::new(0),
            active,
        }
    }

    /// Allocates a slot and returns the new transaction's xid.
    pub(crate) fn begin(&self) -> StorageResult<Xid> {
        let mut next = self.next_xid.lock();
        if self.active_count() >= MAX_TRANSACTIONS {
            return Err(StorageError::TooManyTransactions {
                limit: MAX_TRANSACTIONS,
            });
        }
        for _ in 0..MAX_TRANSACTIONS {
            let xid = *next;
            *next = next.checked_add(1).unwrap_or(0);
            let mut slot = self.slots[xid as usize % MAX_TRANSACTIONS].lock();
            if slot.is_free() {
                slot.occupy(xid);
                self.active.fetch_add(1, Ordering::AcqRel);
                return Ok(xid);
            }
        }
        Err(StorageError::TooManyTransactions {
            limit: MAX_TRANSACTIONS,
        })
    }

    fn with_slot<T>(&self, xid: Xid, f: impl FnOnce(&mut Slot) -> StorageResult<T>) -> StorageResult<T> {
        let mut slot = self.slots[slot_index(xid)?].lock();
        if slot.xid != xid {
            return Err(StorageError::InvalidTransaction { xid });
        }
        f(&mut slot)
    }

    /// Appends an entry with `body` for `xid`, chaining it to the
    /// transaction's previous entry.
    pub(crate) fn append(&self, log: &LogManager, xid: Xid, body: EntryBody) -> StorageResult<LogEntry> {
        self.append_with(log, xid, |_| Ok(body))
    }

    /// Like [`TransactionTable::append`], but builds the body from the
    /// transaction's state while its slot is locked.
    pub(crate) fn append_with(
        &self,
        log: &LogManager,
        xid: Xid,
        body: impl FnOnce(&TransactionSnapshot) -> StorageResult<EntryBody>,
    ) -> StorageResult<LogEntry> {
        self.with_slot(xid, |slot| {
            let body = body(&slot.snapshot())?;
            let mut entry = LogEntry::new(xid, slot.prev_lsn, body);
            let lsn = log.append(&mut entry)?;
            slot.prev_lsn = Some(lsn);
            slot.rec_lsn.get_or_insert(lsn);
            Ok(entry)
        })
    }

    /// Replays `lsn` into the table during recovery, creating the entry if
    /// needed.
    pub(crate) fn roll_forward(&self, xid: Xid, lsn: Lsn) -> StorageResult<()> {
        let mut slot = self.slots[slot_index(xid)?].lock();
        if slot.is_free() {
            slot.occupy(xid);
            self.active.fetch_add(1, Ordering::AcqRel);
        } else if slot.xid != xid {
            return Err(StorageError::internal(format!(
                "recovery found xid {xid} while slot is held by xid {}",
                slot.xid
            )));
        }
        slot.prev_lsn = Some(lsn);
        slot.rec_lsn.get_or_insert(lsn);
        Ok(())
    }

    /// Revives a prepared transaction with its recorded recLSN.
    pub(crate) fn roll_forward_with_rec_lsn(&self, xid: Xid, prev_lsn: Lsn, rec_lsn: Lsn) -> StorageResult<()> {
        self.roll_forward(xid, prev_lsn)?;
        self.with_slot(xid, |slot| {
            slot.prev_lsn = Some(prev_lsn);
            slot.rec_lsn = Some(rec_lsn);
            slot.state = TransactionState::Prepared;
            Ok(())
        })
    }

    pub(crate) fn set_state(&self, xid: Xid, state: TransactionState) -> StorageResult<()> {
        self.with_slot(xid, |slot| {
            slot.state = state;
            Ok(())
        })
    }

    /// Releases the transaction's slot.
    pub(crate) fn forget(&self, xid: Xid) -> StorageResult<()> {
        self.with_slot(xid, |slot| {
            *slot = Slot::free();
            Ok(())
        })?;
        self.active.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn is_active(&self, xid: Xid) -> bool {
        self.with_slot(xid, |_| Ok(())).is_ok()
    }

    pub(crate) fn snapshot(&self, xid: Xid) -> StorageResult<TransactionSnapshot> {
        self.with_slot(xid, |slot| Ok(slot.snapshot()))
    }

    /// Smallest recLSN of any transaction.
    pub(crate) fn min_rec_lsn(&self) -> Option<Lsn> {
        self.slots.iter().filter_map(|slot| slot.lock().rec_lsn).min()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn active_xids(&self) -> Vec<Xid> {
        let mut xids: Vec<Xid> = self
            .slots
            .iter()
            .filter_map(|slot| {
                let slot = slot.lock();
                (!slot.is_free()).then_some(slot.xid)
            })
            .collect();
        xids.sort_unstable();
        xids
    }

    /// Makes sure future xids are above `max_xid`.
    pub(crate) fn set_max_xid(&self, max_xid: Xid) {
        let mut next = self.next_xid.lock();
        if max_xid >= *next {
            *next = max_xid.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod transaction_table_tests {
    use super::*;
    use crate::log::{LogOptions, MemoryLogStorage, SharedMemoryLog};

    fn table() -> (TransactionTable, LogManager) {
        let log = LogManager::open(
            Box::new(MemoryLogStorage::open(SharedMemoryLog::new())),
            LogOptions::default(),
        )
        .unwrap();
        (TransactionTable::new(Arc::new(AtomicUsize::new(0))), log)
    }

    #[test]
    fn append_chains_prev_lsn_and_sets_rec_lsn_once() {
        let (table, log) = table();
        let xid = table.begin().unwrap();
        let first = table.append(&log, xid, EntryBody::Begin).unwrap();
        let second = table.append(&log, xid, EntryBody::Abort).unwrap();

        assert_eq!(first.prev_lsn, None);
        assert_eq!(second.prev_lsn, Some(first.lsn));
        let snapshot = table.snapshot(xid).unwrap();
        assert_eq!(snapshot.prev_lsn, Some(second.lsn));
        assert_eq!(snapshot.rec_lsn, Some(first.lsn));
        assert_eq!(table.min_rec_lsn(), Some(first.lsn));
    }

    #[test]
    fn unknown_xids_are_rejected() {
        let (table, log) = table();
        assert!(matches!(
            table.append(&log, 17, EntryBody::Commit),
            Err(StorageError::InvalidTransaction { xid: 17 })
        ));
        assert!(table.forget(-3).is_err());
        let xid = table.begin().unwrap();
        table.forget(xid).unwrap();
        assert!(!table.is_active(xid));
        assert_eq!(table.active_count(), 0);
    }

    #[test]
    fn table_fills_up() {
        let (table, _log) = table();
        let xids: Vec<Xid> = (0..MAX_TRANSACTIONS).map(|_| table.begin().unwrap()).collect();
        assert!(matches!(
            table.begin(),
            Err(StorageError::TooManyTransactions { .. })
        ));
        table.forget(xids[10]).unwrap();
        let reused = table.begin().unwrap();
        assert_eq!(reused as usize % MAX_TRANSACTIONS, 10);
        assert_eq!(table.active_count(), MAX_TRANSACTIONS);
    }

    #[test]
    fn recovery_helpers_rebuild_entries() {
        let (table, _log) = table();
        table.set_max_xid(41);
        table.roll_forward(7, Lsn::new(10)).unwrap();
        table.roll_forward(7, Lsn::new(30)).unwrap();
        table
            .roll_forward_with_rec_lsn(9, Lsn::new(50), Lsn::new(5))
            .unwrap();

        let seven = table.snapshot(7).unwrap();
        assert_eq!((seven.prev_lsn, seven.rec_lsn), (Some(Lsn::new(30)), Some(Lsn::new(10))));
        assert_eq!(table.snapshot(9).unwrap().state, TransactionState::Prepared);
        assert_eq!(table.active_xids(), vec![7, 9]);
        assert_eq!(table.min_rec_lsn(), Some(Lsn::new(5)));
        assert_eq!(table.begin().unwrap(), 42);
    }
}
