//! Crash recovery and rollback.
//!
//! Recovery runs three passes over the retained log:
//!
//! 1. **Analysis** finds every transaction that has not ended and which of
//!    them still need rolling back.
//! 2. **Redo** replays the entries of those transactions onto pages that do
//!    not reflect them yet, and rebuilds the transaction table.
//! 3. **Undo** rolls back the losers, newest entry first across all of them,
//!    writing a CLR for every undone physical update.
//!
//! Aborting a live transaction runs the same undo pass over its chain alone.

use std::{
    collections::{BTreeSet, BinaryHeap, HashMap},
    time::Instant,
};

use crate::{
    error::{StorageError, StorageResult},
    log::{EntryBody, LogEntry, UndoCursor},
    store::TxStore,
    transaction_table::TransactionState,
    Lsn, Xid, INVALID_XID,
};

/// What recovery did on open.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub entries_scanned: usize,
    pub pages_redone: usize,
    /// Transactions rolled back, in completion order.
    pub rolled_back: Vec<Xid>,
    /// Prepared transactions revived instead of rolled back.
    pub prepared: Vec<Xid>,
    pub max_xid: Option<Xid>,
}

/// Output of the analysis pass.
#[derive(Debug, Default)]
pub(crate) struct Analysis {
    /// Latest LSN of every transaction that has not ended.
    last_lsn: HashMap<Xid, Lsn>,
    /// Latest LSNs of the transactions that did not commit.
    rollback: BTreeSet<Lsn>,
    max_xid: Option<Xid>,
    scanned: usize,
}

impl Analysis {
    fn observe(&mut self, entry: &LogEntry) {
        self.scanned += 1;
        if entry.xid == INVALID_XID {
            return;
        }
        self.max_xid = self.max_xid.max(Some(entry.xid));
        let previous = self.last_lsn.insert(entry.xid, entry.lsn);
        if let Some(previous) = previous {
            self.rollback.remove(&previous);
        }
        match entry.body {
            EntryBody::Commit => {}
            EntryBody::End => {
                self.last_lsn.remove(&entry.xid);
            }
            EntryBody::Internal => {}
            EntryBody::Begin
            | EntryBody::Abort
            | EntryBody::Prepare { .. }
            | EntryBody::Update(_)
            | EntryBody::Clr { .. } => {
                self.rollback.insert(entry.lsn);
            }
        }
    }

    fn is_tracked(&self, xid: Xid) -> bool {
        self.last_lsn.contains_key(&xid)
    }

    /// `(xid, start)` pairs to roll back, newest first.
    fn losers(&self) -> Vec<(Xid, Lsn)> {
        let mut losers: Vec<(Xid, Lsn)> = self
            .last_lsn
            .iter()
            .filter(|(_, lsn)| self.rollback.contains(lsn))
            .map(|(xid, lsn)| (*xid, *lsn))
            .collect();
        losers.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        losers
    }
}

pub(crate) fn analysis(store: &TxStore) -> StorageResult<Analysis> {
    let log = store.log();
    let mut analysis = Analysis::default();
    for entry in log.scan(log.truncation_point()) {
        analysis.observe(&entry?);
    }
    Ok(analysis)
}

/// Replays the tracked transactions' entries. Returns the number of pages
/// changed. Running it again changes nothing.
pub(crate) fn redo(store: &TxStore, analysis: &Analysis) -> StorageResult<usize> {
    let log = store.log();
    let transactions = store.transactions();
    let registry = store.registry();
    let buffers = store.buffers();
    let mut redone = 0;
    for entry in log.scan(log.truncation_point()) {
        let entry = entry?;
        if entry.xid == INVALID_XID || !analysis.is_tracked(entry.xid) {
            continue;
        }
        transactions.roll_forward(entry.xid, entry.lsn)?;
        match &entry.body {
            EntryBody::Update(update) if !update.is_logical() => {
                let pinned = buffers.load_page(update.rid.page)?;
                let mut page = pinned.write();
                if registry.dispatch_redo(&entry, &mut page)? {
                    pinned.mark_dirty(&mut page);
                    redone += 1;
                }
            }
            EntryBody::Clr {
                compensated: Some(update),
                ..
            } if !update.is_logical() => {
                let pinned = buffers.load_page(update.rid.page)?;
                let mut page = pinned.write();
                if registry.dispatch_undo(entry.xid, update, entry.lsn, &mut page)? {
                    pinned.mark_dirty(&mut page);
                    redone += 1;
                }
            }
            EntryBody::Commit => transactions.forget(entry.xid)?,
            _ => {}
        }
    }
    Ok(redone)
}

/// Result of an undo pass.
#[derive(Debug, Default)]
pub(crate) struct UndoOutcome {
    pub(crate) rolled_back: Vec<Xid>,
    pub(crate) prepared: Vec<Xid>,
}

struct PendingUndo {
    cursor: UndoCursor,
    really_aborted: bool,
}

/// Rolls back every `(xid, start)` chain, always undoing the newest pending
/// entry first. A finished chain gets its pages written back and an End
/// entry, and the transaction is forgotten. A prepared transaction that
/// never logged Abort is revived instead.
pub(crate) fn roll_back(store: &TxStore, chains: &[(Xid, Lsn)]) -> StorageResult<UndoOutcome> {
    let log = store.log();
    let transactions = store.transactions();
    let registry = store.registry();
    let buffers = store.buffers();

    let mut heap = BinaryHeap::new();
    let mut pending = HashMap::new();
    for (xid, start) in chains {
        heap.push((*start, *xid));
        pending.insert(
            *xid,
            PendingUndo {
                cursor: UndoCursor::new(*xid, *start),
                really_aborted: false,
            },
        );
    }

    let mut outcome = UndoOutcome::default();
    while let Some((lsn, xid)) = heap.pop() {
        let Some(state) = pending.get_mut(&xid) else {
            return Err(StorageError::internal(format!("undo lost track of xid {xid}")));
        };
        let Some(entry) = state.cursor.step(log)? else {
            return Err(StorageError::internal(format!("undo chain of xid {xid} ended early")));
        };
        debug_assert_eq!(entry.lsn, lsn);

        let mut chain_done = false;
        match &entry.body {
            EntryBody::Update(update) if update.is_logical() => {
                registry.dispatch_logical_undo(store, xid, update)?;
                transactions.append(
                    log,
                    xid,
                    EntryBody::Clr {
                        undo_next: entry.prev_lsn,
                        compensated_lsn: entry.lsn,
                        compensated: None,
                    },
                )?;
            }
            EntryBody::Update(update) => {
                let pinned = buffers.load_page(update.rid.page)?;
                let mut page = pinned.write();
                let clr = transactions.append(
                    log,
                    xid,
                    EntryBody::Clr {
                        undo_next: entry.prev_lsn,
                        compensated_lsn: entry.lsn,
                        compensated: Some(update.clone()),
                    },
                )?;
                registry.dispatch_undo(xid, update, clr.lsn, &mut page)?;
                pinned.mark_dirty(&mut page);
            }
            EntryBody::Clr { .. } => {}
            EntryBody::Abort => state.really_aborted = true,
            EntryBody::Prepare { rec_lsn } => {
                if !state.really_aborted {
                    let prev_lsn = transactions
                        .snapshot(xid)?
                        .prev_lsn
                        .unwrap_or(entry.lsn);
                    transactions.roll_forward_with_rec_lsn(xid, prev_lsn, *rec_lsn)?;
                    tracing::info!(xid, "prepared transaction revived");
                    pending.remove(&xid);
                    outcome.prepared.push(xid);
                    continue;
                }
            }
            EntryBody::Begin => chain_done = true,
            EntryBody::Commit | EntryBody::End | EntryBody::Internal => {
                return Err(StorageError::internal(format!(
                    "found {} at {} while rolling back xid {xid}",
                    entry.body.name(),
                    entry.lsn
                )));
            }
        }

        match state.cursor.peek() {
            Some(next) if !chain_done => heap.push((next, xid)),
            _ => {
                pending.remove(&xid);
                // Redo skips ended transactions, so their pages must be on
                // disk before End is.
                buffers.flush_all()?;
                buffers.page_handle().force()?;
                transactions.append(log, xid, EntryBody::End)?;
                transactions.forget(xid)?;
                tracing::debug!(xid, "transaction rolled back");
                outcome.rolled_back.push(xid);
            }
        }
    }
    Ok(outcome)
}

/// Runs analysis, redo and undo. The transaction table must be empty.
pub(crate) fn recover(store: &TxStore) -> StorageResult<RecoveryReport> {
    let started = Instant::now();
    let analysis = analysis(store)?;
    if let Some(max_xid) = analysis.max_xid {
        store.transactions().set_max_xid(max_xid);
    }
    tracing::debug!(
        entries = analysis.scanned,
        tracked = analysis.last_lsn.len(),
        losers = analysis.rollback.len(),
        "analysis finished"
    );

    let pages_redone = redo(store, &analysis)?;
    tracing::debug!(pages_redone, "redo finished");

    let losers = analysis.losers();
    for (xid, _) in &losers {
        store.transactions().set_state(*xid, TransactionState::Aborting)?;
    }
    let outcome = roll_back(store, &losers)?;

    let report = RecoveryReport {
        entries_scanned: analysis.scanned,
        pages_redone,
        rolled_back: outcome.rolled_back,
        prepared: outcome.prepared,
        max_xid: analysis.max_xid,
    };
    tracing::info!(
        entries = report.entries_scanned,
        pages_redone = report.pages_redone,
        rolled_back = report.rolled_back.len(),
        prepared = report.prepared.len(),
        elapsed = ?started.elapsed(),
        "recovery finished"
    );
    Ok(report)
}

#[cfg(test)]
mod recovery_tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        log::UpdateBody,
        operations::builtin,
        test_utils::{MemoryDisk, VolatileHandle},
        RecordId,
    };

    fn entry(lsn: u64, xid: Xid, body: EntryBody) -> LogEntry {
        let mut entry = LogEntry::new(xid, None, body);
        entry.lsn = Lsn::new(lsn);
        entry
    }

    fn update() -> EntryBody {
        EntryBody::Update(UpdateBody::new(builtin::SET, RecordId::new(1, 0, 1), vec![1, 0]))
    }

    fn read_i32(store: &TxStore, rid: RecordId) -> i32 {
        let xid = store.begin().unwrap();
        let mut buf = [0u8; 4];
        store.read(xid, rid, &mut buf).unwrap();
        store.commit(xid).unwrap();
        i32::from_be_bytes(buf)
    }

    fn committed_record(store: &TxStore, value: i32) -> RecordId {
        let xid = store.begin().unwrap();
        let rid = store.alloc(xid, 4).unwrap();
        store.set(xid, rid, &value.to_be_bytes()).unwrap();
        store.commit(xid).unwrap();
        rid
    }

    /// Compensated LSNs of every CLR in the log, in log order.
    fn compensated_lsns(store: &TxStore) -> Vec<(Xid, Lsn)> {
        let log = store.log();
        log.scan(log.truncation_point())
            .map(|entry| entry.unwrap())
            .filter_map(|entry| match entry.body {
                EntryBody::Clr { compensated_lsn, .. } => Some((entry.xid, compensated_lsn)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn analysis_tracks_latest_lsn_per_transaction() {
        let mut analysis = Analysis::default();
        for e in [
            entry(10, 1, EntryBody::Begin),
            entry(20, 2, EntryBody::Begin),
            entry(30, 1, update()),
            entry(40, 2, update()),
            entry(50, 1, EntryBody::Commit),
            entry(60, 3, EntryBody::Begin),
            entry(70, 3, EntryBody::Abort),
            entry(80, 3, EntryBody::End),
            entry(90, INVALID_XID, EntryBody::Internal),
        ] {
            analysis.observe(&e);
        }

        assert!(analysis.is_tracked(1), "committed transactions are redone");
        assert!(analysis.is_tracked(2));
        assert!(!analysis.is_tracked(3), "ended transactions are skipped");
        assert_eq!(analysis.losers(), vec![(2, Lsn::new(40))]);
        assert_eq!(analysis.max_xid, Some(3));
        assert_eq!(analysis.scanned, 9);
    }

    #[test]
    fn redo_twice_matches_redo_once() {
        let disk = MemoryDisk::new();
        let store = TxStore::open(disk.config()).unwrap();
        let xid = store.begin().unwrap();
        let rid = store.alloc(xid, 4).unwrap();
        store.set(xid, rid, &7i32.to_be_bytes()).unwrap();
        store.increment(xid, rid).unwrap();
        store.commit(xid).unwrap();
        store.simulate_crash();

        // Recovery already redid everything on open; a second pass finds
        // every page up to date.
        let store = TxStore::open(disk.config()).unwrap();
        let page_bytes = |store: &TxStore| {
            let pinned = store.buffers().load_page(rid.page).unwrap();
            let bytes = pinned.read().bytes().to_vec();
            bytes
        };
        let once = page_bytes(&store);
        let analysis = analysis(&store).unwrap();
        assert_eq!(redo(&store, &analysis).unwrap(), 0);
        assert_eq!(page_bytes(&store), once);

        let mut buf = [0u8; 4];
        let reader = store.begin().unwrap();
        store.read(reader, rid, &mut buf).unwrap();
        assert_eq!(i32::from_be_bytes(buf), 8);
    }

    #[test]
    fn losers_are_undone_newest_first_across_transactions() {
        let disk = MemoryDisk::new();
        let store = TxStore::open(disk.config()).unwrap();
        let first = committed_record(&store, 0);
        let second = committed_record(&store, 0);

        let x1 = store.begin().unwrap();
        let x2 = store.begin().unwrap();
        let mut updates = Vec::new();
        for (xid, rid, value) in [(x1, first, 1), (x2, second, 2), (x1, first, 3), (x2, second, 4)] {
            store.set(xid, rid, &i32::to_be_bytes(value)).unwrap();
            updates.push((xid, store.transactions().snapshot(xid).unwrap().prev_lsn.unwrap()));
        }
        store.log().force_all().unwrap();
        store.simulate_crash();

        let store = TxStore::open(disk.config()).unwrap();
        let mut rolled_back = store.recovery_report().rolled_back;
        rolled_back.sort_unstable();
        assert_eq!(rolled_back, vec![x1, x2]);

        updates.sort_by(|a, b| b.1.cmp(&a.1));
        let clrs: Vec<_> = compensated_lsns(&store)
            .into_iter()
            .filter(|(xid, _)| *xid == x1 || *xid == x2)
            .collect();
        assert_eq!(clrs, updates);
        assert_eq!(read_i32(&store, first), 0);
        assert_eq!(read_i32(&store, second), 0);
    }

    #[test]
    fn crash_during_rollback_resumes_after_the_last_clr() {
        let disk = MemoryDisk::new();
        let store = TxStore::open(disk.config()).unwrap();
        let rid = committed_record(&store, 5);

        let loser = store.begin().unwrap();
        let second = store.alloc(loser, 4).unwrap();
        store.set(loser, rid, &10i32.to_be_bytes()).unwrap();
        let update_lsn = store.transactions().snapshot(loser).unwrap().prev_lsn.unwrap();

        // Undo the newest update by hand, as an abort would, then crash
        // before the rest of the chain is undone.
        let entry = store.log().read_entry(update_lsn).unwrap();
        let EntryBody::Update(update) = &entry.body else {
            panic!("expected an update at {update_lsn}, found {}", entry.body.name());
        };
        store.transactions().set_state(loser, TransactionState::Aborting).unwrap();
        store.transactions().append(store.log(), loser, EntryBody::Abort).unwrap();
        {
            let pinned = store.buffers().load_page(rid.page).unwrap();
            let mut page = pinned.write();
            let clr = store
                .transactions()
                .append(
                    store.log(),
                    loser,
                    EntryBody::Clr {
                        undo_next: entry.prev_lsn,
                        compensated_lsn: entry.lsn,
                        compensated: Some(update.clone()),
                    },
                )
                .unwrap();
            store.registry().dispatch_undo(loser, update, clr.lsn, &mut page).unwrap();
            pinned.mark_dirty(&mut page);
        }
        store.log().force_all().unwrap();
        store.simulate_crash();

        let store = TxStore::open(disk.config()).unwrap();
        let report = store.recovery_report();
        assert_eq!(report.rolled_back, vec![loser]);
        assert!(report.pages_redone >= 1);
        assert_eq!(read_i32(&store, rid), 5);

        let clrs: Vec<_> = compensated_lsns(&store)
            .into_iter()
            .filter(|(xid, _)| *xid == loser)
            .collect();
        assert_eq!(clrs.iter().filter(|(_, lsn)| *lsn == update_lsn).count(), 1);
        // Only the allocation was left to undo.
        assert_eq!(clrs.len(), 2);
        let reader = store.begin().unwrap();
        assert!(!store.record_exists(reader, second).unwrap());
    }

    #[test]
    fn rolled_back_pages_are_forced_before_end() {
        let disk = MemoryDisk::new();
        let pages = VolatileHandle::new();
        let store = TxStore::open(disk.config_with_pages(Arc::new(pages.clone()))).unwrap();
        let rid = committed_record(&store, 5);

        let loser = store.begin().unwrap();
        store.set(loser, rid, &10i32.to_be_bytes()).unwrap();
        // The uncommitted value reaches stable storage.
        store.buffers().flush_all().unwrap();
        store.buffers().page_handle().force().unwrap();
        store.abort(loser).unwrap();

        // A later commit makes the loser's End durable.
        let later = store.begin().unwrap();
        store.commit(later).unwrap();
        store.simulate_crash();
        pages.power_loss();

        let store = TxStore::open(disk.config_with_pages(Arc::new(pages))).unwrap();
        assert!(store.recovery_report().rolled_back.is_empty());
        assert_eq!(read_i32(&store, rid), 5);
    }
}
