//! Write-ahead log.
//!
//! Entries are appended to an in-memory tail buffer under the tail mutex and
//! become durable when a force moves the buffer to the storage backend and
//! syncs it. LSNs are byte offsets, so the LSN of an entry is known as soon as
//! it is placed in the tail and every entry stays readable, from the tail or
//! from storage, until it is truncated.
//!
//! Lock order is storage, then tail. `append` only takes the tail lock.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    error::{StorageError, StorageResult},
    Lsn,
};

mod cursor;
mod entry;
mod file;
mod group_commit;
mod memory;
mod storage;

pub use cursor::{ForwardScan, UndoCursor};
pub use entry::{EntryBody, LogEntry, PreImage, UpdateBody, FRAME_HEADER_LEN};
pub use file::FileLogStorage;
pub use memory::{MemoryLogStorage, SharedMemoryLog};
pub use storage::LogStorage;

use entry::{parse_frame, FrameRead};
use group_commit::GroupCommit;

/// How a force should be scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForceMode {
    /// Commit forces go through group commit.
    Commit,
    /// Forces issued before writing back a page run immediately.
    WriteBack,
}

/// Tunables for a [`LogManager`].
#[derive(Clone, Debug)]
pub struct LogOptions {
    /// Tail bytes buffered before they are handed to storage unsynced.
    pub buffer_capacity: usize,
    pub group_commit_window: Duration,
    /// Number of active transactions, read by group commit.
    pub active_transactions: Arc<AtomicUsize>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024 * 1024,
            group_commit_window: Duration::from_millis(10),
            active_transactions: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct LogTail {
    /// LSN of `buf[0]`.
    start: Lsn,
    /// LSN the next appended entry receives.
    next: Lsn,
    buf: Vec<u8>,
}

pub struct LogManager {
    storage: Mutex<Box<dyn LogStorage>>,
    tail: Mutex<LogTail>,
    /// First LSN that is not durable.
    flushed: AtomicU64,
    truncation_point: AtomicU64,
    forces: AtomicU64,
    group: GroupCommit,
    buffer_capacity: usize,
    read_only: bool,
}

impl fmt::Debug for LogManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogManager")
            .field("truncation_point", &self.truncation_point())
            .field("flushed_lsn", &self.flushed_lsn())
            .field("next_lsn", &self.next_lsn())
            .finish()
    }
}

impl LogManager {
    /// Opens the log over `storage`, cutting off a torn tail.
    pub fn open(mut storage: Box<dyn LogStorage>, options: LogOptions) -> StorageResult<Self> {
        let end = storage::repair_tail(storage.as_mut())?;
        tracing::info!(truncation_point = %storage.base_lsn(), next_lsn = %end, "log opened");
        Ok(Self::with_end(storage, end, options, false))
    }

    /// Opens the log for inspection. A torn tail stays where it is and only
    /// the intact entries before it are visible. Appends and truncation
    /// fail.
    pub fn open_read_only(storage: Box<dyn LogStorage>) -> StorageResult<Self> {
        let (end, damage) = storage::valid_end(storage.as_ref())?;
        if let Some(reason) = damage {
            tracing::warn!(
                %end,
                ignored = storage.end_lsn().distance_from(end),
                reason,
                "log has a torn tail"
            );
        }
        Ok(Self::with_end(storage, end, LogOptions::default(), true))
    }

    fn with_end(storage: Box<dyn LogStorage>, end: Lsn, options: LogOptions, read_only: bool) -> Self {
        let base = storage.base_lsn();
        Self {
            storage: Mutex::new(storage),
            tail: Mutex::new(LogTail {
                start: end,
                next: end,
                buf: Vec::new(),
            }),
            flushed: AtomicU64::new(end.get()),
            truncation_point: AtomicU64::new(base.get()),
            forces: AtomicU64::new(0),
            group: GroupCommit::new(options.group_commit_window, options.active_transactions),
            buffer_capacity: options.buffer_capacity,
            read_only,
        }
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::internal("log is open read-only"));
        }
        Ok(())
    }

    /// Appends `entry`, assigning and returning its LSN.
    pub fn append(&self, entry: &mut LogEntry) -> StorageResult<Lsn> {
        self.check_writable()?;
        let (lsn, overflow) = {
            let mut tail = self.tail.lock();
            entry.lsn = tail.next;
            let frame = entry.encode_frame();
            tail.buf.extend_from_slice(&frame);
            tail.next = tail.next.advance(frame.len() as u64);
            (entry.lsn, tail.buf.len() > self.buffer_capacity)
        };
        tracing::trace!(%lsn, xid = entry.xid, kind = entry.body.name(), "log append");
        if overflow {
            self.write_tail(false)?;
        }
        Ok(lsn)
    }

    /// Moves the tail buffer to storage and optionally syncs it.
    fn write_tail(&self, sync: bool) -> StorageResult<()> {
        let mut storage = self.storage.lock();
        let bytes = {
            let mut tail = self.tail.lock();
            tail.start = tail.next;
            std::mem::take(&mut tail.buf)
        };
        if !bytes.is_empty() {
            storage.append(&bytes)?;
        }
        if sync {
            storage.sync()?;
            self.forces.fetch_add(1, Ordering::Relaxed);
            self.flushed
                .fetch_max(storage.end_lsn().get(), Ordering::AcqRel);
        }
        Ok(())
    }

    fn force_tail(&self, lsn: Lsn) -> StorageResult<()> {
        if self.is_durable(lsn) {
            return Ok(());
        }
        self.write_tail(true)
    }

    /// Blocks until every entry up to and including `lsn` is durable.
    pub fn force(&self, lsn: Lsn, mode: ForceMode) -> StorageResult<()> {
        match mode {
            ForceMode::WriteBack => self.force_tail(lsn),
            ForceMode::Commit => self.group.force(
                lsn,
                |lsn| self.is_durable(lsn),
                || self.force_tail(lsn),
            ),
        }
    }

    /// Forces every appended entry.
    pub fn force_all(&self) -> StorageResult<()> {
        let last = self.next_lsn();
        if last.get() > self.flushed.load(Ordering::Acquire) {
            self.write_tail(true)?;
        }
        Ok(())
    }

    pub fn is_durable(&self, lsn: Lsn) -> bool {
        lsn.get() < self.flushed.load(Ordering::Acquire)
    }

    /// The first LSN that is not durable.
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn::new(self.flushed.load(Ordering::Acquire))
    }

    /// LSN the next appended entry will receive.
    pub fn next_lsn(&self) -> Lsn {
        self.tail.lock().next
    }

    /// Lowest LSN still retained.
    pub fn truncation_point(&self) -> Lsn {
        Lsn::new(self.truncation_point.load(Ordering::Acquire))
    }

    /// Number of syncs issued so far.
    pub fn force_count(&self) -> u64 {
        self.forces.load(Ordering::Relaxed)
    }

    /// Reads the entry at `lsn`.
    pub fn read_entry(&self, lsn: Lsn) -> StorageResult<LogEntry> {
        if lsn < self.truncation_point() {
            return Err(StorageError::log_corrupted(
                lsn,
                format!("entry was truncated (truncation point {})", self.truncation_point()),
            ));
        }
        {
            let tail = self.tail.lock();
            if lsn >= tail.start {
                if lsn >= tail.next {
                    return Err(StorageError::log_corrupted(lsn, "no entry at or after the end of the log"));
                }
                let offset = lsn.distance_from(tail.start) as usize;
                return Self::decode(&tail.buf[offset..], lsn);
            }
        }

        let storage = self.storage.lock();
        let mut header = [0u8; FRAME_HEADER_LEN];
        if storage.read_at(lsn, &mut header)? < FRAME_HEADER_LEN {
            return Err(StorageError::log_corrupted(lsn, "frame header is truncated"));
        }
        let payload_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let mut frame = vec![0u8; FRAME_HEADER_LEN + payload_len.min(entry::MAX_PAYLOAD_LEN)];
        let read = storage.read_at(lsn, &mut frame)?;
        frame.truncate(read);
        Self::decode(&frame, lsn)
    }

    fn decode(buf: &[u8], lsn: Lsn) -> StorageResult<LogEntry> {
        match parse_frame(buf, lsn)? {
            FrameRead::Entry(entry) => Ok(entry),
            FrameRead::Incomplete => Err(StorageError::log_corrupted(lsn, "frame is truncated")),
            FrameRead::Damaged(reason) => Err(StorageError::log_corrupted(lsn, reason)),
        }
    }

    /// Iterates over the entries from `from` to the current end of the log.
    pub fn scan(&self, from: Lsn) -> ForwardScan<'_> {
        ForwardScan::new(self, from)
    }

    /// Drops every entry before `lsn`. The new truncation point never passes
    /// the flushed LSN. Returns the truncation point after the call.
    ///
    /// Holds the storage lock for the whole backend truncation, so forces
    /// and tail overflows wait for it.
    pub fn truncate(&self, lsn: Lsn) -> StorageResult<Lsn> {
        self.check_writable()?;
        let mut storage = self.storage.lock();
        let target = lsn.min(self.flushed_lsn());
        let current = self.truncation_point();
        if target <= current {
            return Ok(current);
        }
        storage.truncate(target)?;
        self.truncation_point.store(target.get(), Ordering::Release);
        tracing::debug!(from = %current, to = %target, "log truncated");
        Ok(target)
    }

    /// Drops the unforced tail without writing it, as a crash would.
    pub(crate) fn discard_tail(&self) {
        let mut tail = self.tail.lock();
        let dropped = tail.buf.len();
        tail.buf.clear();
        tail.next = tail.start;
        if dropped > 0 {
            tracing::warn!(bytes = dropped, "discarded unforced log tail");
        }
    }

    /// Forces everything and closes the backend.
    pub fn close(&self) -> StorageResult<()> {
        self.force_all()?;
        self.storage.lock().close()
    }
}

#[cfg(test)]
mod log_manager_tests {
    use super::*;
    use crate::{RecordId, INVALID_XID};
    use std::{fs::OpenOptions, io::Write};
    use tempfile::TempDir;

    fn update(xid: i32, prev: Option<Lsn>, byte: u8) -> LogEntry {
        LogEntry::new(
            xid,
            prev,
            EntryBody::Update(UpdateBody::new(0, RecordId::new(1, 0, 1), vec![byte])),
        )
    }

    fn memory_log(shared: &SharedMemoryLog) -> LogManager {
        LogManager::open(
            Box::new(MemoryLogStorage::open(shared.clone())),
            LogOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn lsns_are_byte_offsets() {
        let log = memory_log(&SharedMemoryLog::new());
        let mut first = LogEntry::new(1, None, EntryBody::Begin);
        let a = log.append(&mut first).unwrap();
        let mut second = update(1, Some(a), 7);
        let b = log.append(&mut second).unwrap();

        assert_eq!(a, Lsn::FIRST);
        assert_eq!(b, first.next_lsn());
        assert_eq!(log.next_lsn(), second.next_lsn());
        assert_eq!(log.read_entry(b).unwrap(), second);
    }

    #[test]
    fn force_makes_entries_durable() {
        let log = memory_log(&SharedMemoryLog::new());
        let mut entry = update(2, None, 1);
        let lsn = log.append(&mut entry).unwrap();
        assert!(!log.is_durable(lsn));
        log.force(lsn, ForceMode::WriteBack).unwrap();
        assert!(log.is_durable(lsn));
        assert_eq!(log.flushed_lsn(), entry.next_lsn());
        // Still readable from storage.
        assert_eq!(log.read_entry(lsn).unwrap(), entry);
    }

    #[test]
    fn overflowing_tail_is_written_but_not_synced() {
        let shared = SharedMemoryLog::new();
        let log = LogManager::open(
            Box::new(MemoryLogStorage::open(shared.clone())),
            LogOptions {
                buffer_capacity: 16,
                ..LogOptions::default()
            },
        )
        .unwrap();
        let mut entry = update(3, None, 9);
        let lsn = log.append(&mut entry).unwrap();
        assert!(!log.is_durable(lsn));
        assert_eq!(shared.durable_len(), 0);
        assert_eq!(log.read_entry(lsn).unwrap(), entry);
        drop(log);

        // Unsynced bytes do not survive.
        let reopened = memory_log(&shared);
        assert_eq!(reopened.next_lsn(), Lsn::FIRST);
    }

    #[test]
    fn scan_visits_entries_in_order() {
        let log = memory_log(&SharedMemoryLog::new());
        let mut lsns = Vec::new();
        for i in 0..5u8 {
            let mut entry = update(1, lsns.last().copied(), i);
            lsns.push(log.append(&mut entry).unwrap());
        }
        log.force(lsns[2], ForceMode::Commit).unwrap();

        let scanned: Vec<Lsn> = log.scan(Lsn::FIRST).map(|e| e.unwrap().lsn).collect();
        assert_eq!(scanned, lsns);
    }

    #[test]
    fn truncation_stops_at_flushed_lsn() {
        let log = memory_log(&SharedMemoryLog::new());
        let mut lsns = Vec::new();
        for i in 0..4u8 {
            let mut entry = update(1, None, i);
            lsns.push(log.append(&mut entry).unwrap());
        }
        log.force(lsns[1], ForceMode::WriteBack).unwrap();
        let mut late = LogEntry::new(INVALID_XID, None, EntryBody::Internal);
        log.append(&mut late).unwrap();

        let point = log.truncate(Lsn::MAX).unwrap();
        assert_eq!(point, log.flushed_lsn());
        assert!(point <= late.lsn);
        assert!(log.read_entry(lsns[0]).is_err());
        assert_eq!(log.read_entry(late.lsn).unwrap(), late);
        assert_eq!(log.truncate(lsns[0]).unwrap(), point);
    }

    #[test]
    fn torn_file_tail_is_cut_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("txstore.log");
        let kept = {
            let log = LogManager::open(
                Box::new(FileLogStorage::open(&path).unwrap()),
                LogOptions::default(),
            )
            .unwrap();
            let mut entry = update(1, None, 1);
            let lsn = log.append(&mut entry).unwrap();
            log.close().unwrap();
            lsn
        };
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            let mut torn = update(1, Some(kept), 2);
            torn.lsn = Lsn::new(999);
            let frame = torn.encode_frame();
            file.write_all(&frame[..frame.len() / 2]).unwrap();
        }

        let log = LogManager::open(
            Box::new(FileLogStorage::open(&path).unwrap()),
            LogOptions::default(),
        )
        .unwrap();
        let entries: Vec<LogEntry> = log.scan(log.truncation_point()).map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].lsn, kept);

        let mut next = update(1, Some(kept), 3);
        let lsn = log.append(&mut next).unwrap();
        assert_eq!(lsn, entries[0].next_lsn());
    }

    #[test]
    fn checksum_failure_at_tail_is_cut() {
        let shared = SharedMemoryLog::new();
        let good = {
            let log = memory_log(&shared);
            let mut entry = update(1, None, 1);
            let lsn = log.append(&mut entry).unwrap();
            log.force_all().unwrap();
            entry.next_lsn().get() - lsn.get()
        };
        let mut bad = update(1, None, 2);
        bad.lsn = Lsn::FIRST.advance(good);
        let mut frame = bad.encode_frame();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        shared.push_raw(&frame);

        let log = memory_log(&shared);
        assert_eq!(log.next_lsn(), Lsn::FIRST.advance(good));
    }

    #[test]
    fn read_only_open_ignores_a_torn_tail_without_cutting_it() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("txstore.log");
        let kept = {
            let log = LogManager::open(
                Box::new(FileLogStorage::open(&path).unwrap()),
                LogOptions::default(),
            )
            .unwrap();
            let mut entry = update(1, None, 1);
            let lsn = log.append(&mut entry).unwrap();
            log.close().unwrap();
            lsn
        };
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            let mut torn = update(1, Some(kept), 2);
            torn.lsn = Lsn::new(999);
            let frame = torn.encode_frame();
            file.write_all(&frame[..frame.len() / 2]).unwrap();
        }
        let before = std::fs::read(&path).unwrap();

        let log = LogManager::open_read_only(Box::new(FileLogStorage::open_read_only(&path).unwrap())).unwrap();
        let entries: Vec<LogEntry> = log.scan(log.truncation_point()).map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].lsn, kept);
        assert!(log.append(&mut update(1, Some(kept), 3)).is_err());
        assert!(log.truncate(kept).is_err());
        log.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }
}
