use crate::{
    error::{StorageError, StorageResult},
    log::{entry::LogEntry, LogManager},
    Lsn, Xid,
};

/// Forward iterator over the log, from a starting LSN to the end of the log
/// as it was when the scan was created.
pub struct ForwardScan<'a> {
    log: &'a LogManager,
    next: Lsn,
    end: Lsn,
}

impl<'a> ForwardScan<'a> {
    pub(crate) fn new(log: &'a LogManager, from: Lsn) -> Self {
        Self {
            log,
            next: from,
            end: log.next_lsn(),
        }
    }
}

impl Iterator for ForwardScan<'_> {
    type Item = StorageResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        match self.log.read_entry(self.next) {
            Ok(entry) => {
                self.next = entry.next_lsn();
                Some(Ok(entry))
            }
            Err(e) => {
                self.next = self.end;
                Some(Err(e))
            }
        }
    }
}

/// Walks one transaction's undo chain backwards.
///
/// Each step follows [`LogEntry::undo_successor`], so compensation entries
/// make the cursor skip work that has already been undone.
#[derive(Debug, Clone)]
pub struct UndoCursor {
    xid: Xid,
    next: Option<Lsn>,
}

impl UndoCursor {
    pub fn new(xid: Xid, start: Lsn) -> Self {
        Self {
            xid,
            next: Some(start),
        }
    }

    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// LSN of the entry the next call to [`UndoCursor::step`] returns.
    pub fn peek(&self) -> Option<Lsn> {
        self.next
    }

    pub fn step(&mut self, log: &LogManager) -> StorageResult<Option<LogEntry>> {
        let Some(lsn) = self.next else {
            return Ok(None);
        };
        let entry = log.read_entry(lsn)?;
        if entry.xid != self.xid {
            return Err(StorageError::log_corrupted(
                lsn,
                format!("undo chain of xid {} reached xid {}", self.xid, entry.xid),
            ));
        }
        self.next = entry.undo_successor();
        Ok(Some(entry))
    }
}
