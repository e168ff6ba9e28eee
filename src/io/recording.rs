use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;

use crate::{error::StorageResult, io::PageHandle, Lsn, PageId};

/// One call observed by a [`RecordingHandle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleOp {
    Read(PageId),
    Write(PageId),
    Force,
    Close,
}

/// A page write together with the log state at the moment it happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordedWrite {
    pub page: PageId,
    pub page_lsn: Lsn,
    /// First non-durable log LSN when the write was issued, if a probe was
    /// installed.
    pub flushed_lsn: Option<Lsn>,
}

impl RecordedWrite {
    /// True if the page reached storage before the log entry that produced
    /// its LSN was durable.
    pub fn violates_wal(&self) -> bool {
        match self.flushed_lsn {
            Some(flushed) => self.page_lsn != Lsn::ZERO && self.page_lsn >= flushed,
            None => false,
        }
    }
}

type DurableProbe = Box<dyn Fn() -> Lsn + Send + Sync>;

/// Wraps a page handle, traces every call and records every write.
pub struct RecordingHandle {
    inner: Arc<dyn PageHandle>,
    ops: Mutex<Vec<HandleOp>>,
    writes: Mutex<Vec<RecordedWrite>>,
    probe: OnceLock<DurableProbe>,
}

impl fmt::Debug for RecordingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingHandle")
            .field("inner", &self.inner)
            .field("ops", &self.ops.lock().len())
            .field("writes", &self.writes.lock().len())
            .finish()
    }
}

impl RecordingHandle {
    pub fn new(inner: Arc<dyn PageHandle>) -> Self {
        Self {
            inner,
            ops: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            probe: OnceLock::new(),
        }
    }

    /// Installs the function that reports the log's flushed LSN. Only the
    /// first call has an effect.
    pub fn set_durable_probe(&self, probe: impl Fn() -> Lsn + Send + Sync + 'static) {
        let _ = self.probe.set(Box::new(probe));
    }

    pub fn ops(&self) -> Vec<HandleOp> {
        self.ops.lock().clone()
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().clone()
    }

    pub fn wal_violations(&self) -> Vec<RecordedWrite> {
        self.writes
            .lock()
            .iter()
            .copied()
            .filter(RecordedWrite::violates_wal)
            .collect()
    }
}

impl PageHandle for RecordingHandle {
    fn read(&self, page: PageId, buf: &mut [u8]) -> StorageResult<()> {
        tracing::trace!(page, "page read");
        self.ops.lock().push(HandleOp::Read(page));
        self.inner.read(page, buf)
    }

    fn write(&self, page: PageId, buf: &[u8]) -> StorageResult<()> {
        let mut lsn_bytes = [0u8; 8];
        if let Some(prefix) = buf.get(..8) {
            lsn_bytes.copy_from_slice(prefix);
        }
        let page_lsn = Lsn::new(u64::from_be_bytes(lsn_bytes));
        let flushed_lsn = self.probe.get().map(|probe| probe());
        tracing::trace!(page, %page_lsn, ?flushed_lsn, "page write");
        self.ops.lock().push(HandleOp::Write(page));
        self.writes.lock().push(RecordedWrite {
            page,
            page_lsn,
            flushed_lsn,
        });
        self.inner.write(page, buf)
    }

    fn force(&self) -> StorageResult<()> {
        tracing::trace!("page store force");
        self.ops.lock().push(HandleOp::Force);
        self.inner.force()
    }

    fn page_count(&self) -> StorageResult<u64> {
        self.inner.page_count()
    }

    fn close(&self) -> StorageResult<()> {
        self.ops.lock().push(HandleOp::Close);
        self.inner.close()
    }
}

#[cfg(test)]
mod recording_handle_tests {
    use super::*;
    use crate::{io::MemoryHandle, page::PAGE_SIZE};

    #[test]
    fn records_calls_and_flags_early_writes() {
        let handle = RecordingHandle::new(Arc::new(MemoryHandle::new()));
        let mut page = vec![0u8; PAGE_SIZE];
        page[..8].copy_from_slice(&40u64.to_be_bytes());

        // No probe installed yet: never a violation.
        handle.write(1, &page).unwrap();
        handle.set_durable_probe(|| Lsn::new(40));
        handle.write(1, &page).unwrap();
        handle.force().unwrap();
        let mut buf = vec![0u8; PAGE_SIZE];
        handle.read(1, &mut buf).unwrap();

        assert_eq!(
            handle.ops(),
            vec![
                HandleOp::Write(1),
                HandleOp::Write(1),
                HandleOp::Force,
                HandleOp::Read(1)
            ]
        );
        let violations = handle.wal_violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].page_lsn, Lsn::new(40));
    }
}
