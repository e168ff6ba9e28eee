use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    error::{StorageError, StorageResult},
    log::storage::LogStorage,
    Lsn,
};

#[derive(Debug)]
struct MemoryLogState {
    base: Lsn,
    bytes: Vec<u8>,
    /// Prefix of `bytes` covered by the last sync.
    durable_len: usize,
}

/// Log bytes that outlive a [`MemoryLogStorage`].
///
/// Reopening a storage over the same shared log keeps only what was synced,
/// which is what a crash leaves behind.
#[derive(Clone, Debug)]
pub struct SharedMemoryLog {
    state: Arc<Mutex<MemoryLogState>>,
}

impl Default for SharedMemoryLog {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryLogState {
                base: Lsn::FIRST,
                bytes: Vec::new(),
                durable_len: 0,
            })),
        }
    }
}

impl SharedMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of synced bytes.
    pub fn durable_len(&self) -> usize {
        self.state.lock().durable_len
    }

    /// Appends raw, already durable bytes, as a torn write would leave them.
    #[cfg(test)]
    pub(crate) fn push_raw(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        state.bytes.extend_from_slice(bytes);
        state.durable_len = state.bytes.len();
    }
}

/// In-memory log backend.
#[derive(Debug)]
pub struct MemoryLogStorage {
    shared: SharedMemoryLog,
}

impl MemoryLogStorage {
    pub fn open(shared: SharedMemoryLog) -> Self {
        {
            let mut state = shared.state.lock();
            let durable = state.durable_len;
            state.bytes.truncate(durable);
        }
        Self { shared }
    }
}

impl LogStorage for MemoryLogStorage {
    fn base_lsn(&self) -> Lsn {
        self.shared.state.lock().base
    }

    fn end_lsn(&self) -> Lsn {
        let state = self.shared.state.lock();
        state.base.advance(state.bytes.len() as u64)
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<()> {
        self.shared.state.lock().bytes.extend_from_slice(bytes);
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        let mut state = self.shared.state.lock();
        state.durable_len = state.bytes.len();
        Ok(())
    }

    fn read_at(&self, lsn: Lsn, buf: &mut [u8]) -> StorageResult<usize> {
        let state = self.shared.state.lock();
        if lsn < state.base {
            return Err(StorageError::log_corrupted(
                lsn,
                format!("read before the truncation point {}", state.base),
            ));
        }
        let start = lsn.distance_from(state.base) as usize;
        if start >= state.bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(state.bytes.len() - start);
        buf[..n].copy_from_slice(&state.bytes[start..start + n]);
        Ok(n)
    }

    fn truncate(&mut self, new_base: Lsn) -> StorageResult<()> {
        let mut state = self.shared.state.lock();
        let drop_len = new_base.distance_from(state.base) as usize;
        if drop_len > state.bytes.len() {
            return Err(StorageError::internal(format!(
                "cannot truncate to {new_base}: past the end of the log"
            )));
        }
        state.bytes.drain(..drop_len);
        state.durable_len = state.durable_len.saturating_sub(drop_len);
        state.base = state.base.max(new_base);
        Ok(())
    }

    fn cut_tail(&mut self, end: Lsn) -> StorageResult<()> {
        let mut state = self.shared.state.lock();
        let keep = end.distance_from(state.base) as usize;
        state.bytes.truncate(keep);
        state.durable_len = state.durable_len.min(keep);
        Ok(())
    }

    fn close(&mut self) -> StorageResult<()> {
        self.sync()
    }
}

#[cfg(test)]
mod memory_log_tests {
    use super::*;

    #[test]
    fn reopen_drops_unsynced_bytes() {
        let shared = SharedMemoryLog::new();
        let mut storage = MemoryLogStorage::open(shared.clone());
        storage.append(b"abcd").unwrap();
        storage.sync().unwrap();
        storage.append(b"efgh").unwrap();
        assert_eq!(storage.end_lsn(), Lsn::new(9));
        drop(storage);

        let storage = MemoryLogStorage::open(shared);
        assert_eq!(storage.end_lsn(), Lsn::new(5));
        let mut buf = [0u8; 8];
        assert_eq!(storage.read_at(Lsn::FIRST, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"abcd");
    }

    #[test]
    fn truncate_keeps_lsns_stable() {
        let mut storage = MemoryLogStorage::open(SharedMemoryLog::new());
        storage.append(b"0123456789").unwrap();
        storage.truncate(Lsn::new(5)).unwrap();
        assert_eq!(storage.base_lsn(), Lsn::new(5));
        assert_eq!(storage.end_lsn(), Lsn::new(11));

        let mut buf = [0u8; 2];
        storage.read_at(Lsn::new(6), &mut buf).unwrap();
        assert_eq!(&buf, b"56");
        assert!(storage.read_at(Lsn::new(2), &mut buf).is_err());
    }
}
