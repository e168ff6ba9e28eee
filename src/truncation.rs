//! Log truncation.
//!
//! The log must be kept back to the smallest recLSN of any dirty page or
//! active transaction. Everything before that, up to the flushed LSN, can go.

use std::{
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{
    buffer_manager::BufferManager,
    config::TruncationConfig,
    error::{ErrorKind, StorageResult},
    log::LogManager,
    store::StoreInner,
    transaction_table::TransactionTable,
    Lsn,
};

fn retained_from(log: &LogManager, buffers: &BufferManager, transactions: &TransactionTable) -> Lsn {
    let flushed = log.flushed_lsn();
    // A transaction marks its pages dirty before it can end, so reading its
    // recLSN with the dirty table locked leaves no gap between the two.
    buffers
        .min_rec_lsn_with(|| transactions.min_rec_lsn())
        .map_or(flushed, |rec| rec.min(flushed))
}

/// Truncates the log if enough of it is reclaimable, flushing dirty pages
/// first when the log has grown past twice its target size. Returns whether
/// the log was truncated.
pub(crate) fn truncate_now(
    log: &LogManager,
    buffers: &BufferManager,
    transactions: &TransactionTable,
    config: &TruncationConfig,
) -> StorageResult<bool> {
    let start = log.truncation_point();
    let rec = retained_from(log, buffers, transactions);
    if rec.distance_from(start) > config.min_incremental_truncation {
        return truncate_to(log, buffers, start, rec);
    }

    if log.flushed_lsn().distance_from(start) > 2 * config.target_log_size {
        let written = buffers.flush_all()?;
        tracing::debug!(written, "flushed dirty pages to make the log truncatable");
        let rec = retained_from(log, buffers, transactions);
        if rec > start {
            return truncate_to(log, buffers, start, rec);
        }
    }
    Ok(false)
}

fn truncate_to(log: &LogManager, buffers: &BufferManager, start: Lsn, rec: Lsn) -> StorageResult<bool> {
    // Pages written back so far must be durable before the log entries that
    // could rebuild them are dropped.
    buffers.page_handle().force()?;
    let now = log.truncation_point();
    let reached = log.truncate(rec)?;
    if reached > now {
        tracing::info!(from = %start, to = %reached, bytes = reached.distance_from(start), "log truncated");
    }
    Ok(reached > now)
}

#[derive(Debug, Default)]
struct Shutdown {
    stopping: Mutex<bool>,
    cond: Condvar,
}

/// Background thread that keeps the log near its target size.
#[derive(Debug)]
pub(crate) struct TruncationWorker {
    shutdown: Arc<Shutdown>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TruncationWorker {
    pub(crate) fn spawn(store: Weak<StoreInner>, config: TruncationConfig) -> std::io::Result<Self> {
        let shutdown = Arc::new(Shutdown::default());
        let thread_shutdown = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name("txstore-truncation".into())
            .spawn(move || run(store, config, thread_shutdown))?;
        Ok(Self {
            shutdown,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn stop(&self) {
        {
            let mut stopping = self.shutdown.stopping.lock();
            *stopping = true;
            self.shutdown.cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!("truncation worker panicked");
            }
        }
    }
}

impl Drop for TruncationWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(store: Weak<StoreInner>, config: TruncationConfig, shutdown: Arc<Shutdown>) {
    let interval = config.interval.max(Duration::from_millis(1));
    loop {
        {
            let mut stopping = shutdown.stopping.lock();
            if !*stopping {
                shutdown.cond.wait_for(&mut stopping, interval);
            }
            if *stopping {
                return;
            }
        }
        let Some(store) = store.upgrade() else {
            return;
        };
        let log = store.log();
        if log.flushed_lsn().distance_from(log.truncation_point()) <= config.target_log_size {
            continue;
        }
        if let Err(e) = truncate_now(log, store.buffers(), store.transactions(), &config) {
            if e.kind() == ErrorKind::Io {
                store.poison(&e);
                return;
            }
            tracing::warn!(error = %e, "background truncation failed");
        }
    }
}

#[cfg(test)]
mod truncation_tests {
    use super::*;
    use crate::{
        config::TruncationConfig,
        store::TxStore,
        test_utils::MemoryDisk,
    };

    fn eager() -> TruncationConfig {
        TruncationConfig {
            automatic: false,
            interval: Duration::from_millis(10),
            target_log_size: 64,
            min_incremental_truncation: 0,
        }
    }

    #[test]
    fn truncation_never_passes_an_active_transaction() {
        let disk = MemoryDisk::new();
        let store = TxStore::open(disk.config().with_truncation(eager())).unwrap();

        let long_running = store.begin().unwrap();
        let begin_lsn = store.transactions().snapshot(long_running).unwrap().rec_lsn.unwrap();
        for value in 0..20i32 {
            let xid = store.begin().unwrap();
            let rid = store.alloc(xid, 4).unwrap();
            store.set(xid, rid, &value.to_be_bytes()).unwrap();
            store.commit(xid).unwrap();
        }
        store.truncate_now().unwrap();
        let point = store.log().truncation_point();
        assert!(point <= begin_lsn, "truncated to {point}, active since {begin_lsn}");
        assert!(point <= store.log().flushed_lsn());

        store.commit(long_running).unwrap();
        store.buffers().flush_all().unwrap();
        assert!(store.truncate_now().unwrap());
        assert!(store.log().truncation_point() > begin_lsn);
    }

    #[test]
    fn truncation_keeps_dirty_pages_recoverable() {
        let disk = MemoryDisk::new();
        let store = TxStore::open(disk.config().with_truncation(eager())).unwrap();
        let xid = store.begin().unwrap();
        let rid = store.alloc(xid, 4).unwrap();
        store.set(xid, rid, &41i32.to_be_bytes()).unwrap();
        store.commit(xid).unwrap();

        let dirty_from = store.buffers().min_rec_lsn().unwrap();
        store.truncate_now().unwrap();
        assert!(store.log().truncation_point() <= dirty_from);
        store.simulate_crash();

        let store = TxStore::open(disk.config()).unwrap();
        let reader = store.begin().unwrap();
        let mut buf = [0u8; 4];
        store.read(reader, rid, &mut buf).unwrap();
        assert_eq!(i32::from_be_bytes(buf), 41);
    }
}
