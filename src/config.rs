//! Store configuration.

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use crate::{
    io::{MemoryHandle, PageHandle},
    log::SharedMemoryLog,
    operations::OperationDescriptor,
};

/// Where pages live.
#[derive(Clone)]
pub enum PageStorageConfig {
    /// One page file.
    File(PathBuf),
    /// In memory. Pass a handle to keep the pages across a reopen.
    Memory(Option<MemoryHandle>),
    /// Pages striped across several files, `stripe_pages` pages at a time.
    Raid0 { paths: Vec<PathBuf>, stripe_pages: u64 },
    /// Every page mirrored to two files.
    Raid1 { primary: PathBuf, mirror: PathBuf },
    /// A caller supplied handle.
    Handle(Arc<dyn PageHandle>),
}

impl fmt::Debug for PageStorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Memory(handle) => f.debug_tuple("Memory").field(&handle.is_some()).finish(),
            Self::Raid0 { paths, stripe_pages } => f
                .debug_struct("Raid0")
                .field("paths", paths)
                .field("stripe_pages", stripe_pages)
                .finish(),
            Self::Raid1 { primary, mirror } => f
                .debug_struct("Raid1")
                .field("primary", primary)
                .field("mirror", mirror)
                .finish(),
            Self::Handle(handle) => f.debug_tuple("Handle").field(handle).finish(),
        }
    }
}

/// Where the log lives.
#[derive(Clone, Debug)]
pub enum LogStorageConfig {
    File(PathBuf),
    /// In memory; only forced bytes survive a reopen of the same log.
    Memory(SharedMemoryLog),
}

/// Log truncation settings.
#[derive(Clone, Debug)]
pub struct TruncationConfig {
    /// Run truncation on a background thread.
    pub automatic: bool,
    pub interval: Duration,
    /// Log size the background thread tries to stay under.
    pub target_log_size: u64,
    /// Smallest truncation worth doing. A file log is truncated by copying
    /// every retained byte into a new file while log forces wait, so this
    /// should stay large next to the retained size.
    pub min_incremental_truncation: u64,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            automatic: true,
            interval: Duration::from_secs(1),
            target_log_size: 5 * 1024 * 1024,
            min_incremental_truncation: 1024 * 1024,
        }
    }
}

/// Configuration for [`TxStore::open`](crate::TxStore::open).
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub page_storage: PageStorageConfig,
    pub log_storage: LogStorageConfig,
    pub buffer_pool_pages: usize,
    /// Dirty page count that wakes the write-back worker.
    pub dirty_page_high_water: usize,
    pub writeback_worker: bool,
    pub log_buffer_bytes: usize,
    pub group_commit_window: Duration,
    /// Take record locks on reads and writes.
    pub locking: bool,
    pub lock_timeout: Duration,
    pub truncation: TruncationConfig,
    /// Application operations, registered after the built-in ones.
    pub operations: Vec<OperationDescriptor>,
}

impl StoreConfig {
    /// A store whose pages and log are files under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self::with_storage(
            PageStorageConfig::File(dir.join("pages.db")),
            LogStorageConfig::File(dir.join("txstore.log")),
        )
    }

    /// A store that keeps everything in memory.
    pub fn in_memory() -> Self {
        Self::with_storage(
            PageStorageConfig::Memory(None),
            LogStorageConfig::Memory(SharedMemoryLog::new()),
        )
    }

    pub fn with_storage(page_storage: PageStorageConfig, log_storage: LogStorageConfig) -> Self {
        Self {
            page_storage,
            log_storage,
            buffer_pool_pages: 1024,
            dirty_page_high_water: 768,
            writeback_worker: true,
            log_buffer_bytes: 1024 * 1024,
            group_commit_window: Duration::from_millis(10),
            locking: true,
            lock_timeout: Duration::from_secs(1),
            truncation: TruncationConfig::default(),
            operations: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_page_storage(mut self, page_storage: PageStorageConfig) -> Self {
        self.page_storage = page_storage;
        self
    }

    #[must_use]
    pub fn with_log_storage(mut self, log_storage: LogStorageConfig) -> Self {
        self.log_storage = log_storage;
        self
    }

    #[must_use]
    pub fn with_buffer_pool_pages(mut self, pages: usize) -> Self {
        self.buffer_pool_pages = pages;
        self
    }

    #[must_use]
    pub fn with_dirty_page_high_water(mut self, pages: usize) -> Self {
        self.dirty_page_high_water = pages;
        self
    }

    #[must_use]
    pub fn with_writeback_worker(mut self, enabled: bool) -> Self {
        self.writeback_worker = enabled;
        self
    }

    #[must_use]
    pub fn with_log_buffer_bytes(mut self, bytes: usize) -> Self {
        self.log_buffer_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_group_commit_window(mut self, window: Duration) -> Self {
        self.group_commit_window = window;
        self
    }

    #[must_use]
    pub fn with_locking(mut self, enabled: bool) -> Self {
        self.locking = enabled;
        self
    }

    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_truncation(mut self, truncation: TruncationConfig) -> Self {
        self.truncation = truncation;
        self
    }

    /// Registers an application operation.
    #[must_use]
    pub fn with_operation(mut self, descriptor: OperationDescriptor) -> Self {
        self.operations.push(descriptor);
        self
    }
}

#[cfg(test)]
mod store_config_tests {
    use super::*;

    #[test]
    fn file_config_places_both_files_in_dir() {
        let config = StoreConfig::new("/tmp/db");
        match (&config.page_storage, &config.log_storage) {
            (PageStorageConfig::File(pages), LogStorageConfig::File(log)) => {
                assert_eq!(pages, &PathBuf::from("/tmp/db/pages.db"));
                assert_eq!(log, &PathBuf::from("/tmp/db/txstore.log"));
            }
            other => panic!("unexpected storage {other:?}"),
        }
    }

    #[test]
    fn builders_override_defaults() {
        let config = StoreConfig::in_memory()
            .with_buffer_pool_pages(8)
            .with_locking(false)
            .with_lock_timeout(Duration::from_millis(5))
            .with_truncation(TruncationConfig {
                automatic: false,
                ..TruncationConfig::default()
            });
        assert_eq!(config.buffer_pool_pages, 8);
        assert!(!config.locking);
        assert_eq!(config.lock_timeout, Duration::from_millis(5));
        assert!(!config.truncation.automatic);
        assert_eq!(config.group_commit_window, Duration::from_millis(10));
    }
}
