use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tempfile::TempDir;

use crate::{
    buffer_manager::BufferManager,
    config::{LogStorageConfig, PageStorageConfig, StoreConfig, TruncationConfig},
    error::StorageResult,
    io::{MemoryHandle, PageHandle},
    log::{LogManager, LogOptions, MemoryLogStorage, SharedMemoryLog},
    PageId,
};

/// A buffer manager over an in-memory page store and log.
pub fn memory_buffer_manager(frames: usize) -> (Arc<LogManager>, BufferManager) {
    let log = Arc::new(
        LogManager::open(
            Box::new(MemoryLogStorage::open(SharedMemoryLog::new())),
            LogOptions::default(),
        )
        .unwrap(),
    );
    let buffers = BufferManager::new(Arc::new(MemoryHandle::new()), Arc::clone(&log), frames);
    (log, buffers)
}

/// Backing storage that outlives a store, so a test can crash and reopen.
#[derive(Clone, Debug)]
pub struct MemoryDisk {
    pub pages: MemoryHandle,
    pub log: SharedMemoryLog,
}

impl MemoryDisk {
    pub fn new() -> Self {
        Self {
            pages: MemoryHandle::new(),
            log: SharedMemoryLog::new(),
        }
    }

    /// Config for a store over this disk with background workers off, so
    /// tests decide when pages are written.
    pub fn config(&self) -> StoreConfig {
        quiet(StoreConfig::with_storage(
            PageStorageConfig::Memory(Some(self.pages.clone())),
            LogStorageConfig::Memory(self.log.clone()),
        ))
    }

    /// Same as [`MemoryDisk::config`] but with pages behind `handle`.
    pub fn config_with_pages(&self, handle: Arc<dyn PageHandle>) -> StoreConfig {
        quiet(StoreConfig::with_storage(
            PageStorageConfig::Handle(handle),
            LogStorageConfig::Memory(self.log.clone()),
        ))
    }
}

#[derive(Debug, Default)]
struct VolatilePages {
    written: HashMap<PageId, Box<[u8]>>,
    synced: HashMap<PageId, Box<[u8]>>,
}

/// Page store that loses every write not followed by a force when the
/// power goes. Clones share the same pages.
#[derive(Clone, Debug, Default)]
pub struct VolatileHandle {
    pages: Arc<Mutex<VolatilePages>>,
}

impl VolatileHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every unforced write.
    pub fn power_loss(&self) {
        self.pages.lock().written.clear();
    }
}

impl PageHandle for VolatileHandle {
    fn read(&self, page: PageId, buf: &mut [u8]) -> StorageResult<()> {
        let pages = self.pages.lock();
        match pages.written.get(&page).or_else(|| pages.synced.get(&page)) {
            Some(bytes) => buf.copy_from_slice(bytes),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write(&self, page: PageId, buf: &[u8]) -> StorageResult<()> {
        self.pages.lock().written.insert(page, buf.into());
        Ok(())
    }

    fn force(&self) -> StorageResult<()> {
        let mut pages = self.pages.lock();
        let written = std::mem::take(&mut pages.written);
        pages.synced.extend(written);
        Ok(())
    }

    fn page_count(&self) -> StorageResult<u64> {
        let pages = self.pages.lock();
        Ok(pages
            .written
            .keys()
            .chain(pages.synced.keys())
            .max()
            .map_or(0, |max| max + 1))
    }

    fn close(&self) -> StorageResult<()> {
        self.force()
    }
}

/// Memory page store whose writes and forces fail while `failing` is set.
#[derive(Clone, Debug, Default)]
pub struct FailingHandle {
    pub pages: MemoryHandle,
    failing: Arc<AtomicBool>,
}

impl FailingHandle {
    pub fn new(pages: MemoryHandle) -> Self {
        Self {
            pages,
            failing: Arc::default(),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    fn check(&self) -> StorageResult<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(io::Error::other("injected page store failure").into());
        }
        Ok(())
    }
}

impl PageHandle for FailingHandle {
    fn read(&self, page: PageId, buf: &mut [u8]) -> StorageResult<()> {
        self.pages.read(page, buf)
    }

    fn write(&self, page: PageId, buf: &[u8]) -> StorageResult<()> {
        self.check()?;
        self.pages.write(page, buf)
    }

    fn force(&self) -> StorageResult<()> {
        self.check()?;
        self.pages.force()
    }

    fn page_count(&self) -> StorageResult<u64> {
        self.pages.page_count()
    }

    fn close(&self) -> StorageResult<()> {
        self.pages.close()
    }
}

/// Config for a store in a fresh temporary directory.
pub fn file_config(dir: &TempDir) -> StoreConfig {
    quiet(StoreConfig::new(dir.path()))
}

fn quiet(config: StoreConfig) -> StoreConfig {
    config
        .with_writeback_worker(false)
        .with_group_commit_window(Duration::from_millis(2))
        .with_lock_timeout(Duration::from_millis(100))
        .with_truncation(TruncationConfig {
            automatic: false,
            ..TruncationConfig::default()
        })
}
