//! Buffer pool.
//!
//! A fixed set of frames caches pages of the page handle. Each frame has a
//! content latch (`RwLock<Page>`) and a metadata mutex (pin count, page id).
//! The resident map tracks which page lives in which frame; a page that is
//! being read in or written back is `Pending` there, and anyone asking for it
//! waits on `fetched` until the transfer completes.
//!
//! Lock order: resident map, then replacement policy, then frame metadata.
//! A frame's content latch is only taken while the frame is pinned.
//!
//! A dirty page is written back only after the log is durable up to the
//! page LSN.

mod dirty_pages;
mod latch;
mod writeback;

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    error::{StorageError, StorageResult},
    io::PageHandle,
    log::{ForceMode, LogManager},
    page::Page,
    replacement::PolicyState,
    Lsn, PageId,
};

pub(crate) use dirty_pages::DirtyPages;
pub use latch::OrderedLatches;
use writeback::WritebackWorker;

#[derive(Debug, Default)]
pub(crate) struct FrameMeta {
    pub(crate) page_id: Option<PageId>,
    pub(crate) pins: usize,
}

impl FrameMeta {
    pub(crate) fn pin(&mut self) -> bool {
        let was_zero = self.pins == 0;
        self.pins += 1;
        was_zero
    }

    pub(crate) fn unpin(&mut self) -> bool {
        debug_assert!(self.pins > 0, "FrameMeta::unpin on zero pins");
        self.pins = self.pins.saturating_sub(1);
        self.pins == 0
    }
}

#[derive(Debug)]
pub(crate) struct BufferFrame {
    page: RwLock<Page>,
    meta: Mutex<FrameMeta>,
}

impl BufferFrame {
    pub(crate) fn new() -> Self {
        Self {
            page: RwLock::new(Page::new(0)),
            meta: Mutex::new(FrameMeta::default()),
        }
    }

    pub(crate) fn lock_meta(&self) -> MutexGuard<'_, FrameMeta> {
        self.meta.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Resident(usize),
    Pending,
}

#[derive(Debug, Default)]
pub struct BufferStats {
    pub hits: AtomicUsize,
    pub misses: AtomicUsize,
}

impl BufferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Hit rate in percent.
    pub fn hit_rate(&self) -> f64 {
        let (hits, misses) = self.get();
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}

/// A pinned page. The frame cannot be evicted until the guard is released
/// or dropped.
pub struct PinnedPage {
    frame: Arc<BufferFrame>,
    page_id: PageId,
    dirty: Arc<DirtyPages>,
    released: bool,
}

impl fmt::Debug for PinnedPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedPage")
            .field("page_id", &self.page_id)
            .finish()
    }
}

impl PinnedPage {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Takes the content latch in shared mode.
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.page.read()
    }

    /// Takes the content latch in exclusive mode.
    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.frame.page.write()
    }

    /// Marks `page` (this pinned page, latched) dirty, recording its current
    /// LSN as recLSN if the page was clean.
    pub fn mark_dirty(&self, page: &mut Page) {
        debug_assert_eq!(page.id(), self.page_id);
        page.mark_dirty();
        self.dirty.insert(self.page_id, page.lsn());
    }

    /// Unpins the page.
    pub fn release(mut self) {
        self.unpin();
    }

    fn unpin(&mut self) {
        if !self.released {
            self.released = true;
            self.frame.lock_meta().unpin();
        }
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.unpin();
    }
}

pub struct BufferManager {
    handle: Arc<dyn PageHandle>,
    log: Arc<LogManager>,
    frames: Vec<Arc<BufferFrame>>,
    resident: Mutex<HashMap<PageId, Slot>>,
    fetched: Condvar,
    policy: PolicyState,
    dirty: Arc<DirtyPages>,
    stats: BufferStats,
    writeback: OnceLock<WritebackWorker>,
    /// Set when a background write-back failed.
    failed: AtomicBool,
}

impl fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("frames", &self.frames.len())
            .field("dirty", &self.dirty.count())
            .field("stats", &self.stats)
            .finish()
    }
}

impl BufferManager {
    pub fn new(handle: Arc<dyn PageHandle>, log: Arc<LogManager>, num_frames: usize) -> Self {
        let frames: Vec<Arc<BufferFrame>> = (0..num_frames.max(1))
            .map(|_| Arc::new(BufferFrame::new()))
            .collect();
        let policy = PolicyState::new(&frames);
        Self {
            handle,
            log,
            frames,
            resident: Mutex::new(HashMap::new()),
            fetched: Condvar::new(),
            policy,
            dirty: Arc::new(DirtyPages::default()),
            stats: BufferStats::new(),
            writeback: OnceLock::new(),
            failed: AtomicBool::new(false),
        }
    }

    /// Starts the background write-back worker.
    pub(crate) fn start_writeback(self: &Arc<Self>, high_water: usize) -> StorageResult<()> {
        let worker = WritebackWorker::spawn(Arc::downgrade(self), high_water.max(1))?;
        if self.writeback.set(worker).is_err() {
            return Err(StorageError::internal("write-back worker already running"));
        }
        Ok(())
    }

    pub(crate) fn stop_writeback(&self) {
        if let Some(worker) = self.writeback.get() {
            worker.stop();
        }
    }

    pub(crate) fn record_failure(&self, error: &StorageError) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            tracing::error!(error = %error, "background write-back failed");
        }
    }

    /// True once background write-back has failed. Pages it could not write
    /// are still dirty, but the page store can no longer be trusted.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    pub(crate) fn dirty_pages(&self) -> &DirtyPages {
        &self.dirty
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.count()
    }

    pub fn min_rec_lsn(&self) -> Option<Lsn> {
        self.dirty.min_rec_lsn()
    }

    /// Like [`BufferManager::min_rec_lsn`], also folding in `others()`
    /// without letting a page turn dirty between the two reads.
    pub(crate) fn min_rec_lsn_with(&self, others: impl FnOnce() -> Option<Lsn>) -> Option<Lsn> {
        self.dirty.min_rec_lsn_with(others)
    }

    pub(crate) fn page_handle(&self) -> &Arc<dyn PageHandle> {
        &self.handle
    }

    /// Returns `page` pinned, reading it from the page handle on a miss.
    pub fn load_page(&self, page: PageId) -> StorageResult<PinnedPage> {
        self.pin(page, false)
    }

    /// Returns `page` pinned. On a miss the read is skipped and the frame is
    /// zero-filled, for pages whose old contents do not matter.
    pub fn load_uninitialized_page(&self, page: PageId) -> StorageResult<PinnedPage> {
        self.pin(page, true)
    }

    /// Unpins `pinned`. Dropping the guard has the same effect.
    pub fn release_page(&self, pinned: PinnedPage) {
        pinned.release();
    }

    fn pinned(&self, idx: usize, page: PageId) -> PinnedPage {
        PinnedPage {
            frame: Arc::clone(&self.frames[idx]),
            page_id: page,
            dirty: Arc::clone(&self.dirty),
            released: false,
        }
    }

    fn pin(&self, page: PageId, uninitialized: bool) -> StorageResult<PinnedPage> {
        let mut resident = self.resident.lock();
        loop {
            match resident.get(&page).copied() {
                Some(Slot::Resident(idx)) => {
                    let mut meta = self.frames[idx].lock_meta();
                    debug_assert_eq!(meta.page_id, Some(page));
                    meta.pin();
                    drop(meta);
                    drop(resident);
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    self.policy.record_hit(idx);
                    return Ok(self.pinned(idx, page));
                }
                Some(Slot::Pending) => self.fetched.wait(&mut resident),
                None => break,
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(worker) = self.writeback.get() {
            worker.maybe_wake(self.dirty.count());
        }

        let Some((idx, mut meta)) = self.policy.evict_frame(&self.frames) else {
            return Err(StorageError::BufferPoolExhausted {
                frames: self.frames.len(),
            });
        };
        let victim = meta.page_id.replace(page);
        meta.pin();
        drop(meta);
        if let Some(old) = victim {
            resident.insert(old, Slot::Pending);
        }
        resident.insert(page, Slot::Pending);
        drop(resident);

        let frame = &self.frames[idx];
        if victim.is_some() {
            if let Err(e) = self.write_back_frame(frame) {
                let mut resident = self.resident.lock();
                resident.remove(&page);
                let mut meta = frame.lock_meta();
                meta.page_id = victim;
                meta.unpin();
                if let Some(old) = victim {
                    resident.insert(old, Slot::Resident(idx));
                }
                drop(meta);
                self.fetched.notify_all();
                return Err(e);
            }
        }

        let loaded = self.fill_frame(frame, page, uninitialized);

        let mut resident = self.resident.lock();
        if let Some(old) = victim {
            resident.remove(&old);
        }
        let result = match loaded {
            Ok(()) => {
                resident.insert(page, Slot::Resident(idx));
                Ok(self.pinned(idx, page))
            }
            Err(e) => {
                resident.remove(&page);
                let mut meta = frame.lock_meta();
                meta.page_id = None;
                meta.unpin();
                Err(e)
            }
        };
        drop(resident);
        self.fetched.notify_all();
        if result.is_ok() {
            self.policy.on_frame_assigned(idx);
        }
        result
    }

    fn fill_frame(&self, frame: &BufferFrame, page: PageId, uninitialized: bool) -> StorageResult<()> {
        let mut contents = frame.page.write();
        contents.reset(page);
        if uninitialized {
            return Ok(());
        }
        self.handle.read(page, contents.bytes_mut())?;
        contents.verify_crc32()
    }

    /// Writes the frame's page back if it is dirty, forcing the log first.
    fn write_back_frame(&self, frame: &BufferFrame) -> StorageResult<bool> {
        let mut page = frame.page.write();
        if !page.is_dirty() {
            return Ok(false);
        }
        self.log.force(page.lsn(), ForceMode::WriteBack)?;
        page.update_crc32();
        self.handle.write(page.id(), page.bytes())?;
        page.clear_dirty();
        self.dirty.remove(page.id());
        tracing::trace!(page = page.id(), lsn = %page.lsn(), "page written back");
        Ok(true)
    }

    /// Writes `page` back if it is resident and dirty. Returns whether a
    /// write happened.
    pub fn flush_page(&self, page: PageId) -> StorageResult<bool> {
        let idx = {
            let resident = self.resident.lock();
            match resident.get(&page) {
                Some(Slot::Resident(idx)) => {
                    self.frames[*idx].lock_meta().pin();
                    *idx
                }
                _ => return Ok(false),
            }
        };
        let pinned = self.pinned(idx, page);
        let result = self.write_back_frame(&pinned.frame);
        drop(pinned);
        result
    }

    /// Writes back every dirty page, in page id order. Returns the number of
    /// pages written.
    pub fn flush_all(&self) -> StorageResult<usize> {
        let mut written = 0;
        for page in self.dirty.page_ids() {
            if self.flush_page(page)? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Writes back the given pages, skipping clean or evicted ones.
    pub(crate) fn flush_pages(&self, pages: impl IntoIterator<Item = PageId>) -> StorageResult<()> {
        for page in pages {
            self.flush_page(page)?;
        }
        Ok(())
    }

    /// Forgets every cached page without writing anything back.
    pub(crate) fn discard(&self) {
        self.stop_writeback();
        let mut resident = self.resident.lock();
        let dirty = self.dirty.count();
        for frame in &self.frames {
            let mut meta = frame.lock_meta();
            meta.page_id = None;
            meta.pins = 0;
            frame.page.write().clear_dirty();
        }
        resident.clear();
        self.dirty.clear();
        if dirty > 0 {
            tracing::warn!(dirty, "discarded dirty pages without writing them back");
        }
    }
}

#[cfg(test)]
mod buffer_manager_tests {
    use super::*;
    use crate::{
        io::{MemoryHandle, RecordingHandle},
        log::{EntryBody, LogEntry, LogOptions, MemoryLogStorage, SharedMemoryLog},
        page::{PageType, PAGE_DATA_OFFSET},
        test_utils::memory_buffer_manager,
    };
    use std::{thread, time::Duration};

    fn dirty_page(buffers: &BufferManager, log: &LogManager, id: PageId, byte: u8) -> Lsn {
        let mut entry = LogEntry::new(1, None, EntryBody::Internal);
        let lsn = log.append(&mut entry).unwrap();
        let pinned = buffers.load_page(id).unwrap();
        let mut page = pinned.write();
        page.set_page_type(PageType::Raw);
        page.write(PAGE_DATA_OFFSET, &[byte]).unwrap();
        page.set_lsn(lsn);
        pinned.mark_dirty(&mut page);
        lsn
    }

    #[test]
    fn hit_after_miss() {
        let (_log, buffers) = memory_buffer_manager(4);
        let first = buffers.load_page(1).unwrap();
        drop(first);
        let again = buffers.load_page(1).unwrap();
        assert_eq!(again.page_id(), 1);
        assert_eq!(buffers.stats().get(), (1, 1));
        assert!(buffers.stats().hit_rate() > 49.0);
    }

    #[test]
    fn pinned_pages_block_eviction() {
        let (_log, buffers) = memory_buffer_manager(2);
        let a = buffers.load_page(1).unwrap();
        let b = buffers.load_page(2).unwrap();
        assert!(matches!(
            buffers.load_page(3),
            Err(StorageError::BufferPoolExhausted { frames: 2 })
        ));
        drop(a);
        let c = buffers.load_page(3).unwrap();
        assert_eq!(c.page_id(), 3);
        drop(b);
        drop(c);
    }

    #[test]
    fn evicted_dirty_page_is_written_back_and_reloaded() {
        let (log, buffers) = memory_buffer_manager(2);
        let lsn = dirty_page(&buffers, &log, 7, 0xAB);
        assert_eq!(buffers.dirty_pages().rec_lsn(7), Some(lsn));

        // Cycle other pages through the pool.
        for id in 10..14 {
            buffers.load_page(id).unwrap();
        }
        assert!(log.is_durable(lsn));
        assert_eq!(buffers.dirty_count(), 0);

        let pinned = buffers.load_page(7).unwrap();
        let page = pinned.read();
        assert_eq!(page.read(PAGE_DATA_OFFSET, 1).unwrap(), &[0xAB]);
        assert_eq!(page.lsn(), lsn);
    }

    #[test]
    fn write_back_never_precedes_the_log() {
        let shared = SharedMemoryLog::new();
        let log = Arc::new(
            LogManager::open(
                Box::new(MemoryLogStorage::open(shared)),
                LogOptions::default(),
            )
            .unwrap(),
        );
        let recording = Arc::new(RecordingHandle::new(Arc::new(MemoryHandle::new())));
        let probe_log = Arc::clone(&log);
        recording.set_durable_probe(move || probe_log.flushed_lsn());
        let buffers = BufferManager::new(recording.clone(), Arc::clone(&log), 3);

        for round in 0..5u8 {
            for id in 1..8 {
                dirty_page(&buffers, &log, id, round);
            }
        }
        buffers.flush_all().unwrap();
        assert!(!recording.writes().is_empty());
        assert!(recording.wal_violations().is_empty());
    }

    #[test]
    fn concurrent_loads_of_the_same_page_share_one_read() {
        let (_log, buffers) = memory_buffer_manager(4);
        let buffers = Arc::new(buffers);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let buffers = Arc::clone(&buffers);
                thread::spawn(move || {
                    let pinned = buffers.load_page(42).unwrap();
                    thread::sleep(Duration::from_millis(5));
                    pinned.page_id()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 42);
        }
        let (hits, misses) = buffers.stats().get();
        assert_eq!(misses, 1);
        assert_eq!(hits, 7);
    }

    #[test]
    fn corrupted_page_is_reported() {
        let handle = MemoryHandle::new();
        let mut bytes = vec![0u8; crate::PAGE_SIZE];
        bytes[12] = 1;
        bytes[100] = 9;
        handle.write(3, &bytes).unwrap();
        let log = Arc::new(
            LogManager::open(
                Box::new(MemoryLogStorage::open(SharedMemoryLog::new())),
                LogOptions::default(),
            )
            .unwrap(),
        );
        let buffers = BufferManager::new(Arc::new(handle), log, 2);
        assert!(matches!(
            buffers.load_page(3),
            Err(StorageError::PageCorrupted { page: 3, .. })
        ));
        // The failed frame is reusable.
        buffers.load_page(4).unwrap();
        buffers.load_page(5).unwrap();
    }

    #[test]
    fn discard_drops_dirty_pages() {
        let (log, buffers) = memory_buffer_manager(4);
        dirty_page(&buffers, &log, 2, 1);
        buffers.discard();
        assert_eq!(buffers.dirty_count(), 0);
        let pinned = buffers.load_page(2).unwrap();
        assert_eq!(pinned.read().lsn(), Lsn::ZERO);
    }
}
