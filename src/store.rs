//! The transactional API.
//!
//! [`TxStore`] ties the pieces together. Every record or page mutation
//! follows the same path: take the record lock, pin and latch the page, log
//! an Update entry through the transaction table, run the operation and
//! stamp the page LSN, then mark the page dirty. Commit forces the log
//! through group commit; abort rolls the transaction's chain back.
//!
//! Page 0 is the header page. It holds a magic number and the id of the
//! next page to hand out; the store grows the page file inside a nested top
//! action so a new page stays allocated even if the transaction that asked
//! for it aborts.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    time::Instant,
};

use parking_lot::Mutex;

use crate::{
    buffer_manager::{BufferManager, BufferStats, OrderedLatches, PinnedPage},
    config::{LogStorageConfig, PageStorageConfig, StoreConfig, TruncationConfig},
    error::{ErrorKind, StorageError, StorageResult},
    io::{FileHandle, PageHandle, Raid0Handle, Raid1Handle},
    lock_manager::{LockMode, LockTable},
    log::{
        EntryBody, FileLogStorage, ForceMode, LogManager, LogOptions, LogStorage, MemoryLogStorage,
        UpdateBody,
    },
    nested_top_action::{self, NestedTopAction},
    operations::{
        builtin::{
            self, ALLOC, DEALLOC, DECREMENT, INCREMENT, INITIALIZE_PAGE, NOOP, PAGE_SET_RANGE, SET,
            SET_RANGE, UPDATE_RECORDS,
        },
        Mutation, OperationArgs, OperationId, OperationRegistry, OperationRegistryBuilder,
    },
    page::{Page, PageType, PAGE_DATA_OFFSET},
    record_page::{RecordPageView, MAX_RECORD_SIZE},
    recovery::{self, RecoveryReport},
    transaction_table::{TransactionState, TransactionTable},
    truncation::{self, TruncationWorker},
    Lsn, PageId, RecordId, Xid, NO_SLOT,
};

const HEADER_PAGE: PageId = 0;
const MAGIC_OFFSET: usize = PAGE_DATA_OFFSET;
const NEXT_PAGE_OFFSET: usize = PAGE_DATA_OFFSET + 8;
const MAGIC: u64 = u64::from_be_bytes(*b"TXSTORE1");

pub(crate) struct StoreInner {
    handle: Arc<dyn PageHandle>,
    log: Arc<LogManager>,
    buffers: Arc<BufferManager>,
    transactions: TransactionTable,
    registry: Arc<OperationRegistry>,
    locks: Option<LockTable>,
    /// Held for the whole of an abort.
    rollback: Mutex<()>,
    /// Record page that allocations try first. The mutex also serializes
    /// allocation.
    alloc_hint: Mutex<Option<PageId>>,
    truncation_config: TruncationConfig,
    truncation: Mutex<Option<TruncationWorker>>,
    report: OnceLock<RecoveryReport>,
    closed: AtomicBool,
    /// Set once a write to the log or page store failed, or a rollback
    /// broke off half way. Only recovery on the next open can repair that.
    poisoned: AtomicBool,
}

impl StoreInner {
    pub(crate) fn log(&self) -> &LogManager {
        &self.log
    }

    pub(crate) fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    pub(crate) fn transactions(&self) -> &TransactionTable {
        &self.transactions
    }

    pub(crate) fn poison(&self, error: &StorageError) {
        if !self.poisoned.swap(true, Ordering::AcqRel) {
            tracing::error!(error = %error, "fatal storage error, refusing further work");
        }
    }

    fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire) || self.buffers.has_failed()
    }

    fn stop_workers(&self) {
        if let Some(worker) = self.truncation.lock().take() {
            worker.stop();
        }
        self.buffers.stop_writeback();
    }
}

/// An open store. Clones share the same store.
#[derive(Clone)]
pub struct TxStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for TxStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxStore")
            .field("log", &self.inner.log)
            .field("buffers", &self.inner.buffers)
            .field("active_transactions", &self.active_transaction_count())
            .finish()
    }
}

fn open_page_handle(config: &PageStorageConfig) -> StorageResult<Arc<dyn PageHandle>> {
    let handle: Arc<dyn PageHandle> = match config {
        PageStorageConfig::File(path) => Arc::new(FileHandle::open(path)?),
        PageStorageConfig::Memory(handle) => Arc::new(handle.clone().unwrap_or_default()),
        PageStorageConfig::Raid0 {
            paths,
            stripe_pages,
        } => {
            let members = paths
                .iter()
                .map(|path| Ok(Arc::new(FileHandle::open(path)?) as Arc<dyn PageHandle>))
                .collect::<StorageResult<Vec<_>>>()?;
            Arc::new(Raid0Handle::new(members, *stripe_pages)?)
        }
        PageStorageConfig::Raid1 { primary, mirror } => Arc::new(Raid1Handle::new(
            Arc::new(FileHandle::open(primary)?),
            Arc::new(FileHandle::open(mirror)?),
        )),
        PageStorageConfig::Handle(handle) => Arc::clone(handle),
    };
    Ok(handle)
}

fn open_log_storage(config: &LogStorageConfig) -> StorageResult<Box<dyn LogStorage>> {
    Ok(match config {
        LogStorageConfig::File(path) => Box::new(FileLogStorage::open(path)?),
        LogStorageConfig::Memory(shared) => Box::new(MemoryLogStorage::open(shared.clone())),
    })
}

fn check_size(rid: RecordId, record: &[u8]) -> StorageResult<()> {
    if record.len() != rid.size as usize {
        return Err(StorageError::invalid_record(
            rid,
            format!("record holds {} bytes", record.len()),
        ));
    }
    Ok(())
}

fn record_view(rid: RecordId, page: &Page) -> StorageResult<RecordPageView<'_>> {
    if page.page_type()? != PageType::Record {
        return Err(StorageError::invalid_record(rid, "page is not a record page"));
    }
    RecordPageView::new(page)
}

impl TxStore {
    /// Opens a store, running crash recovery over whatever the log holds.
    pub fn open(config: StoreConfig) -> StorageResult<Self> {
        let started = Instant::now();
        let handle = open_page_handle(&config.page_storage)?;
        let active = Arc::new(AtomicUsize::new(0));
        let transactions = TransactionTable::new(Arc::clone(&active));
        let log = Arc::new(LogManager::open(
            open_log_storage(&config.log_storage)?,
            LogOptions {
                buffer_capacity: config.log_buffer_bytes,
                group_commit_window: config.group_commit_window,
                active_transactions: active,
            },
        )?);
        let buffers = Arc::new(BufferManager::new(
            Arc::clone(&handle),
            Arc::clone(&log),
            config.buffer_pool_pages,
        ));

        let mut operations = OperationRegistryBuilder::with_builtins();
        for descriptor in &config.operations {
            operations.register(*descriptor)?;
        }
        let registry = Arc::new(operations.build()?);

        let store = TxStore {
            inner: Arc::new(StoreInner {
                handle,
                log,
                buffers,
                transactions,
                registry,
                locks: config.locking.then(|| LockTable::new(config.lock_timeout)),
                rollback: Mutex::new(()),
                alloc_hint: Mutex::new(None),
                truncation_config: config.truncation.clone(),
                truncation: Mutex::new(None),
                report: OnceLock::new(),
                closed: AtomicBool::new(false),
                poisoned: AtomicBool::new(false),
            }),
        };

        let report = recovery::recover(&store)?;
        let _ = store.inner.report.set(report);
        store.ensure_header()?;

        if config.writeback_worker {
            store
                .inner
                .buffers
                .start_writeback(config.dirty_page_high_water)?;
        }
        if config.truncation.automatic {
            let worker = TruncationWorker::spawn(Arc::downgrade(&store.inner), config.truncation.clone())?;
            *store.inner.truncation.lock() = Some(worker);
        }
        tracing::info!(
            pages = store.page_count()?,
            frames = store.inner.buffers.num_frames(),
            locking = config.locking,
            elapsed = ?started.elapsed(),
            "store opened"
        );
        Ok(store)
    }

    /// Shuts the store down cleanly: aborts open transactions (prepared ones
    /// are left for recovery), writes back every dirty page and closes the
    /// page store and the log.
    pub fn close(self) -> StorageResult<()> {
        if let Err(e) = self.check_open() {
            // A poisoned store writes nothing more back.
            self.inner.stop_workers();
            return Err(e);
        }
        self.inner.stop_workers();
        for xid in self.inner.transactions.active_xids() {
            if self.transaction_state(xid)? == TransactionState::Prepared {
                tracing::warn!(xid, "leaving prepared transaction for recovery");
                continue;
            }
            tracing::warn!(xid, "aborting transaction still open at close");
            self.abort(xid)?;
        }
        self.inner.closed.store(true, Ordering::Release);
        let written = self.inner.buffers.flush_all()?;
        self.inner.handle.force()?;
        self.inner.log.close()?;
        self.inner.handle.close()?;
        tracing::info!(written, "store closed");
        Ok(())
    }

    /// Stops the store as a crash would: nothing is written back and the
    /// unforced log tail is lost.
    pub fn simulate_crash(self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.stop_workers();
        self.inner.buffers.discard();
        self.inner.log.discard_tail();
        tracing::warn!("simulated crash");
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StorageError::internal("store is closed"));
        }
        if self.inner.is_poisoned() {
            return Err(StorageError::internal(
                "store stopped after a fatal error; reopen it to recover",
            ));
        }
        Ok(())
    }

    /// Poisons the store if `result` is an I/O error.
    fn stop_on_io<T>(&self, result: StorageResult<T>) -> StorageResult<T> {
        if let Err(e) = &result {
            if e.kind() == ErrorKind::Io {
                self.inner.poison(e);
            }
        }
        result
    }

    /// Poisons the store on any error. For steps that leave a transaction
    /// half done when they fail.
    fn stop_on_error<T>(&self, result: StorageResult<T>) -> StorageResult<T> {
        if let Err(e) = &result {
            self.inner.poison(e);
        }
        result
    }

    fn load_page(&self, page: PageId) -> StorageResult<PinnedPage> {
        self.stop_on_io(self.inner.buffers.load_page(page))
    }

    fn check_active(&self, xid: Xid) -> StorageResult<()> {
        self.check_open()?;
        if !self.inner.transactions.is_active(xid) {
            return Err(StorageError::InvalidTransaction { xid });
        }
        Ok(())
    }

    fn lock(&self, xid: Xid, rid: RecordId, mode: LockMode) -> StorageResult<()> {
        match &self.inner.locks {
            Some(locks) => locks.acquire(xid, rid, mode),
            None => Ok(()),
        }
    }

    /// Takes an exclusive lock on `rid` if that needs no waiting.
    fn try_lock(&self, xid: Xid, rid: RecordId) -> bool {
        match &self.inner.locks {
            Some(locks) => locks.try_acquire(xid, rid, LockMode::Exclusive),
            None => true,
        }
    }

    fn release_locks(&self, xid: Xid) {
        if let Some(locks) = &self.inner.locks {
            locks.release_all(xid);
        }
    }

    pub fn begin(&self) -> StorageResult<Xid> {
        self.check_open()?;
        let xid = self.inner.transactions.begin()?;
        match self.stop_on_io(
            self.inner
                .transactions
                .append(&self.inner.log, xid, EntryBody::Begin),
        ) {
            Ok(_) => Ok(xid),
            Err(e) => {
                let _ = self.inner.transactions.forget(xid);
                Err(e)
            }
        }
    }

    /// Commits `xid`. Returns once the commit entry is durable.
    pub fn commit(&self, xid: Xid) -> StorageResult<Lsn> {
        self.check_open()?;
        let entry = self.stop_on_io(
            self.inner
                .transactions
                .append(&self.inner.log, xid, EntryBody::Commit),
        )?;
        // Whether the commit reached the disk is unknown after a failed
        // force; only recovery can tell.
        self.stop_on_error(self.inner.log.force(entry.lsn, ForceMode::Commit))?;
        self.inner.transactions.forget(xid)?;
        self.release_locks(xid);
        tracing::trace!(xid, lsn = %entry.lsn, "transaction committed");
        Ok(entry.lsn)
    }

    /// Rolls back every change `xid` made and ends the transaction.
    pub fn abort(&self, xid: Xid) -> StorageResult<()> {
        self.check_open()?;
        let _rollback = self.inner.rollback.lock();
        self.inner
            .transactions
            .set_state(xid, TransactionState::Aborting)?;
        let abort = self.stop_on_io(
            self.inner
                .transactions
                .append(&self.inner.log, xid, EntryBody::Abort),
        )?;
        self.stop_on_error(recovery::roll_back(self, &[(xid, abort.lsn)]))?;
        self.release_locks(xid);
        tracing::debug!(xid, "transaction aborted");
        Ok(())
    }

    /// Makes `xid` durable as prepared. A prepared transaction survives a
    /// crash and waits for [`TxStore::commit`] or [`TxStore::abort`].
    pub fn prepare(&self, xid: Xid) -> StorageResult<()> {
        self.check_open()?;
        let entry = self
            .inner
            .transactions
            .append_with(&self.inner.log, xid, |snapshot| {
                let rec_lsn = snapshot.rec_lsn.ok_or_else(|| {
                    StorageError::internal(format!("xid {xid} has no recLSN"))
                })?;
                Ok(EntryBody::Prepare { rec_lsn })
            });
        let entry = self.stop_on_io(entry)?;
        self.stop_on_error(self.inner.log.force(entry.lsn, ForceMode::Commit))?;
        self.inner
            .transactions
            .set_state(xid, TransactionState::Prepared)
    }

    pub fn transaction_state(&self, xid: Xid) -> StorageResult<TransactionState> {
        Ok(self.inner.transactions.snapshot(xid)?.state)
    }

    /// Logs `update` for `xid` and applies it to the latched `page`.
    fn log_and_apply(
        &self,
        xid: Xid,
        pinned: &PinnedPage,
        page: &mut Page,
        mut update: UpdateBody,
    ) -> StorageResult<Lsn> {
        let registry = &self.inner.registry;
        registry.capture_preimage(xid, &mut update, page)?;
        registry.check_forward(xid, &update, page)?;
        let entry = self.stop_on_io(
            self.inner
                .transactions
                .append(&self.inner.log, xid, EntryBody::Update(update)),
        )?;
        registry.dispatch_forward(&entry, page)?;
        pinned.mark_dirty(page);
        Ok(entry.lsn)
    }

    /// Builds an update from the current contents of `rid` and applies it.
    fn update_record(
        &self,
        xid: Xid,
        rid: RecordId,
        build: impl FnOnce(&[u8]) -> StorageResult<UpdateBody>,
    ) -> StorageResult<Lsn> {
        let pinned = self.load_page(rid.page)?;
        let mut page = pinned.write();
        let update = {
            let record = record_view(rid, &page)?.record(rid.slot)?;
            check_size(rid, record)?;
            build(record)?
        };
        self.log_and_apply(xid, &pinned, &mut page, update)
    }

    /// Generic logged mutation. Physical operations run against `rid`'s
    /// page; logical ones are logged with a logical record id and run
    /// against the store.
    pub fn update(&self, xid: Xid, rid: RecordId, op: OperationId, args: &[u8]) -> StorageResult<Lsn> {
        self.check_active(xid)?;
        match self.inner.registry.get(op)?.mutation {
            Mutation::Logical(forward) => {
                let entry = self.inner.transactions.append(
                    &self.inner.log,
                    xid,
                    EntryBody::Update(UpdateBody::new(op, RecordId::logical(), args.to_vec())),
                )?;
                forward(
                    self,
                    xid,
                    &OperationArgs {
                        xid,
                        rid: RecordId::logical(),
                        args,
                    },
                )?;
                Ok(entry.lsn)
            }
            Mutation::Physical(_) => {
                if rid.is_logical() {
                    return Err(StorageError::invalid_record(
                        rid,
                        "physical operations need a page",
                    ));
                }
                if rid.slot != NO_SLOT {
                    self.lock(xid, rid, LockMode::Exclusive)?;
                }
                let pinned = self.load_page(rid.page)?;
                let mut page = pinned.write();
                self.log_and_apply(xid, &pinned, &mut page, UpdateBody::new(op, rid, args.to_vec()))
            }
        }
    }

    /// Runs a page-level operation on `page`.
    pub fn update_page(&self, xid: Xid, page: PageId, op: OperationId, args: &[u8]) -> StorageResult<Lsn> {
        self.update(xid, RecordId::page(page), op, args)
    }

    /// Overwrites `bytes.len()` bytes of `page` at `offset`, logging the old
    /// bytes for undo.
    fn set_page_range(&self, xid: Xid, pinned: &PinnedPage, offset: usize, bytes: &[u8]) -> StorageResult<Lsn> {
        let mut page = pinned.write();
        let old = page.read(offset, bytes.len())?.to_vec();
        let args = builtin::range_args(offset, bytes, &old);
        self.log_and_apply(
            xid,
            pinned,
            &mut page,
            UpdateBody::new(PAGE_SET_RANGE, RecordId::page(pinned.page_id()), args),
        )
    }

    fn ensure_header(&self) -> StorageResult<()> {
        let (page_type, magic) = {
            let pinned = self.load_page(HEADER_PAGE)?;
            let page = pinned.read();
            (page.page_type()?, page.read_u64(MAGIC_OFFSET)?)
        };
        match (page_type, magic) {
            (PageType::Header, MAGIC) => {}
            (PageType::Uninitialized, _) => {
                let xid = self.begin()?;
                self.update_page(
                    xid,
                    HEADER_PAGE,
                    INITIALIZE_PAGE,
                    &builtin::initialize_args(PageType::Header),
                )?;
                let mut fields = MAGIC.to_be_bytes().to_vec();
                fields.extend_from_slice(&1u64.to_be_bytes());
                let header = self.load_page(HEADER_PAGE)?;
                self.set_page_range(xid, &header, MAGIC_OFFSET, &fields)?;
                drop(header);
                self.commit(xid)?;
                tracing::info!("formatted a new store");
            }
            (other, _) => {
                return Err(StorageError::internal(format!(
                    "page {HEADER_PAGE} is a {other:?} page without the store magic"
                )));
            }
        }

        let next = self.page_count()?;
        if next > 1 {
            let last = next - 1;
            let pinned = self.load_page(last)?;
            if pinned.read().page_type()? == PageType::Record {
                *self.inner.alloc_hint.lock() = Some(last);
            }
        }
        Ok(())
    }

    /// Number of pages handed out so far, the header page included.
    pub fn page_count(&self) -> StorageResult<u64> {
        let pinned = self.load_page(HEADER_PAGE)?;
        let page = pinned.read();
        page.read_u64(NEXT_PAGE_OFFSET)
    }

    /// Appends a new record page. The caller holds the allocation mutex.
    fn grow(&self, xid: Xid) -> StorageResult<PageId> {
        let nta = nested_top_action::begin(
            &self.inner.log,
            &self.inner.transactions,
            &self.inner.registry,
            xid,
            NOOP,
            &[],
        )?;
        let page_id = {
            let header = self.load_page(HEADER_PAGE)?;
            let next = header.read().read_u64(NEXT_PAGE_OFFSET)?;
            self.set_page_range(xid, &header, NEXT_PAGE_OFFSET, &(next + 1).to_be_bytes())?;
            next
        };
        let fresh = self.inner.buffers.load_uninitialized_page(page_id)?;
        {
            let mut page = fresh.write();
            self.log_and_apply(
                xid,
                &fresh,
                &mut page,
                UpdateBody::new(
                    INITIALIZE_PAGE,
                    RecordId::page(page_id),
                    builtin::initialize_args(PageType::Record),
                ),
            )?;
        }
        nested_top_action::end(&self.inner.log, &self.inner.transactions, xid, nta)?;
        tracing::debug!(xid, page = page_id, "page file grown");
        Ok(page_id)
    }

    /// Formats a new, empty record page for `xid` and returns its id. The
    /// page stays allocated even if `xid` aborts.
    pub fn alloc_page(&self, xid: Xid) -> StorageResult<PageId> {
        self.check_active(xid)?;
        let mut hint = self.inner.alloc_hint.lock();
        let page = self.grow(xid)?;
        *hint = Some(page);
        Ok(page)
    }

    /// Allocates a record in `page` if it fits. The caller holds the
    /// allocation mutex, so this never waits for a record lock: a slot
    /// freed by a transaction that is still running is skipped.
    fn alloc_in_page(&self, xid: Xid, page: PageId, size: usize) -> StorageResult<Option<RecordId>> {
        let pinned = self.load_page(page)?;
        let mut contents = pinned.write();
        let candidates = record_view(RecordId::page(page), &contents)?.candidate_slots(size);
        for slot in candidates {
            let rid = RecordId::new(page, slot, size as u32);
            if !self.try_lock(xid, rid) {
                continue;
            }
            self.log_and_apply(xid, &pinned, &mut contents, UpdateBody::new(ALLOC, rid, Vec::new()))?;
            return Ok(Some(rid));
        }
        Ok(None)
    }

    fn check_record_size(size: usize) -> StorageResult<()> {
        if size > MAX_RECORD_SIZE {
            return Err(StorageError::RecordTooLarge {
                size,
                max: MAX_RECORD_SIZE,
            });
        }
        Ok(())
    }

    /// Allocates a zeroed record of `size` bytes.
    pub fn alloc(&self, xid: Xid, size: usize) -> StorageResult<RecordId> {
        self.check_active(xid)?;
        Self::check_record_size(size)?;
        let mut hint = self.inner.alloc_hint.lock();
        if let Some(page) = *hint {
            if let Some(rid) = self.alloc_in_page(xid, page, size)? {
                return Ok(rid);
            }
        }
        let page = self.grow(xid)?;
        *hint = Some(page);
        self.alloc_in_page(xid, page, size)?
            .ok_or(StorageError::PageFull { page, size })
    }

    /// Allocates a zeroed record of `size` bytes in `page`.
    pub fn alloc_from_page(&self, xid: Xid, page: PageId, size: usize) -> StorageResult<RecordId> {
        self.check_active(xid)?;
        Self::check_record_size(size)?;
        let _hint = self.inner.alloc_hint.lock();
        self.alloc_in_page(xid, page, size)?
            .ok_or(StorageError::PageFull { page, size })
    }

    pub fn dealloc(&self, xid: Xid, rid: RecordId) -> StorageResult<()> {
        self.check_active(xid)?;
        self.lock(xid, rid, LockMode::Exclusive)?;
        self.update_record(xid, rid, |old| {
            Ok(UpdateBody::new(DEALLOC, rid, old.to_vec()))
        })?;
        Ok(())
    }

    /// Copies the record into `buf`, which must be exactly `rid.size` bytes.
    pub fn read(&self, xid: Xid, rid: RecordId, buf: &mut [u8]) -> StorageResult<()> {
        self.check_active(xid)?;
        if buf.len() != rid.size as usize {
            return Err(StorageError::invalid_record(
                rid,
                format!("read buffer is {} bytes", buf.len()),
            ));
        }
        self.lock(xid, rid, LockMode::Shared)?;
        let pinned = self.load_page(rid.page)?;
        let page = pinned.read();
        let record = record_view(rid, &page)?.record(rid.slot)?;
        check_size(rid, record)?;
        buf.copy_from_slice(record);
        Ok(())
    }

    /// Overwrites the whole record.
    pub fn set(&self, xid: Xid, rid: RecordId, bytes: &[u8]) -> StorageResult<()> {
        self.check_active(xid)?;
        if bytes.len() != rid.size as usize {
            return Err(StorageError::invalid_record(
                rid,
                format!("{} bytes do not fit the record", bytes.len()),
            ));
        }
        self.lock(xid, rid, LockMode::Exclusive)?;
        self.update_record(xid, rid, |old| {
            Ok(UpdateBody::new(SET, rid, builtin::set_args(bytes, old)))
        })?;
        Ok(())
    }

    /// Overwrites part of the record, starting at `offset`.
    pub fn set_range(&self, xid: Xid, rid: RecordId, offset: usize, bytes: &[u8]) -> StorageResult<()> {
        self.check_active(xid)?;
        self.lock(xid, rid, LockMode::Exclusive)?;
        self.update_record(xid, rid, |record| {
            let old = offset
                .checked_add(bytes.len())
                .and_then(|end| record.get(offset..end))
                .ok_or(StorageError::PageBounds {
                    offset,
                    len: bytes.len(),
                })?;
            Ok(UpdateBody::new(SET_RANGE, rid, builtin::range_args(offset, bytes, old)))
        })?;
        Ok(())
    }

    fn add(&self, xid: Xid, rid: RecordId, op: OperationId) -> StorageResult<()> {
        self.check_active(xid)?;
        if rid.size != 4 {
            return Err(StorageError::invalid_record(rid, "counters are 4 byte records"));
        }
        self.lock(xid, rid, LockMode::Exclusive)?;
        self.update_record(xid, rid, |_| Ok(UpdateBody::new(op, rid, Vec::new())))?;
        Ok(())
    }

    /// Adds one to a 4 byte big-endian counter record.
    pub fn increment(&self, xid: Xid, rid: RecordId) -> StorageResult<()> {
        self.add(xid, rid, INCREMENT)
    }

    pub fn decrement(&self, xid: Xid, rid: RecordId) -> StorageResult<()> {
        self.add(xid, rid, DECREMENT)
    }

    /// True if `rid` names a live record of its size.
    pub fn record_exists(&self, xid: Xid, rid: RecordId) -> StorageResult<bool> {
        self.check_active(xid)?;
        if rid.is_logical() || rid.page == HEADER_PAGE || rid.page >= self.page_count()? {
            return Ok(false);
        }
        self.lock(xid, rid, LockMode::Shared)?;
        let pinned = self.load_page(rid.page)?;
        let page = pinned.read();
        Ok(builtin::record_matches(&page, rid))
    }

    /// Overwrites several records as one nested top action, latching their
    /// pages in page id order. Undo restores the old values logically.
    pub fn set_records(&self, xid: Xid, records: &[(RecordId, Vec<u8>)]) -> StorageResult<()> {
        self.check_active(xid)?;
        for (rid, bytes) in records {
            if bytes.len() != rid.size as usize {
                return Err(StorageError::invalid_record(
                    *rid,
                    format!("{} bytes do not fit the record", bytes.len()),
                ));
            }
        }
        let mut rids: Vec<RecordId> = records.iter().map(|(rid, _)| *rid).collect();
        rids.sort_unstable();
        rids.dedup();
        for rid in &rids {
            self.lock(xid, *rid, LockMode::Exclusive)?;
        }

        let mut page_ids: Vec<PageId> = rids.iter().map(|rid| rid.page).collect();
        page_ids.dedup();
        let pinned = page_ids
            .iter()
            .map(|page| self.load_page(*page))
            .collect::<StorageResult<Vec<_>>>()?;
        let mut latches = OrderedLatches::acquire(&pinned);

        let mut old = Vec::with_capacity(records.len());
        for (rid, _) in records {
            let page = latches
                .page_mut(rid.page)
                .ok_or_else(|| StorageError::internal(format!("page {} is not latched", rid.page)))?;
            let record = record_view(*rid, page)?.record(rid.slot)?;
            check_size(*rid, record)?;
            old.push((*rid, record.to_vec()));
        }

        let nta = nested_top_action::begin(
            &self.inner.log,
            &self.inner.transactions,
            &self.inner.registry,
            xid,
            UPDATE_RECORDS,
            &builtin::encode_records(&old),
        )?;
        for ((rid, bytes), (_, previous)) in records.iter().zip(&old) {
            let pin = pinned
                .iter()
                .find(|pin| pin.page_id() == rid.page)
                .ok_or_else(|| StorageError::internal(format!("page {} is not pinned", rid.page)))?;
            let page = latches
                .page_mut(rid.page)
                .ok_or_else(|| StorageError::internal(format!("page {} is not latched", rid.page)))?;
            self.log_and_apply(
                xid,
                pin,
                page,
                UpdateBody::new(SET, *rid, builtin::set_args(bytes, previous)),
            )?;
        }
        nested_top_action::end(&self.inner.log, &self.inner.transactions, xid, nta)?;
        Ok(())
    }

    /// Overwrites a record on behalf of a logical undo. The record is
    /// already locked by `xid`.
    pub(crate) fn set_for_undo(&self, xid: Xid, rid: RecordId, bytes: &[u8]) -> StorageResult<()> {
        if bytes.len() != rid.size as usize {
            return Err(StorageError::invalid_record(rid, "restored bytes do not fit the record"));
        }
        self.update_record(xid, rid, |old| {
            Ok(UpdateBody::new(SET, rid, builtin::set_args(bytes, old)))
        })?;
        Ok(())
    }

    /// Starts a nested top action whose undo is the logical inverse of `op`.
    pub fn begin_nested_top_action(&self, xid: Xid, op: OperationId, args: &[u8]) -> StorageResult<NestedTopAction> {
        self.check_active(xid)?;
        nested_top_action::begin(
            &self.inner.log,
            &self.inner.transactions,
            &self.inner.registry,
            xid,
            op,
            args,
        )
    }

    /// Ends a nested top action. Returns the LSN of its closing CLR.
    pub fn end_nested_top_action(&self, xid: Xid, nta: NestedTopAction) -> StorageResult<Lsn> {
        self.check_active(xid)?;
        nested_top_action::end(&self.inner.log, &self.inner.transactions, xid, nta)
    }

    /// Truncates the log now if enough of it is reclaimable.
    pub fn truncate_now(&self) -> StorageResult<bool> {
        self.check_open()?;
        self.stop_on_io(truncation::truncate_now(
            &self.inner.log,
            &self.inner.buffers,
            &self.inner.transactions,
            &self.inner.truncation_config,
        ))
    }

    pub fn active_transaction_count(&self) -> usize {
        self.inner.transactions.active_count()
    }

    pub fn buffer_stats(&self) -> &BufferStats {
        self.inner.buffers.stats()
    }

    /// What recovery did when the store was opened.
    pub fn recovery_report(&self) -> RecoveryReport {
        self.inner.report.get().cloned().unwrap_or_default()
    }

    pub(crate) fn log(&self) -> &LogManager {
        &self.inner.log
    }

    pub(crate) fn buffers(&self) -> &BufferManager {
        &self.inner.buffers
    }

    pub(crate) fn transactions(&self) -> &TransactionTable {
        &self.inner.transactions
    }

    pub(crate) fn registry(&self) -> &OperationRegistry {
        &self.inner.registry
    }
}
