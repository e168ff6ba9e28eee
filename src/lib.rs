//! # txstore
//!
//! An embeddable transactional storage engine: ACID transactions over fixed
//! size pages, a write-ahead log with group commit, and ARIES-style recovery.
//!
//! # Architecture
//!
//! ```text
//!   TxStore (begin/commit/abort/prepare, alloc/read/set/update, NTAs)
//!      |            |                 |                  |
//!   LockTable  TransactionTable  OperationRegistry   Truncation
//!                   |                 |                  |
//!               LogManager  <---  BufferManager  --->  PageHandle
//!          (tail buffer, group    (frames, policy,     (file, memory,
//!           commit, storage)       dirty pages)         raid0, raid1)
//! ```
//!
//! Every page mutation goes through the [`OperationRegistry`]: the store
//! pins and latches the page, appends an Update entry to the log, runs the
//! operation's forward function and stamps the page LSN. A dirty page is only
//! written back after the log has been forced up to its LSN.
//!
//! ## Log frame format
//!
//! ```text
//! +-----------------+-------------+-----------------------------------+
//! | payload len (4) | crc32 (4)   | payload: type, xid, lsn, prev, .. |
//! +-----------------+-------------+-----------------------------------+
//! ```

use std::fmt;

mod buffer_manager;
mod config;
mod error;
pub mod io;
mod lock_manager;
pub mod log;
mod nested_top_action;
pub mod operations;
mod page;
mod record_page;
mod recovery;
mod replacement;
mod store;
mod transaction_table;
mod truncation;

#[cfg(test)]
mod test_utils;

pub use buffer_manager::{BufferManager, BufferStats, OrderedLatches, PinnedPage};
pub use config::{LogStorageConfig, PageStorageConfig, StoreConfig, TruncationConfig};
pub use error::{ErrorKind, StorageError, StorageResult};
pub use lock_manager::{LockMode, LockTable};
pub use nested_top_action::NestedTopAction;
pub use operations::{
    Inverse, Mutation, OperationArgs, OperationDescriptor, OperationId, OperationRegistry,
    OperationRegistryBuilder,
};
pub use page::{Page, PageType, PAGE_DATA_OFFSET, PAGE_SIZE};
pub use recovery::RecoveryReport;
pub use store::TxStore;
pub use transaction_table::{TransactionState, MAX_TRANSACTIONS};

/// Page identifier: the page lives at byte offset `id * PAGE_SIZE`.
pub type PageId = u64;

/// Transaction identifier.
pub type Xid = i32;

/// Page id used by logical log entries that do not touch a page.
pub const INVALID_PAGE: PageId = u64::MAX;

/// Xid used by log entries that belong to no transaction.
pub const INVALID_XID: Xid = -1;

/// Slot id used by page-level operations.
pub const NO_SLOT: u16 = u16::MAX;

/// Log sequence number.
///
/// LSNs are logical byte offsets into the log, so they increase strictly in
/// append order. `Lsn::ZERO` never names an entry: a freshly zeroed page
/// carries it and is therefore older than every logged change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);
    /// LSN of the first entry of an empty log.
    pub const FIRST: Lsn = Lsn(1);
    pub const MAX: Lsn = Lsn(u64::MAX);

    pub const fn new(raw: u64) -> Self {
        Lsn(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn advance(self, bytes: u64) -> Self {
        Lsn(self.0 + bytes)
    }

    /// Number of log bytes between `earlier` and `self`, zero if `earlier` is newer.
    pub fn distance_from(self, earlier: Lsn) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub(crate) fn encode_opt(lsn: Option<Lsn>) -> u64 {
        lsn.map_or(0, Lsn::get)
    }

    pub(crate) fn decode_opt(raw: u64) -> Option<Lsn> {
        (raw != 0).then_some(Lsn(raw))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a record: its page, its slot within the page and its size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    pub page: PageId,
    pub slot: u16,
    pub size: u32,
}

impl RecordId {
    pub const fn new(page: PageId, slot: u16, size: u32) -> Self {
        Self { page, slot, size }
    }

    /// A record id naming a whole page rather than a slot.
    pub const fn page(page: PageId) -> Self {
        Self {
            page,
            slot: NO_SLOT,
            size: 0,
        }
    }

    /// A record id for logical entries that touch no page.
    pub const fn logical() -> Self {
        Self::page(INVALID_PAGE)
    }

    pub fn is_logical(&self) -> bool {
        self.page == INVALID_PAGE
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_logical() {
            write!(f, "{{logical}}")
        } else {
            write!(f, "{{{} {} {}}}", self.page, self.slot, self.size)
        }
    }
}
