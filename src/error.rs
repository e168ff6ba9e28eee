//! Error types for the storage engine.
//!
//! Every fallible call returns [`StorageResult`]. Errors are grouped into the
//! five kinds callers are expected to reason about (see [`ErrorKind`]): I/O and
//! internal errors are fatal for the running process, because crash recovery
//! on the next open is the real recovery path; deadlocks and invalid
//! transactions are reported to the caller, which retries or aborts.

use std::{io, time::Duration};

use thiserror::Error;

use crate::{Lsn, PageId, RecordId, Xid};

/// Result type for storage engine operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Coarse classification of a [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A lock request timed out.
    Deadlock,
    /// A fixed-size resource (buffer pool, transaction table, page) ran out.
    OutOfMemory,
    /// The backing page store or log failed.
    Io,
    /// An invariant was violated.
    Internal,
    /// The transaction id is unknown or no longer active.
    InvalidTransaction,
}

/// Errors produced by the storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Lock wait exceeded the configured timeout.
    #[error("deadlock: xid {xid} waited {waited:?} for a lock on {rid}")]
    Deadlock {
        xid: Xid,
        rid: RecordId,
        waited: Duration,
    },

    /// I/O error on the page store or the log.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Every frame in the buffer pool is pinned.
    #[error("buffer pool exhausted: all {frames} frames are pinned")]
    BufferPoolExhausted { frames: usize },

    /// The transaction table has no free slot.
    #[error("too many active transactions (limit {limit})")]
    TooManyTransactions { limit: usize },

    /// A record does not fit in a page.
    #[error("record of {size} bytes exceeds the maximum of {max} bytes")]
    RecordTooLarge { size: usize, max: usize },

    /// The page has no room for the requested record.
    #[error("page {page} has no room for a {size} byte record")]
    PageFull { page: PageId, size: usize },

    /// The transaction id is not active.
    #[error("transaction {xid} is not active")]
    InvalidTransaction { xid: Xid },

    /// A record id does not name a live record.
    #[error("invalid record {rid}: {reason}")]
    InvalidRecord { rid: RecordId, reason: String },

    /// An access fell outside the page bounds.
    #[error("page access out of bounds: offset {offset} len {len}")]
    PageBounds { offset: usize, len: usize },

    /// The page checksum did not match its contents.
    #[error("page {page} checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    PageCorrupted {
        page: PageId,
        stored: u32,
        computed: u32,
    },

    /// The log contains an inconsistency that is not a torn tail.
    #[error("log corrupted at LSN {lsn}: {reason}")]
    LogCorrupted { lsn: Lsn, reason: String },

    /// No operation is registered under this id.
    #[error("unknown operation id {op}")]
    UnknownOperation { op: u16 },

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Creates an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Creates an invalid-record error.
    pub fn invalid_record(rid: RecordId, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            rid,
            reason: reason.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corrupted(lsn: Lsn, reason: impl Into<String>) -> Self {
        Self::LogCorrupted {
            lsn,
            reason: reason.into(),
        }
    }

    /// Returns the error's kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Deadlock { .. } => ErrorKind::Deadlock,
            Self::BufferPoolExhausted { .. }
            | Self::TooManyTransactions { .. }
            | Self::RecordTooLarge { .. }
            | Self::PageFull { .. } => ErrorKind::OutOfMemory,
            Self::Io { .. } => ErrorKind::Io,
            Self::InvalidTransaction { .. } => ErrorKind::InvalidTransaction,
            Self::InvalidRecord { .. }
            | Self::PageBounds { .. }
            | Self::PageCorrupted { .. }
            | Self::LogCorrupted { .. }
            | Self::UnknownOperation { .. }
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if the process should stop using the store.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Io | ErrorKind::Internal)
    }

    /// Returns true if the caller may retry the transaction.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Deadlock | ErrorKind::InvalidTransaction
        )
    }
}
