//! Page handles: the I/O backends the buffer manager reads and writes pages
//! through.
//!
//! Page `p` lives at byte offset `p * PAGE_SIZE`. Reads past the end of the
//! store yield zeroed pages, so a page that was never written looks like an
//! uninitialized page with LSN zero.

use std::fmt::Debug;

use crate::{error::StorageResult, page::PAGE_SIZE, PageId};

mod file;
mod memory;
mod raid0;
mod raid1;
mod recording;

pub use file::FileHandle;
pub(crate) use file::{read_full_at, sync_data, write_all_at};
pub use memory::MemoryHandle;
pub use raid0::Raid0Handle;
pub use raid1::Raid1Handle;
pub use recording::{HandleOp, RecordedWrite, RecordingHandle};

/// A page-addressed storage backend.
pub trait PageHandle: Send + Sync + Debug {
    /// Reads page `page` into `buf`, which must be `PAGE_SIZE` bytes.
    fn read(&self, page: PageId, buf: &mut [u8]) -> StorageResult<()>;

    /// Writes `buf` (`PAGE_SIZE` bytes) as page `page`.
    fn write(&self, page: PageId, buf: &[u8]) -> StorageResult<()>;

    /// Makes every completed write durable.
    fn force(&self) -> StorageResult<()>;

    /// Number of pages the store currently spans.
    fn page_count(&self) -> StorageResult<u64>;

    /// Forces and releases the backend. Further calls may fail.
    fn close(&self) -> StorageResult<()>;
}

pub(crate) fn page_offset(page: PageId) -> u64 {
    page * PAGE_SIZE as u64
}

pub(crate) fn check_page_buffer(len: usize) -> StorageResult<()> {
    if len != PAGE_SIZE {
        return Err(crate::StorageError::internal(format!(
            "page buffer is {len} bytes, expected {PAGE_SIZE}"
        )));
    }
    Ok(())
}
