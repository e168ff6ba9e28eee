use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::{
    error::StorageResult,
    io::{check_page_buffer, PageHandle},
    PageId,
};

/// In-memory page store.
///
/// Clones share the same pages, so a test can keep a clone, drop the store
/// without flushing, and reopen over the surviving pages.
#[derive(Clone, Debug, Default)]
pub struct MemoryHandle {
    pages: Arc<Mutex<HashMap<PageId, Box<[u8]>>>>,
}

impl MemoryHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages that have been written at least once.
    pub fn written_pages(&self) -> usize {
        self.pages.lock().len()
    }
}

impl PageHandle for MemoryHandle {
    fn read(&self, page: PageId, buf: &mut [u8]) -> StorageResult<()> {
        check_page_buffer(buf.len())?;
        match self.pages.lock().get(&page) {
            Some(bytes) => buf.copy_from_slice(bytes),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write(&self, page: PageId, buf: &[u8]) -> StorageResult<()> {
        check_page_buffer(buf.len())?;
        self.pages.lock().insert(page, buf.into());
        Ok(())
    }

    fn force(&self) -> StorageResult<()> {
        Ok(())
    }

    fn page_count(&self) -> StorageResult<u64> {
        Ok(self
            .pages
            .lock()
            .keys()
            .max()
            .map_or(0, |max| max + 1))
    }

    fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod memory_handle_tests {
    use super::*;
    use crate::page::PAGE_SIZE;

    #[test]
    fn clones_share_pages() {
        let handle = MemoryHandle::new();
        let survivor = handle.clone();
        handle.write(2, &vec![3u8; PAGE_SIZE]).unwrap();
        drop(handle);

        let mut buf = vec![0u8; PAGE_SIZE];
        survivor.read(2, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 3));
        assert_eq!(survivor.page_count().unwrap(), 3);
        assert_eq!(survivor.written_pages(), 1);
    }
}
