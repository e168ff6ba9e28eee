use std::sync::Arc;

use crate::{error::StorageResult, io::PageHandle, PageId};

/// Mirrors every write and force to two members. Reads go to the primary.
#[derive(Debug)]
pub struct Raid1Handle {
    primary: Arc<dyn PageHandle>,
    mirror: Arc<dyn PageHandle>,
}

impl Raid1Handle {
    pub fn new(primary: Arc<dyn PageHandle>, mirror: Arc<dyn PageHandle>) -> Self {
        Self { primary, mirror }
    }
}

impl PageHandle for Raid1Handle {
    fn read(&self, page: PageId, buf: &mut [u8]) -> StorageResult<()> {
        self.primary.read(page, buf)
    }

    fn write(&self, page: PageId, buf: &[u8]) -> StorageResult<()> {
        self.primary.write(page, buf)?;
        self.mirror.write(page, buf)
    }

    fn force(&self) -> StorageResult<()> {
        self.primary.force()?;
        self.mirror.force()
    }

    fn page_count(&self) -> StorageResult<u64> {
        self.primary.page_count()
    }

    fn close(&self) -> StorageResult<()> {
        self.primary.close()?;
        self.mirror.close()
    }
}

#[cfg(test)]
mod raid1_tests {
    use super::*;
    use crate::{io::MemoryHandle, page::PAGE_SIZE};

    #[test]
    fn writes_reach_both_members() {
        let primary = MemoryHandle::new();
        let mirror = MemoryHandle::new();
        let raid = Raid1Handle::new(Arc::new(primary.clone()), Arc::new(mirror.clone()));
        raid.write(5, &vec![8u8; PAGE_SIZE]).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        mirror.read(5, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 8));
        primary.read(5, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 8));
        assert_eq!(raid.page_count().unwrap(), 6);
    }
}
