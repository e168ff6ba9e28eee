use std::sync::Arc;

use crate::{
    error::{StorageError, StorageResult},
    io::PageHandle,
    PageId,
};

/// Stripes pages across member handles.
///
/// Pages are grouped into stripes of `stripe_pages` consecutive pages; stripe
/// `s` lives on member `s % members` at member-local stripe `s / members`.
#[derive(Debug)]
pub struct Raid0Handle {
    members: Vec<Arc<dyn PageHandle>>,
    stripe_pages: u64,
}

impl Raid0Handle {
    pub fn new(members: Vec<Arc<dyn PageHandle>>, stripe_pages: u64) -> StorageResult<Self> {
        if members.is_empty() {
            return Err(StorageError::internal("raid0 needs at least one member"));
        }
        if stripe_pages == 0 {
            return Err(StorageError::internal("raid0 stripe width must be positive"));
        }
        Ok(Self {
            members,
            stripe_pages,
        })
    }

    /// Maps a logical page to `(member index, member-local page)`.
    fn locate(&self, page: PageId) -> (usize, PageId) {
        let n = self.members.len() as u64;
        let stripe = page / self.stripe_pages;
        let within = page % self.stripe_pages;
        let member = (stripe % n) as usize;
        let local = (stripe / n) * self.stripe_pages + within;
        (member, local)
    }
}

impl PageHandle for Raid0Handle {
    fn read(&self, page: PageId, buf: &mut [u8]) -> StorageResult<()> {
        let (member, local) = self.locate(page);
        self.members[member].read(local, buf)
    }

    fn write(&self, page: PageId, buf: &[u8]) -> StorageResult<()> {
        let (member, local) = self.locate(page);
        self.members[member].write(local, buf)
    }

    fn force(&self) -> StorageResult<()> {
        self.members.iter().try_for_each(|m| m.force())
    }

    fn page_count(&self) -> StorageResult<u64> {
        let n = self.members.len() as u64;
        let mut count = 0;
        for (index, member) in self.members.iter().enumerate() {
            let local = member.page_count()?;
            if local == 0 {
                continue;
            }
            let last_local = local - 1;
            let stripe = (last_local / self.stripe_pages) * n + index as u64;
            let last = stripe * self.stripe_pages + last_local % self.stripe_pages;
            count = count.max(last + 1);
        }
        Ok(count)
    }

    fn close(&self) -> StorageResult<()> {
        self.members.iter().try_for_each(|m| m.close())
    }
}

#[cfg(test)]
mod raid0_tests {
    use super::*;
    use crate::{io::MemoryHandle, page::PAGE_SIZE};

    fn striped(n: usize, stripe: u64) -> (Vec<MemoryHandle>, Raid0Handle) {
        let members: Vec<MemoryHandle> = (0..n).map(|_| MemoryHandle::new()).collect();
        let handles = members
            .iter()
            .map(|m| Arc::new(m.clone()) as Arc<dyn PageHandle>)
            .collect();
        (members, Raid0Handle::new(handles, stripe).unwrap())
    }

    #[test]
    fn pages_land_on_the_expected_member() {
        let (members, raid) = striped(2, 2);
        for page in 0..8u64 {
            raid.write(page, &vec![page as u8; PAGE_SIZE]).unwrap();
        }
        // Stripes of two pages alternate between members.
        let mut buf = vec![0u8; PAGE_SIZE];
        members[0].read(2, &mut buf).unwrap();
        assert_eq!(buf[0], 4);
        members[1].read(1, &mut buf).unwrap();
        assert_eq!(buf[0], 3);

        for page in 0..8u64 {
            raid.read(page, &mut buf).unwrap();
            assert_eq!(buf[0], page as u8);
        }
        assert_eq!(raid.page_count().unwrap(), 8);
    }

    #[test]
    fn rejects_degenerate_layouts() {
        assert!(Raid0Handle::new(Vec::new(), 4).is_err());
        let member: Arc<dyn PageHandle> = Arc::new(MemoryHandle::new());
        assert!(Raid0Handle::new(vec![member], 0).is_err());
    }
}
