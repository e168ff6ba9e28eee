use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::{Lsn, PageId};

/// Dirty page table: page id to recLSN, the LSN of the first change since
/// the page was last written back.
#[derive(Debug, Default)]
pub(crate) struct DirtyPages {
    pages: Mutex<BTreeMap<PageId, Lsn>>,
}

impl DirtyPages {
    /// Records `rec_lsn` for `page` unless the page is already dirty.
    pub(crate) fn insert(&self, page: PageId, rec_lsn: Lsn) {
        self.pages.lock().entry(page).or_insert(rec_lsn);
    }

    pub(crate) fn remove(&self, page: PageId) {
        self.pages.lock().remove(&page);
    }

    pub(crate) fn rec_lsn(&self, page: PageId) -> Option<Lsn> {
        self.pages.lock().get(&page).copied()
    }

    pub(crate) fn min_rec_lsn(&self) -> Option<Lsn> {
        self.pages.lock().values().min().copied()
    }

    /// Minimum of the smallest recLSN and `others()`, with `others` run
    /// while the table is locked so no page can turn dirty in between.
    /// `others` must not mark pages dirty.
    pub(crate) fn min_rec_lsn_with(&self, others: impl FnOnce() -> Option<Lsn>) -> Option<Lsn> {
        let pages = self.pages.lock();
        let dirty = pages.values().min().copied();
        match (dirty, others()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Dirty page ids in ascending order.
    pub(crate) fn page_ids(&self) -> Vec<PageId> {
        self.pages.lock().keys().copied().collect()
    }

    pub(crate) fn clear(&self) {
        self.pages.lock().clear();
    }
}

#[cfg(test)]
mod dirty_pages_tests {
    use super::*;

    #[test]
    fn first_rec_lsn_wins() {
        let dirty = DirtyPages::default();
        dirty.insert(4, Lsn::new(100));
        dirty.insert(4, Lsn::new(200));
        dirty.insert(2, Lsn::new(150));
        assert_eq!(dirty.rec_lsn(4), Some(Lsn::new(100)));
        assert_eq!(dirty.min_rec_lsn(), Some(Lsn::new(100)));
        assert_eq!(dirty.page_ids(), vec![2, 4]);

        dirty.remove(4);
        assert_eq!(dirty.min_rec_lsn(), Some(Lsn::new(150)));
        assert_eq!(dirty.count(), 1);
        dirty.clear();
        assert_eq!(dirty.min_rec_lsn(), None);
    }

    #[test]
    fn combined_minimum_is_taken_under_the_table_lock() {
        let dirty = DirtyPages::default();
        assert_eq!(dirty.min_rec_lsn_with(|| None), None);
        dirty.insert(3, Lsn::new(300));
        let min = dirty.min_rec_lsn_with(|| {
            // A concurrent mark_dirty would block here.
            assert!(dirty.pages.try_lock().is_none());
            Some(Lsn::new(120))
        });
        assert_eq!(min, Some(Lsn::new(120)));
        assert_eq!(dirty.min_rec_lsn_with(|| Some(Lsn::new(900))), Some(Lsn::new(300)));
    }
}
