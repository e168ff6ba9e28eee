use parking_lot::RwLockWriteGuard;

use crate::{buffer_manager::PinnedPage, Page, PageId};

/// Write latches over several pinned pages, taken in ascending page id order.
///
/// Holding more than one page latch any other way can deadlock against a
/// thread that takes the same latches in a different order.
pub struct OrderedLatches<'a> {
    guards: Vec<(PageId, RwLockWriteGuard<'a, Page>)>,
}

impl<'a> OrderedLatches<'a> {
    /// Latches every page in `pages`. Duplicate page ids are latched once.
    pub fn acquire(pages: &'a [PinnedPage]) -> Self {
        let mut ordered: Vec<&'a PinnedPage> = pages.iter().collect();
        ordered.sort_by_key(|pinned| pinned.page_id());
        ordered.dedup_by_key(|pinned| pinned.page_id());
        let guards = ordered
            .into_iter()
            .map(|pinned| (pinned.page_id(), pinned.write()))
            .collect();
        Self { guards }
    }

    /// Latched page ids, ascending.
    pub fn page_ids(&self) -> Vec<PageId> {
        self.guards.iter().map(|(id, _)| *id).collect()
    }

    pub fn page_mut(&mut self, page: PageId) -> Option<&mut Page> {
        self.guards
            .binary_search_by_key(&page, |(id, _)| *id)
            .ok()
            .map(|pos| &mut *self.guards[pos].1)
    }
}
