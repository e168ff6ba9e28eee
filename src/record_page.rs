//! Slotted record page.
//!
//! ```text
//! | page header (16) | slot_count | free_upper | free_head | reserved |
//! | line pointers (4 bytes each) ->        free        <- record heap |
//! ```
//!
//! A line pointer packs `offset:16 | length:12 | state:4`. Free line pointers
//! form a singly linked list threaded through their offset field, headed by
//! `free_head`. Records are never moved except by [`RecordPageMut::compact`],
//! which keeps slot ids stable.

use crate::{
    error::{StorageError, StorageResult},
    page::{Page, PageType, PAGE_DATA_OFFSET, PAGE_SIZE},
    PageId,
};

const SLOT_COUNT_OFFSET: usize = PAGE_DATA_OFFSET;
const FREE_UPPER_OFFSET: usize = PAGE_DATA_OFFSET + 2;
const FREE_HEAD_OFFSET: usize = PAGE_DATA_OFFSET + 4;
const DIRECTORY_OFFSET: usize = PAGE_DATA_OFFSET + 8;
const LINE_PTR_BYTES: usize = 4;

/// Sentinel for "no free slot" in `free_head`.
const NO_FREE_SLOT: u16 = 0xFFFF;

/// Largest record a single page can hold.
pub const MAX_RECORD_SIZE: usize = PAGE_SIZE - DIRECTORY_OFFSET - LINE_PTR_BYTES;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LineState {
    Free = 0,
    Live = 1,
}

#[derive(Clone, Copy, Debug)]
struct LinePtr(u32);

impl LinePtr {
    fn new(offset: u16, length: u16, state: LineState) -> Self {
        let mut line_pointer = LinePtr(0);
        line_pointer.set_offset(offset);
        line_pointer.set_length(length);
        line_pointer.set_state(state);
        line_pointer
    }

    fn offset(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    fn length(&self) -> u16 {
        ((self.0 >> 4) & 0x0FFF) as u16
    }

    fn state(&self) -> LineState {
        if self.0 & 0x000F == LineState::Live as u32 {
            LineState::Live
        } else {
            LineState::Free
        }
    }

    fn set_offset(&mut self, offset: u16) {
        self.0 = (self.0 & 0x0000_FFFF) | ((offset as u32) << 16);
    }

    fn set_length(&mut self, length: u16) {
        let length_bits = (length as u32) & 0x0FFF;
        self.0 = (self.0 & 0xFFFF_000F) | (length_bits << 4);
    }

    fn set_state(&mut self, state: LineState) {
        self.0 = (self.0 & 0xFFFF_FFF0) | (state as u32);
    }

    fn is_live(&self) -> bool {
        self.state() == LineState::Live
    }
}

fn line_ptr_offset(slot: u16) -> usize {
    DIRECTORY_OFFSET + slot as usize * LINE_PTR_BYTES
}

/// Read-only view of a record page.
pub(crate) struct RecordPageView<'a> {
    page: &'a Page,
}

impl<'a> RecordPageView<'a> {
    pub(crate) fn new(page: &'a Page) -> StorageResult<Self> {
        expect_record_page(page)?;
        Ok(Self { page })
    }

    pub(crate) fn slot_count(&self) -> u16 {
        read_u16(self.page, SLOT_COUNT_OFFSET)
    }

    fn free_upper(&self) -> usize {
        read_u16_or_page_end(self.page, FREE_UPPER_OFFSET)
    }

    fn free_head(&self) -> u16 {
        read_u16(self.page, FREE_HEAD_OFFSET)
    }

    fn line_ptr(&self, slot: u16) -> Option<LinePtr> {
        if slot >= self.slot_count() {
            return None;
        }
        self.page.read_u32(line_ptr_offset(slot)).ok().map(LinePtr)
    }

    fn directory_end(&self) -> usize {
        line_ptr_offset(self.slot_count())
    }

    fn live_bytes(&self) -> usize {
        (0..self.slot_count())
            .filter_map(|slot| self.line_ptr(slot))
            .filter(LinePtr::is_live)
            .map(|lp| lp.length() as usize)
            .sum()
    }

    /// Bytes between the slot directory and the record heap.
    pub(crate) fn contiguous_free(&self) -> usize {
        self.free_upper().saturating_sub(self.directory_end())
    }

    /// Bytes available after compaction.
    pub(crate) fn free_space(&self) -> usize {
        PAGE_SIZE - self.directory_end() - self.live_bytes()
    }

    /// Slots a new record of `size` bytes could take, in the order they
    /// should be tried: the free list, then one fresh slot past the end of
    /// the directory.
    pub(crate) fn candidate_slots(&self, size: usize) -> Vec<u16> {
        if size > MAX_RECORD_SIZE {
            return Vec::new();
        }
        let free_space = self.free_space();
        let mut slots = Vec::new();
        if free_space >= size {
            let mut current = self.free_head();
            // Bounded so a damaged list cannot loop forever.
            for _ in 0..self.slot_count() {
                let Some(line_pointer) = self.line_ptr(current) else {
                    break;
                };
                slots.push(current);
                current = line_pointer.offset();
            }
        }
        let fresh = self.slot_count();
        if fresh != NO_FREE_SLOT && free_space >= size + LINE_PTR_BYTES {
            slots.push(fresh);
        }
        slots
    }

    #[cfg(test)]
    pub(crate) fn fits(&self, size: usize) -> bool {
        !self.candidate_slots(size).is_empty()
    }

    pub(crate) fn is_live(&self, slot: u16) -> bool {
        self.line_ptr(slot).is_some_and(|lp| lp.is_live())
    }

    pub(crate) fn record(&self, slot: u16) -> StorageResult<&'a [u8]> {
        let line_pointer = self
            .line_ptr(slot)
            .filter(LinePtr::is_live)
            .ok_or_else(|| dead_slot(self.page.id(), slot))?;
        self.page.read(
            line_pointer.offset() as usize,
            line_pointer.length() as usize,
        )
    }
}

/// Mutable view of a record page.
pub(crate) struct RecordPageMut<'a> {
    page: &'a mut Page,
}

impl<'a> RecordPageMut<'a> {
    pub(crate) fn new(page: &'a mut Page) -> StorageResult<Self> {
        expect_record_page(page)?;
        Ok(Self { page })
    }

    /// Formats `page` as an empty record page. The LSN is preserved.
    pub(crate) fn format(page: &'a mut Page) -> StorageResult<Self> {
        page.clear_contents();
        page.set_page_type(PageType::Record);
        page.write_u16(SLOT_COUNT_OFFSET, 0)?;
        // PAGE_SIZE does not fit in u16; zero encodes "end of page".
        page.write_u16(FREE_UPPER_OFFSET, 0)?;
        page.write_u16(FREE_HEAD_OFFSET, NO_FREE_SLOT)?;
        Ok(Self { page })
    }

    pub(crate) fn view(&self) -> RecordPageView<'_> {
        RecordPageView { page: self.page }
    }

    fn set_slot_count(&mut self, count: u16) -> StorageResult<()> {
        self.page.write_u16(SLOT_COUNT_OFFSET, count)
    }

    fn set_free_upper(&mut self, upper: usize) -> StorageResult<()> {
        let encoded = if upper == PAGE_SIZE { 0 } else { upper as u16 };
        self.page.write_u16(FREE_UPPER_OFFSET, encoded)
    }

    fn set_free_head(&mut self, head: u16) -> StorageResult<()> {
        self.page.write_u16(FREE_HEAD_OFFSET, head)
    }

    fn set_line_ptr(&mut self, slot: u16, line_pointer: LinePtr) -> StorageResult<()> {
        self.page.write_u32(line_ptr_offset(slot), line_pointer.0)
    }

    fn push_free_slot(&mut self, slot: u16) -> StorageResult<()> {
        let next = self.view().free_head();
        self.set_line_ptr(slot, LinePtr::new(next, 0, LineState::Free))?;
        self.set_free_head(slot)
    }

    /// Removes `slot` from the free list. The slot must be on it.
    fn unlink_free_slot(&mut self, slot: u16) -> StorageResult<()> {
        let page_id = self.page.id();
        let mut previous: Option<u16> = None;
        let mut current = self.view().free_head();
        while current != NO_FREE_SLOT {
            let line_pointer = self
                .view()
                .line_ptr(current)
                .ok_or_else(|| StorageError::internal(format!("free list of page {page_id} is broken")))?;
            let next = line_pointer.offset();
            if current == slot {
                match previous {
                    None => self.set_free_head(next)?,
                    Some(prev) => {
                        self.set_line_ptr(prev, LinePtr::new(next, 0, LineState::Free))?
                    }
                }
                return Ok(());
            }
            previous = Some(current);
            current = next;
        }
        Err(StorageError::internal(format!(
            "slot {slot} of page {page_id} is not on the free list"
        )))
    }

    /// Allocates a record of `size` bytes, reusing a freed slot when possible.
    #[cfg(test)]
    pub(crate) fn alloc_slot(&mut self, size: usize) -> StorageResult<u16> {
        if size > MAX_RECORD_SIZE {
            return Err(StorageError::RecordTooLarge {
                size,
                max: MAX_RECORD_SIZE,
            });
        }
        let slot = self
            .view()
            .candidate_slots(size)
            .first()
            .copied()
            .ok_or(StorageError::PageFull {
                page: self.page.id(),
                size,
            })?;
        self.alloc_at(slot, size)?;
        Ok(slot)
    }

    /// Allocates `slot` with `size` zeroed bytes. Allocating a slot that is
    /// already live with the same size is a no-op, which keeps redo
    /// idempotent.
    pub(crate) fn alloc_at(&mut self, slot: u16, size: usize) -> StorageResult<()> {
        if size > MAX_RECORD_SIZE {
            return Err(StorageError::RecordTooLarge {
                size,
                max: MAX_RECORD_SIZE,
            });
        }
        if slot == NO_FREE_SLOT {
            return Err(StorageError::internal("slot id is reserved"));
        }
        let page_id = self.page.id();
        if let Some(line_pointer) = self.view().line_ptr(slot) {
            if line_pointer.is_live() {
                if line_pointer.length() as usize == size {
                    return Ok(());
                }
                return Err(StorageError::internal(format!(
                    "slot {slot} of page {page_id} is live with size {}",
                    line_pointer.length()
                )));
            }
        }

        let count = self.view().slot_count();
        let growth = if slot >= count {
            (slot - count + 1) as usize * LINE_PTR_BYTES
        } else {
            0
        };
        if self.view().free_space() < growth + size {
            return Err(StorageError::PageFull {
                page: page_id,
                size,
            });
        }
        if self.view().contiguous_free() < growth + size {
            self.compact()?;
        }

        if slot >= count {
            self.set_slot_count(slot + 1)?;
            // Pushed highest first so lower slots are reused first.
            for fresh in (count..=slot).rev() {
                self.push_free_slot(fresh)?;
            }
        }
        self.unlink_free_slot(slot)?;

        let upper = self.view().free_upper() - size;
        self.page.slice_mut(upper, size)?.fill(0);
        self.set_line_ptr(slot, LinePtr::new(upper as u16, size as u16, LineState::Live))?;
        self.set_free_upper(upper)
    }

    /// Frees a live slot. Its bytes are reclaimed by the next compaction.
    pub(crate) fn free_slot(&mut self, slot: u16) -> StorageResult<()> {
        if !self.view().is_live(slot) {
            return Err(dead_slot(self.page.id(), slot));
        }
        self.push_free_slot(slot)
    }

    pub(crate) fn record_mut(&mut self, slot: u16) -> StorageResult<&mut [u8]> {
        let line_pointer = self
            .view()
            .line_ptr(slot)
            .filter(LinePtr::is_live)
            .ok_or_else(|| dead_slot(self.page.id(), slot))?;
        self.page.slice_mut(
            line_pointer.offset() as usize,
            line_pointer.length() as usize,
        )
    }

    /// Like [`RecordPageMut::record_mut`], but keeps the page borrow.
    pub(crate) fn into_record_mut(self, slot: u16) -> StorageResult<&'a mut [u8]> {
        let line_pointer = self
            .view()
            .line_ptr(slot)
            .filter(LinePtr::is_live)
            .ok_or_else(|| dead_slot(self.page.id(), slot))?;
        let page = self.page;
        page.slice_mut(
            line_pointer.offset() as usize,
            line_pointer.length() as usize,
        )
    }

    /// Packs live records against the end of the page. Slot ids do not change.
    pub(crate) fn compact(&mut self) -> StorageResult<()> {
        let view = self.view();
        let mut live = Vec::new();
        for slot in 0..view.slot_count() {
            if view.is_live(slot) {
                live.push((slot, view.record(slot)?.to_vec()));
            }
        }
        let mut upper = PAGE_SIZE;
        for (slot, bytes) in live {
            upper -= bytes.len();
            self.page.write(upper, &bytes)?;
            self.set_line_ptr(
                slot,
                LinePtr::new(upper as u16, bytes.len() as u16, LineState::Live),
            )?;
        }
        self.set_free_upper(upper)
    }
}

fn expect_record_page(page: &Page) -> StorageResult<()> {
    match page.page_type()? {
        PageType::Record => Ok(()),
        other => Err(StorageError::internal(format!(
            "page {} is {:?}, not a record page",
            page.id(),
            other
        ))),
    }
}

fn dead_slot(page: PageId, slot: u16) -> StorageError {
    StorageError::invalid_record(
        crate::RecordId::new(page, slot, 0),
        "slot does not hold a live record",
    )
}

fn read_u16(page: &Page, offset: usize) -> u16 {
    page.read_u16(offset).unwrap_or(0)
}

fn read_u16_or_page_end(page: &Page, offset: usize) -> usize {
    match read_u16(page, offset) {
        0 => PAGE_SIZE,
        upper => upper as usize,
    }
}

#[cfg(test)]
mod line_ptr_tests {
    use super::*;

    #[test]
    fn fields_are_independent() {
        let mut lp = LinePtr::new(0x1234, 0x0567, LineState::Live);
        assert_eq!(lp.offset(), 0x1234);
        assert_eq!(lp.length(), 0x0567);
        assert_eq!(lp.state(), LineState::Live);

        lp.set_offset(0xBBBB);
        assert_eq!(lp.length(), 0x0567);
        assert_eq!(lp.state(), LineState::Live);

        lp.set_state(LineState::Free);
        assert_eq!(lp.offset(), 0xBBBB);
        assert_eq!(lp.length(), 0x0567);
    }

    #[test]
    fn length_is_clamped_to_12_bits() {
        let mut lp = LinePtr(0);
        lp.set_length(0xFFFF);
        assert_eq!(lp.length(), 0x0FFF);
    }
}
