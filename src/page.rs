use std::fmt;

use crc32fast::Hasher;

use crate::{
    error::{StorageError, StorageResult},
    Lsn, PageId,
};

/// Size of every page in bytes.
pub const PAGE_SIZE: usize = 4096;

const LSN_OFFSET: usize = 0;
const TYPE_OFFSET: usize = 8;
const CRC_OFFSET: usize = 12;

/// First byte after the fixed page header.
pub const PAGE_DATA_OFFSET: usize = 16;

#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageType {
    Uninitialized = 0,
    Header = 1,
    Record = 2,
    Raw = 3,
}

impl TryFrom<u16> for PageType {
    type Error = StorageError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PageType::Uninitialized),
            1 => Ok(PageType::Header),
            2 => Ok(PageType::Record),
            3 => Ok(PageType::Raw),
            other => Err(StorageError::internal(format!(
                "unknown page type tag {other}"
            ))),
        }
    }
}

/// In-memory image of one page.
///
/// Header layout: LSN (8 bytes), page type (2), reserved (2), crc32 (4).
/// The dirty flag lives outside the byte image and is never written to disk.
#[derive(Clone)]
pub struct Page {
    id: PageId,
    bytes: Box<[u8]>,
    dirty: bool,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("lsn", &self.lsn())
            .field("type", &self.page_type().ok())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl Page {
    pub fn new(id: PageId) -> Self {
        Self {
            id,
            bytes: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            dirty: false,
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub(crate) fn reset(&mut self, id: PageId) {
        self.id = id;
        self.bytes.fill(0);
        self.dirty = false;
    }

    pub fn lsn(&self) -> Lsn {
        Lsn::new(self.read_u64_unchecked(LSN_OFFSET))
    }

    /// Stamps the page LSN. The LSN never moves backwards.
    pub(crate) fn set_lsn(&mut self, lsn: Lsn) {
        if lsn > self.lsn() {
            self.bytes[LSN_OFFSET..LSN_OFFSET + 8].copy_from_slice(&lsn.get().to_be_bytes());
        }
    }

    pub fn page_type(&self) -> StorageResult<PageType> {
        let raw = u16::from_be_bytes([self.bytes[TYPE_OFFSET], self.bytes[TYPE_OFFSET + 1]]);
        PageType::try_from(raw)
    }

    pub(crate) fn set_page_type(&mut self, page_type: PageType) {
        self.bytes[TYPE_OFFSET..TYPE_OFFSET + 2].copy_from_slice(&(page_type as u16).to_be_bytes());
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn check_bounds(offset: usize, len: usize) -> StorageResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= PAGE_SIZE => Ok(()),
            _ => Err(StorageError::PageBounds { offset, len }),
        }
    }

    /// Returns `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> StorageResult<&[u8]> {
        Self::check_bounds(offset, len)?;
        Ok(&self.bytes[offset..offset + len])
    }

    pub(crate) fn slice_mut(&mut self, offset: usize, len: usize) -> StorageResult<&mut [u8]> {
        Self::check_bounds(offset, len)?;
        Ok(&mut self.bytes[offset..offset + len])
    }

    /// Copies `data` into the page at `offset`.
    pub(crate) fn write(&mut self, offset: usize, data: &[u8]) -> StorageResult<()> {
        self.slice_mut(offset, data.len())?.copy_from_slice(data);
        Ok(())
    }

    pub fn read_u16(&self, offset: usize) -> StorageResult<u16> {
        let bytes = self.read(offset, 2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn write_u16(&mut self, offset: usize, value: u16) -> StorageResult<()> {
        self.write(offset, &value.to_be_bytes())
    }

    pub fn read_u32(&self, offset: usize) -> StorageResult<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.read(offset, 4)?);
        Ok(u32::from_be_bytes(buf))
    }

    pub(crate) fn write_u32(&mut self, offset: usize, value: u32) -> StorageResult<()> {
        self.write(offset, &value.to_be_bytes())
    }

    pub fn read_u64(&self, offset: usize) -> StorageResult<u64> {
        Self::check_bounds(offset, 8)?;
        Ok(self.read_u64_unchecked(offset))
    }

    pub(crate) fn write_u64(&mut self, offset: usize, value: u64) -> StorageResult<()> {
        self.write(offset, &value.to_be_bytes())
    }

    fn read_u64_unchecked(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[offset..offset + 8]);
        u64::from_be_bytes(buf)
    }

    /// Clears everything after the LSN, leaving an uninitialized page that
    /// keeps its LSN.
    pub(crate) fn clear_contents(&mut self) {
        self.bytes[TYPE_OFFSET..].fill(0);
    }

    fn compute_crc32(&self) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&self.bytes[..CRC_OFFSET]);
        hasher.update(&self.bytes[CRC_OFFSET + 4..]);
        hasher.finalize()
    }

    pub(crate) fn update_crc32(&mut self) {
        let crc = self.compute_crc32();
        self.bytes[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());
    }

    /// Verifies the stored checksum. A page that was never written (all
    /// zeros) is valid.
    pub(crate) fn verify_crc32(&self) -> StorageResult<()> {
        let mut stored = [0u8; 4];
        stored.copy_from_slice(&self.bytes[CRC_OFFSET..CRC_OFFSET + 4]);
        let stored = u32::from_be_bytes(stored);
        if stored == 0 && self.bytes.iter().all(|b| *b == 0) {
            return Ok(());
        }
        let computed = self.compute_crc32();
        if stored != computed {
            return Err(StorageError::PageCorrupted {
                page: self.id,
                stored,
                computed,
            });
        }
        Ok(())
    }
}
