//! Built-in operations.
//!
//! Record operations address `rid.slot` on a record page and require the
//! record to be exactly `rid.size` bytes. Argument layouts:
//!
//! | operation | args |
//! |-----------|------|
//! | `SET` / `SET_INVERSE` | new bytes, old bytes |
//! | `SET_RANGE` / `SET_RANGE_INVERSE` | offset u32, new bytes, old bytes |
//! | `PAGE_SET_RANGE` / `PAGE_SET_RANGE_INVERSE` | page offset u32, new bytes, old bytes |
//! | `INCREMENT` / `DECREMENT` | none |
//! | `ALLOC` | none |
//! | `DEALLOC` / `REALLOC` | record contents before the dealloc |
//! | `INITIALIZE_PAGE` | page type u16 |
//! | `UPDATE_RECORDS` / `RESTORE_RECORDS` | see [`encode_records`] |

use std::ops::Range;

use crate::{
    error::{StorageError, StorageResult},
    operations::{Inverse, Mutation, OperationArgs, OperationDescriptor, OperationId},
    page::{Page, PageType, PAGE_DATA_OFFSET, PAGE_SIZE},
    record_page::{RecordPageMut, RecordPageView},
    store::TxStore,
    RecordId, Xid,
};

pub const SET: OperationId = 0;
pub const SET_INVERSE: OperationId = 1;
pub const INCREMENT: OperationId = 2;
pub const DECREMENT: OperationId = 3;
pub const ALLOC: OperationId = 4;
pub const DEALLOC: OperationId = 5;
pub const REALLOC: OperationId = 6;
pub const NOOP: OperationId = 7;
pub const SET_RANGE: OperationId = 8;
pub const SET_RANGE_INVERSE: OperationId = 9;
pub const PAGE_SET_RANGE: OperationId = 10;
pub const PAGE_SET_RANGE_INVERSE: OperationId = 11;
pub const INITIALIZE_PAGE: OperationId = 12;
pub const RESTORE_RECORDS: OperationId = 13;
pub const UPDATE_RECORDS: OperationId = 14;

fn physical(
    id: OperationId,
    name: &'static str,
    page_type: Option<PageType>,
    undo: Inverse,
    f: super::PhysicalFn,
) -> OperationDescriptor {
    OperationDescriptor {
        id,
        name,
        page_type,
        redo: id,
        undo,
        mutation: Mutation::Physical(f),
    }
}

fn logical(id: OperationId, name: &'static str, undo: OperationId, f: super::LogicalFn) -> OperationDescriptor {
    OperationDescriptor {
        id,
        name,
        page_type: None,
        redo: id,
        undo: Inverse::Operation(undo),
        mutation: Mutation::Logical(f),
    }
}

pub(crate) fn descriptors() -> Vec<OperationDescriptor> {
    let record = Some(PageType::Record);
    vec![
        physical(SET, "set", record, Inverse::Operation(SET_INVERSE), set_new),
        physical(SET_INVERSE, "set_inverse", record, Inverse::Operation(SET), set_old),
        physical(INCREMENT, "increment", record, Inverse::Operation(DECREMENT), increment),
        physical(DECREMENT, "decrement", record, Inverse::Operation(INCREMENT), decrement),
        physical(ALLOC, "alloc", record, Inverse::Operation(DEALLOC), alloc),
        physical(DEALLOC, "dealloc", record, Inverse::Operation(REALLOC), dealloc),
        physical(REALLOC, "realloc", record, Inverse::Operation(DEALLOC), realloc),
        logical(NOOP, "noop", NOOP, noop),
        physical(SET_RANGE, "set_range", record, Inverse::Operation(SET_RANGE_INVERSE), set_range_new),
        physical(SET_RANGE_INVERSE, "set_range_inverse", record, Inverse::Operation(SET_RANGE), set_range_old),
        physical(PAGE_SET_RANGE, "page_set_range", None, Inverse::Operation(PAGE_SET_RANGE_INVERSE), page_set_range_new),
        physical(PAGE_SET_RANGE_INVERSE, "page_set_range_inverse", None, Inverse::Operation(PAGE_SET_RANGE), page_set_range_old),
        physical(INITIALIZE_PAGE, "initialize_page", None, Inverse::PreImage(whole_page), initialize_page),
        logical(RESTORE_RECORDS, "restore_records", UPDATE_RECORDS, restore_records),
        logical(UPDATE_RECORDS, "update_records", RESTORE_RECORDS, noop),
    ]
}

fn record_mut<'p>(args: &OperationArgs<'_>, page: &'p mut Page) -> StorageResult<&'p mut [u8]> {
    let rid = args.rid;
    let record = RecordPageMut::new(page)?.into_record_mut(rid.slot)?;
    if record.len() != rid.size as usize {
        return Err(StorageError::invalid_record(
            rid,
            format!("record holds {} bytes", record.len()),
        ));
    }
    Ok(record)
}

/// Splits `new ++ old` into its halves.
fn halves(args: &[u8]) -> StorageResult<(&[u8], &[u8])> {
    if args.len() % 2 != 0 {
        return Err(StorageError::internal("set arguments must hold new and old bytes"));
    }
    Ok(args.split_at(args.len() / 2))
}

/// Splits `offset u32 ++ new ++ old`.
fn ranged(args: &[u8]) -> StorageResult<(usize, &[u8], &[u8])> {
    if args.len() < 4 {
        return Err(StorageError::internal("range arguments lack an offset"));
    }
    let (offset, rest) = args.split_at(4);
    let offset = u32::from_be_bytes([offset[0], offset[1], offset[2], offset[3]]) as usize;
    let (new, old) = halves(rest)?;
    Ok((offset, new, old))
}

fn overwrite_record(args: &OperationArgs<'_>, page: &mut Page, bytes: &[u8]) -> StorageResult<()> {
    let record = record_mut(args, page)?;
    if record.len() != bytes.len() {
        return Err(StorageError::invalid_record(
            args.rid,
            format!("{} bytes do not fit a {} byte record", bytes.len(), record.len()),
        ));
    }
    record.copy_from_slice(bytes);
    Ok(())
}

fn set_new(args: &OperationArgs<'_>, page: &mut Page) -> StorageResult<()> {
    let (new, _) = halves(args.args)?;
    overwrite_record(args, page, new)
}

fn set_old(args: &OperationArgs<'_>, page: &mut Page) -> StorageResult<()> {
    let (_, old) = halves(args.args)?;
    overwrite_record(args, page, old)
}

fn add_to_i32(args: &OperationArgs<'_>, page: &mut Page, delta: i32) -> StorageResult<()> {
    let record = record_mut(args, page)?;
    let Ok(bytes) = <&mut [u8; 4]>::try_from(record) else {
        return Err(StorageError::invalid_record(args.rid, "counter records are 4 bytes"));
    };
    let value = i32::from_be_bytes(*bytes).wrapping_add(delta);
    *bytes = value.to_be_bytes();
    Ok(())
}

fn increment(args: &OperationArgs<'_>, page: &mut Page) -> StorageResult<()> {
    add_to_i32(args, page, 1)
}

fn decrement(args: &OperationArgs<'_>, page: &mut Page) -> StorageResult<()> {
    add_to_i32(args, page, -1)
}

fn alloc(args: &OperationArgs<'_>, page: &mut Page) -> StorageResult<()> {
    RecordPageMut::new(page)?.alloc_at(args.rid.slot, args.rid.size as usize)
}

fn dealloc(args: &OperationArgs<'_>, page: &mut Page) -> StorageResult<()> {
    RecordPageMut::new(page)?.free_slot(args.rid.slot)
}

fn realloc(args: &OperationArgs<'_>, page: &mut Page) -> StorageResult<()> {
    RecordPageMut::new(page)?.alloc_at(args.rid.slot, args.rid.size as usize)?;
    if !args.args.is_empty() {
        overwrite_record(args, page, args.args)?;
    }
    Ok(())
}

fn set_range(args: &OperationArgs<'_>, page: &mut Page, pick_new: bool) -> StorageResult<()> {
    let (offset, new, old) = ranged(args.args)?;
    let bytes = if pick_new { new } else { old };
    let record = record_mut(args, page)?;
    let target = offset
        .checked_add(bytes.len())
        .and_then(|end| record.get_mut(offset..end))
        .ok_or_else(|| StorageError::PageBounds {
            offset,
            len: bytes.len(),
        })?;
    target.copy_from_slice(bytes);
    Ok(())
}

fn set_range_new(args: &OperationArgs<'_>, page: &mut Page) -> StorageResult<()> {
    set_range(args, page, true)
}

fn set_range_old(args: &OperationArgs<'_>, page: &mut Page) -> StorageResult<()> {
    set_range(args, page, false)
}

fn page_set_range(args: &OperationArgs<'_>, page: &mut Page, pick_new: bool) -> StorageResult<()> {
    let (offset, new, old) = ranged(args.args)?;
    if offset < PAGE_DATA_OFFSET {
        return Err(StorageError::PageBounds {
            offset,
            len: new.len(),
        });
    }
    page.write(offset, if pick_new { new } else { old })
}

fn page_set_range_new(args: &OperationArgs<'_>, page: &mut Page) -> StorageResult<()> {
    page_set_range(args, page, true)
}

fn page_set_range_old(args: &OperationArgs<'_>, page: &mut Page) -> StorageResult<()> {
    page_set_range(args, page, false)
}

fn initialize_page(args: &OperationArgs<'_>, page: &mut Page) -> StorageResult<()> {
    let Some(raw) = args.args.get(..2) else {
        return Err(StorageError::internal("initialize_page needs a page type"));
    };
    let page_type = PageType::try_from(u16::from_be_bytes([raw[0], raw[1]]))?;
    match page_type {
        PageType::Record => {
            RecordPageMut::format(page)?;
        }
        other => {
            page.clear_contents();
            page.set_page_type(other);
        }
    }
    Ok(())
}

/// Everything after the page LSN.
fn whole_page(_: &OperationArgs<'_>, _: &Page) -> StorageResult<Range<usize>> {
    Ok(8..PAGE_SIZE)
}

fn noop(_: &TxStore, _: Xid, _: &OperationArgs<'_>) -> StorageResult<()> {
    Ok(())
}

fn restore_records(store: &TxStore, xid: Xid, args: &OperationArgs<'_>) -> StorageResult<()> {
    for (rid, bytes) in decode_records(args.args)? {
        store.set_for_undo(xid, rid, &bytes)?;
    }
    Ok(())
}

/// Arguments for `INITIALIZE_PAGE`.
pub fn initialize_args(page_type: PageType) -> Vec<u8> {
    (page_type as u16).to_be_bytes().to_vec()
}

/// Arguments for `SET`: the new bytes followed by the old ones.
pub fn set_args(new: &[u8], old: &[u8]) -> Vec<u8> {
    let mut args = Vec::with_capacity(new.len() + old.len());
    args.extend_from_slice(new);
    args.extend_from_slice(old);
    args
}

/// Arguments for `SET_RANGE` and `PAGE_SET_RANGE`.
pub fn range_args(offset: usize, new: &[u8], old: &[u8]) -> Vec<u8> {
    let mut args = (offset as u32).to_be_bytes().to_vec();
    args.extend_from_slice(new);
    args.extend_from_slice(old);
    args
}

/// Encodes `count u32` followed by `page u64 | slot u16 | size u32 | bytes`
/// per record.
pub fn encode_records(records: &[(RecordId, Vec<u8>)]) -> Vec<u8> {
    let mut out = (records.len() as u32).to_be_bytes().to_vec();
    for (rid, bytes) in records {
        out.extend_from_slice(&rid.page.to_be_bytes());
        out.extend_from_slice(&rid.slot.to_be_bytes());
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(bytes);
    }
    out
}

pub fn decode_records(mut args: &[u8]) -> StorageResult<Vec<(RecordId, Vec<u8>)>> {
    fn take<'a>(args: &mut &'a [u8], n: usize) -> StorageResult<&'a [u8]> {
        if args.len() < n {
            return Err(StorageError::internal("record list is truncated"));
        }
        let (head, tail) = args.split_at(n);
        *args = tail;
        Ok(head)
    }
    let count = take(&mut args, 4)?;
    let count = u32::from_be_bytes([count[0], count[1], count[2], count[3]]);
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut page = [0u8; 8];
        page.copy_from_slice(take(&mut args, 8)?);
        let slot = take(&mut args, 2)?;
        let slot = u16::from_be_bytes([slot[0], slot[1]]);
        let size = take(&mut args, 4)?;
        let size = u32::from_be_bytes([size[0], size[1], size[2], size[3]]);
        let bytes = take(&mut args, size as usize)?.to_vec();
        records.push((RecordId::new(u64::from_be_bytes(page), slot, size), bytes));
    }
    Ok(records)
}

/// True if `rid` names a live record of the right size on `page`.
pub(crate) fn record_matches(page: &Page, rid: RecordId) -> bool {
    RecordPageView::new(page)
        .and_then(|view| view.record(rid.slot))
        .is_ok_and(|record| record.len() == rid.size as usize)
}
