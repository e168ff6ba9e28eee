use std::fmt::Debug;

use crate::{
    error::StorageResult,
    log::entry::{parse_frame, FrameRead, FRAME_HEADER_LEN},
    Lsn,
};

/// Byte-addressed backend holding the durable part of the log.
///
/// Byte `b` of the retained log has LSN `base_lsn() + b`; LSNs are never
/// reused after truncation.
pub trait LogStorage: Send + Debug {
    /// LSN of the first retained byte.
    fn base_lsn(&self) -> Lsn;

    /// LSN one past the last stored byte.
    fn end_lsn(&self) -> Lsn;

    /// Appends bytes that start at `end_lsn()`. They are durable only after
    /// the next [`LogStorage::sync`].
    fn append(&mut self, bytes: &[u8]) -> StorageResult<()>;

    fn sync(&mut self) -> StorageResult<()>;

    /// Reads up to `buf.len()` bytes starting at `lsn`. Returns the number of
    /// bytes read, short at the end of the log.
    fn read_at(&self, lsn: Lsn, buf: &mut [u8]) -> StorageResult<usize>;

    /// Drops every byte before `new_base`, which must be an entry boundary
    /// no later than `end_lsn()`.
    fn truncate(&mut self, new_base: Lsn) -> StorageResult<()>;

    /// Discards every byte from `end` on. Used to cut a torn tail.
    fn cut_tail(&mut self, end: Lsn) -> StorageResult<()>;

    fn close(&mut self) -> StorageResult<()>;
}

/// Walks the frames of `storage` from its base and returns the end of the
/// last intact one, with the reason the walk stopped early if it did.
pub(crate) fn valid_end(storage: &dyn LogStorage) -> StorageResult<(Lsn, Option<String>)> {
    let end = storage.end_lsn();
    let mut position = storage.base_lsn();
    let mut header = [0u8; FRAME_HEADER_LEN];
    while position < end {
        let read = storage.read_at(position, &mut header)?;
        if read < FRAME_HEADER_LEN {
            return Ok((position, Some("short frame header".to_string())));
        }
        let payload_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let available = end.distance_from(position) as usize;
        let frame_len = FRAME_HEADER_LEN.saturating_add(payload_len).min(available);
        let mut frame = vec![0u8; frame_len];
        let read = storage.read_at(position, &mut frame)?;
        frame.truncate(read);
        match parse_frame(&frame, position)? {
            FrameRead::Entry(entry) => position = entry.next_lsn(),
            FrameRead::Incomplete => {
                return Ok((position, Some("frame extends past the end of the log".to_string())));
            }
            FrameRead::Damaged(reason) => return Ok((position, Some(reason))),
        }
    }
    Ok((position, None))
}

/// Cuts the log after the last intact frame. Returns the end of the valid
/// log.
pub(crate) fn repair_tail(storage: &mut dyn LogStorage) -> StorageResult<Lsn> {
    let end = storage.end_lsn();
    let (position, damage) = valid_end(storage)?;
    if let Some(reason) = damage {
        tracing::warn!(
            %position,
            discarded = end.distance_from(position),
            reason,
            "discarding torn log tail"
        );
        storage.cut_tail(position)?;
        storage.sync()?;
    }
    Ok(position)
}
