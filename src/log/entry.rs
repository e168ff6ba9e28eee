//! Log entries and their on-disk encoding.
//!
//! All integers are big-endian. A frame is `payload_len u32 | crc32 u32 |
//! payload`, and the payload is
//!
//! ```text
//! tag u8 | xid i32 | lsn u64 | prev_lsn u64 (0 = none) | body
//! ```
//!
//! Update bodies carry `op u16 | page u64 | slot u16 | size u32 |
//! args_len u32 | args | has_preimage u8 [| offset u32 | len u32 | bytes]`.
//! A CLR body is `undo_next u64 | compensated_lsn u64 | has_update u8
//! [| update body]`.

use std::fmt;

use crc32fast::Hasher;

use crate::{
    error::{StorageError, StorageResult},
    operations::OperationId,
    Lsn, RecordId, Xid,
};

/// Bytes before the payload of every frame.
pub const FRAME_HEADER_LEN: usize = 8;

/// Payloads larger than this are treated as garbage when scanning.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

const TAG_INTERNAL: u8 = 0;
const TAG_BEGIN: u8 = 1;
const TAG_COMMIT: u8 = 2;
const TAG_ABORT: u8 = 3;
const TAG_END: u8 = 4;
const TAG_PREPARE: u8 = 5;
const TAG_UPDATE: u8 = 6;
const TAG_CLR: u8 = 7;

/// Bytes captured before an operation that cannot be inverted from its
/// arguments alone. `offset` is relative to the start of the page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreImage {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// The part of an entry that describes a page or logical mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateBody {
    pub op: OperationId,
    pub rid: RecordId,
    pub args: Vec<u8>,
    pub preimage: Option<PreImage>,
}

impl UpdateBody {
    pub fn new(op: OperationId, rid: RecordId, args: Vec<u8>) -> Self {
        Self {
            op,
            rid,
            args,
            preimage: None,
        }
    }

    pub fn is_logical(&self) -> bool {
        self.rid.is_logical()
    }

    fn encoded_len(&self) -> usize {
        let preimage = self.preimage.as_ref().map_or(0, |p| 8 + p.bytes.len());
        2 + 8 + 2 + 4 + 4 + self.args.len() + 1 + preimage
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.op.to_be_bytes());
        out.extend_from_slice(&self.rid.page.to_be_bytes());
        out.extend_from_slice(&self.rid.slot.to_be_bytes());
        out.extend_from_slice(&self.rid.size.to_be_bytes());
        out.extend_from_slice(&(self.args.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.args);
        match &self.preimage {
            None => out.push(0),
            Some(preimage) => {
                out.push(1);
                out.extend_from_slice(&preimage.offset.to_be_bytes());
                out.extend_from_slice(&(preimage.bytes.len() as u32).to_be_bytes());
                out.extend_from_slice(&preimage.bytes);
            }
        }
    }

    fn decode_from(reader: &mut Reader<'_>) -> StorageResult<Self> {
        let op = reader.u16()?;
        let page = reader.u64()?;
        let slot = reader.u16()?;
        let size = reader.u32()?;
        let args_len = reader.u32()? as usize;
        let args = reader.bytes(args_len)?.to_vec();
        let preimage = match reader.u8()? {
            0 => None,
            1 => {
                let offset = reader.u32()?;
                let len = reader.u32()? as usize;
                Some(PreImage {
                    offset,
                    bytes: reader.bytes(len)?.to_vec(),
                })
            }
            other => return Err(reader.corrupt(format!("bad pre-image flag {other}"))),
        };
        Ok(Self {
            op,
            rid: RecordId::new(page, slot, size),
            args,
            preimage,
        })
    }
}

/// Entry-type specific contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryBody {
    /// Bookkeeping entry that belongs to no transaction.
    Internal,
    Begin,
    Commit,
    Abort,
    End,
    /// Durable promise to commit; carries the recLSN needed to revive the
    /// transaction after a crash.
    Prepare { rec_lsn: Lsn },
    Update(UpdateBody),
    /// Compensation entry written while undoing `compensated_lsn`. A dummy
    /// CLR (no `compensated` body) only redirects the undo chain.
    Clr {
        undo_next: Option<Lsn>,
        compensated_lsn: Lsn,
        compensated: Option<UpdateBody>,
    },
}

impl EntryBody {
    fn tag(&self) -> u8 {
        match self {
            EntryBody::Internal => TAG_INTERNAL,
            EntryBody::Begin => TAG_BEGIN,
            EntryBody::Commit => TAG_COMMIT,
            EntryBody::Abort => TAG_ABORT,
            EntryBody::End => TAG_END,
            EntryBody::Prepare { .. } => TAG_PREPARE,
            EntryBody::Update(_) => TAG_UPDATE,
            EntryBody::Clr { .. } => TAG_CLR,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EntryBody::Internal => "INTERNAL",
            EntryBody::Begin => "BEGIN",
            EntryBody::Commit => "COMMIT",
            EntryBody::Abort => "ABORT",
            EntryBody::End => "END",
            EntryBody::Prepare { .. } => "PREPARE",
            EntryBody::Update(_) => "UPDATE",
            EntryBody::Clr { .. } => "CLR",
        }
    }
}

/// A decoded log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// Assigned by the log manager on append.
    pub lsn: Lsn,
    pub prev_lsn: Option<Lsn>,
    pub xid: Xid,
    pub body: EntryBody,
}

impl LogEntry {
    pub fn new(xid: Xid, prev_lsn: Option<Lsn>, body: EntryBody) -> Self {
        Self {
            lsn: Lsn::ZERO,
            prev_lsn,
            xid,
            body,
        }
    }

    /// Next entry to visit when undoing this entry's transaction.
    pub fn undo_successor(&self) -> Option<Lsn> {
        match &self.body {
            EntryBody::Clr { undo_next, .. } => *undo_next,
            _ => self.prev_lsn,
        }
    }

    pub fn update(&self) -> Option<&UpdateBody> {
        match &self.body {
            EntryBody::Update(update) => Some(update),
            _ => None,
        }
    }

    /// The record the entry touches, if any.
    pub fn rid(&self) -> Option<RecordId> {
        match &self.body {
            EntryBody::Update(update) => Some(update.rid),
            EntryBody::Clr {
                compensated: Some(update),
                ..
            } => Some(update.rid),
            _ => None,
        }
    }

    fn payload_len(&self) -> usize {
        let body = match &self.body {
            EntryBody::Internal
            | EntryBody::Begin
            | EntryBody::Commit
            | EntryBody::Abort
            | EntryBody::End => 0,
            EntryBody::Prepare { .. } => 8,
            EntryBody::Update(update) => update.encoded_len(),
            EntryBody::Clr { compensated, .. } => {
                8 + 8 + 1 + compensated.as_ref().map_or(0, UpdateBody::encoded_len)
            }
        };
        1 + 4 + 8 + 8 + body
    }

    /// Length of the entry's frame, which is also the LSN distance to the
    /// next entry.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload_len()
    }

    /// LSN of the entry that follows this one in the log.
    pub fn next_lsn(&self) -> Lsn {
        self.lsn.advance(self.frame_len() as u64)
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload_len());
        out.push(self.body.tag());
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.lsn.get().to_be_bytes());
        out.extend_from_slice(&Lsn::encode_opt(self.prev_lsn).to_be_bytes());
        match &self.body {
            EntryBody::Internal
            | EntryBody::Begin
            | EntryBody::Commit
            | EntryBody::Abort
            | EntryBody::End => {}
            EntryBody::Prepare { rec_lsn } => out.extend_from_slice(&rec_lsn.get().to_be_bytes()),
            EntryBody::Update(update) => update.encode_into(&mut out),
            EntryBody::Clr {
                undo_next,
                compensated_lsn,
                compensated,
            } => {
                out.extend_from_slice(&Lsn::encode_opt(*undo_next).to_be_bytes());
                out.extend_from_slice(&compensated_lsn.get().to_be_bytes());
                match compensated {
                    None => out.push(0),
                    Some(update) => {
                        out.push(1);
                        update.encode_into(&mut out);
                    }
                }
            }
        }
        out
    }

    /// Encodes the entry as a complete frame.
    pub fn encode_frame(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&checksum(&payload).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    fn decode_payload(payload: &[u8], at: Lsn) -> StorageResult<Self> {
        let mut reader = Reader {
            buf: payload,
            pos: 0,
            at,
        };
        let tag = reader.u8()?;
        let xid = reader.i32()?;
        let lsn = Lsn::new(reader.u64()?);
        let prev_lsn = Lsn::decode_opt(reader.u64()?);
        let body = match tag {
            TAG_INTERNAL => EntryBody::Internal,
            TAG_BEGIN => EntryBody::Begin,
            TAG_COMMIT => EntryBody::Commit,
            TAG_ABORT => EntryBody::Abort,
            TAG_END => EntryBody::End,
            TAG_PREPARE => EntryBody::Prepare {
                rec_lsn: Lsn::new(reader.u64()?),
            },
            TAG_UPDATE => EntryBody::Update(UpdateBody::decode_from(&mut reader)?),
            TAG_CLR => {
                let undo_next = Lsn::decode_opt(reader.u64()?);
                let compensated_lsn = Lsn::new(reader.u64()?);
                let compensated = match reader.u8()? {
                    0 => None,
                    1 => Some(UpdateBody::decode_from(&mut reader)?),
                    other => return Err(reader.corrupt(format!("bad CLR flag {other}"))),
                };
                EntryBody::Clr {
                    undo_next,
                    compensated_lsn,
                    compensated,
                }
            }
            other => return Err(reader.corrupt(format!("unknown entry tag {other}"))),
        };
        if reader.pos != payload.len() {
            return Err(reader.corrupt("trailing bytes after entry body"));
        }
        Ok(Self {
            lsn,
            prev_lsn,
            xid,
            body,
        })
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prev = Lsn::encode_opt(self.prev_lsn);
        write!(
            f,
            "{:<8} lsn={:<10} prev={:<10} xid={:<5}",
            self.body.name(),
            self.lsn,
            prev,
            self.xid
        )?;
        match &self.body {
            EntryBody::Update(update) => write!(
                f,
                " rid={} op={} args={}{}",
                update.rid,
                update.op,
                update.args.len(),
                if update.preimage.is_some() { " +preimage" } else { "" }
            ),
            EntryBody::Clr {
                undo_next,
                compensated_lsn,
                compensated,
            } => {
                write!(
                    f,
                    " undo_next={} compensates={}",
                    Lsn::encode_opt(*undo_next),
                    compensated_lsn
                )?;
                match compensated {
                    Some(update) => write!(f, " rid={} op={}", update.rid, update.op),
                    None => write!(f, " (dummy)"),
                }
            }
            EntryBody::Prepare { rec_lsn } => write!(f, " rec_lsn={rec_lsn}"),
            _ => Ok(()),
        }
    }
}

pub(crate) fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Outcome of parsing the frame that starts at the head of a buffer.
#[derive(Debug)]
pub(crate) enum FrameRead {
    Entry(LogEntry),
    /// The buffer ends before the frame does.
    Incomplete,
    /// Length or checksum do not describe a valid frame.
    Damaged(String),
}

/// Parses the frame at the start of `buf`, which is expected to begin at
/// `at`. An entry whose encoded LSN differs from `at` is corruption, not a
/// torn write, and is returned as an error.
pub(crate) fn parse_frame(buf: &[u8], at: Lsn) -> StorageResult<FrameRead> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(FrameRead::Incomplete);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let stored = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if len == 0 || len > MAX_PAYLOAD_LEN {
        return Ok(FrameRead::Damaged(format!("implausible payload length {len}")));
    }
    let Some(payload) = buf.get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + len) else {
        return Ok(FrameRead::Incomplete);
    };
    let computed = checksum(payload);
    if computed != stored {
        return Ok(FrameRead::Damaged(format!(
            "checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
        )));
    }
    let entry = LogEntry::decode_payload(payload, at)?;
    if entry.lsn != at {
        return Err(StorageError::log_corrupted(
            at,
            format!("entry claims LSN {} at offset {at}", entry.lsn),
        ));
    }
    Ok(FrameRead::Entry(entry))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    at: Lsn,
}

impl<'a> Reader<'a> {
    fn corrupt(&self, reason: impl Into<String>) -> StorageError {
        StorageError::log_corrupted(self.at, reason)
    }

    fn bytes(&mut self, len: usize) -> StorageResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| self.corrupt("entry body is truncated"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> StorageResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> StorageResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> StorageResult<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> StorageResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn i32(&mut self) -> StorageResult<i32> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> StorageResult<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }
}
