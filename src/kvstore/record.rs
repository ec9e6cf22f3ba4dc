//! On-disk record framing
//!
//! ## Frame Format
//! ```text
//! ┌──────────┬───────────┬─────────────┬──────────────────────────┐
//! │ kind: u8 │ len: u32  │ crc32: u32  │ payload (bincode, len B) │
//! └──────────┴───────────┴─────────────┴──────────────────────────┘
//! ```
//! A vbucket file is a sequence of frames. Document and vbucket-state
//! frames become durable once a header frame follows them; anything after
//! the last valid header is an incomplete commit and is discarded on open.

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{EpError, Result};

/// Frame prefix: kind (1) + len (4) + crc (4)
pub(crate) const FRAME_HEADER_SIZE: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RecordKind {
    Doc = 1,
    VbState = 2,
    Header = 3,
}

impl RecordKind {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(RecordKind::Doc),
            2 => Some(RecordKind::VbState),
            3 => Some(RecordKind::Header),
            _ => None,
        }
    }
}

/// A stored document version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DocRecord {
    pub key: Vec<u8>,
    /// Raw metadata bytes (see `MetaData`)
    pub meta: Vec<u8>,
    pub body: Option<Vec<u8>>,
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub deleted: bool,
}

/// Commit point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct HeaderRecord {
    pub high_seqno: u64,
    pub doc_count: u64,
}

/// One decoded frame
#[derive(Debug)]
pub(crate) struct Frame<'a> {
    pub kind: RecordKind,
    pub offset: u64,
    pub len: u64,
    pub payload: &'a [u8],
}

/// Encode `payload` as a complete frame
pub(crate) fn encode_frame(kind: RecordKind, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.push(kind as u8);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub(crate) fn encode<T: Serialize>(kind: RecordKind, record: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(record)?;
    Ok(encode_frame(kind, &payload))
}

pub(crate) fn decode<'de, T: Deserialize<'de>>(payload: &'de [u8]) -> Result<T> {
    Ok(bincode::deserialize(payload)?)
}

/// Split `buf` into frames, stopping at the first truncated or corrupt one
pub(crate) fn decode_frames(buf: &[u8]) -> Vec<Frame<'_>> {
    let mut frames = Vec::new();
    let mut pos = 0usize;

    while pos + FRAME_HEADER_SIZE <= buf.len() {
        let Some(kind) = RecordKind::from_u8(buf[pos]) else {
            break;
        };
        let len = u32::from_le_bytes([buf[pos + 1], buf[pos + 2], buf[pos + 3], buf[pos + 4]])
            as usize;
        let crc = u32::from_le_bytes([buf[pos + 5], buf[pos + 6], buf[pos + 7], buf[pos + 8]]);

        let start = pos + FRAME_HEADER_SIZE;
        let Some(end) = start.checked_add(len).filter(|&end| end <= buf.len()) else {
            break;
        };
        let payload = &buf[start..end];
        if crc32fast::hash(payload) != crc {
            break;
        }

        frames.push(Frame {
            kind,
            offset: pos as u64,
            len: (end - pos) as u64,
            payload,
        });
        pos = end;
    }

    frames
}

/// A frame read from a stream
#[derive(Debug)]
pub(crate) struct OwnedFrame {
    pub kind: RecordKind,
    pub offset: u64,
    pub len: u64,
    pub payload: Vec<u8>,
}

/// Reads frames one at a time from a source holding `limit` bytes
///
/// Stops at the first truncated or corrupt frame. A length field that runs
/// past `limit` is treated as a torn tail, so a bad length never allocates.
pub(crate) struct FrameReader<R> {
    reader: R,
    pos: u64,
    limit: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, limit: u64) -> Self {
        Self {
            reader,
            pos: 0,
            limit,
        }
    }

    /// Offset just past the last frame returned
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn next_frame(&mut self) -> Result<Option<OwnedFrame>> {
        if self.pos + FRAME_HEADER_SIZE as u64 > self.limit {
            return Ok(None);
        }
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.reader.read_exact(&mut header)?;

        let Some(kind) = RecordKind::from_u8(header[0]) else {
            return Ok(None);
        };
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
        let crc = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);

        let end = self.pos + FRAME_HEADER_SIZE as u64 + len as u64;
        if end > self.limit {
            return Ok(None);
        }
        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != crc {
            return Ok(None);
        }

        let frame = OwnedFrame {
            kind,
            offset: self.pos,
            len: end - self.pos,
            payload,
        };
        self.pos = end;
        Ok(Some(frame))
    }
}

/// Decode the single frame that starts at the beginning of `buf`
pub(crate) fn decode_one(buf: &[u8]) -> Result<Frame<'_>> {
    decode_frames(buf)
        .into_iter()
        .next()
        .ok_or_else(|| EpError::Corruption("frame failed checksum or is truncated".into()))
}
