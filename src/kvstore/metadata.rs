//! Versioned document metadata
//!
//! ## Layouts
//! ```text
//! V0 (16 bytes): [cas u64][expiry u32][flags u32]
//! V1 (18 bytes): V0 + [flex_code u8][datatype u8]
//! V2 (19 bytes): V1 + [legacy deleted u8]      (read as V1)
//! ```
//! The version is detected from the buffer length. Reading widens older
//! layouts in memory; writing always produces V1. Nothing is shrunk.

use crate::error::{EpError, Result};
use crate::item::{Item, DATATYPE_RAW_BYTES};

/// Flex code written into every V1 record
pub const FLEX_META_CODE: u8 = 0x01;

/// Metadata layout a buffer was written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MetaDataVersion {
    V0,
    V1,
    V2,
}

impl MetaDataVersion {
    /// Encoded size of this layout
    pub const fn size(self) -> usize {
        match self {
            MetaDataVersion::V0 => 16,
            MetaDataVersion::V1 => 18,
            MetaDataVersion::V2 => 19,
        }
    }

    fn from_len(len: usize) -> Option<Self> {
        match len {
            16 => Some(MetaDataVersion::V0),
            18 => Some(MetaDataVersion::V1),
            19 => Some(MetaDataVersion::V2),
            _ => None,
        }
    }
}

/// Base fields present in every version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaDataV0 {
    pub cas: u64,
    pub expiry: u32,
    pub flags: u32,
}

/// V0 plus flex code and datatype
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaDataV1 {
    pub base: MetaDataV0,
    pub flex_code: u8,
    pub datatype: u8,
}

/// V1 plus a legacy deleted byte that is carried but never interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaDataV2 {
    pub v1: MetaDataV1,
    pub legacy_deleted: u8,
}

impl MetaDataV0 {
    /// Widen to V1 with default flex code and datatype
    pub fn widen(self) -> MetaDataV1 {
        MetaDataV1 {
            base: self,
            flex_code: FLEX_META_CODE,
            datatype: DATATYPE_RAW_BYTES,
        }
    }
}

/// Decoded metadata, tagged with the layout it was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaData {
    V0(MetaDataV0),
    V1(MetaDataV1),
    V2(MetaDataV2),
}

impl MetaData {
    /// Metadata for an item, in the current layout
    pub fn from_item(item: &Item) -> Self {
        MetaData::V1(MetaDataV1 {
            base: MetaDataV0 {
                cas: item.cas,
                expiry: item.expiry,
                flags: item.flags,
            },
            flex_code: FLEX_META_CODE,
            datatype: item.datatype,
        })
    }

    /// Decode a buffer, detecting its version by length
    ///
    /// Any length other than 16, 18 or 19 bytes is rejected.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let version =
            MetaDataVersion::from_len(buf.len()).ok_or(EpError::InvalidMetadata { len: buf.len() })?;

        let base = MetaDataV0 {
            cas: u64::from_be_bytes(buf[0..8].try_into().map_err(|_| bad_len(buf))?),
            expiry: u32::from_be_bytes(buf[8..12].try_into().map_err(|_| bad_len(buf))?),
            flags: u32::from_be_bytes(buf[12..16].try_into().map_err(|_| bad_len(buf))?),
        };

        Ok(match version {
            MetaDataVersion::V0 => MetaData::V0(base),
            MetaDataVersion::V1 => MetaData::V1(MetaDataV1 {
                base,
                flex_code: buf[16],
                datatype: buf[17],
            }),
            MetaDataVersion::V2 => MetaData::V2(MetaDataV2 {
                v1: MetaDataV1 {
                    base,
                    flex_code: buf[16],
                    datatype: buf[17],
                },
                legacy_deleted: buf[18],
            }),
        })
    }

    /// Layout this metadata was decoded from
    pub fn version_initialised_from(&self) -> MetaDataVersion {
        match self {
            MetaData::V0(_) => MetaDataVersion::V0,
            MetaData::V1(_) => MetaDataVersion::V1,
            MetaData::V2(_) => MetaDataVersion::V2,
        }
    }

    /// Widen to the current layout; V2's extra byte is dropped
    pub fn to_v1(&self) -> MetaDataV1 {
        match *self {
            MetaData::V0(v0) => v0.widen(),
            MetaData::V1(v1) => v1,
            MetaData::V2(v2) => v2.v1,
        }
    }

    pub fn cas(&self) -> u64 {
        self.to_v1().base.cas
    }

    pub fn expiry(&self) -> u32 {
        self.to_v1().base.expiry
    }

    pub fn flags(&self) -> u32 {
        self.to_v1().base.flags
    }

    pub fn flex_code(&self) -> u8 {
        self.to_v1().flex_code
    }

    pub fn datatype(&self) -> u8 {
        self.to_v1().datatype
    }

    /// Encode in the current (V1) layout
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_v1(&self.to_v1())
    }

    /// Encode in the layout the metadata was read from
    pub fn to_bytes_as_read(&self) -> Vec<u8> {
        match self {
            MetaData::V0(v0) => encode_v0(v0),
            MetaData::V1(v1) => encode_v1(v1),
            MetaData::V2(v2) => {
                let mut buf = encode_v1(&v2.v1);
                buf.push(v2.legacy_deleted);
                buf
            }
        }
    }
}

fn bad_len(buf: &[u8]) -> EpError {
    EpError::InvalidMetadata { len: buf.len() }
}

fn encode_v0(v0: &MetaDataV0) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MetaDataVersion::V1.size());
    buf.extend_from_slice(&v0.cas.to_be_bytes());
    buf.extend_from_slice(&v0.expiry.to_be_bytes());
    buf.extend_from_slice(&v0.flags.to_be_bytes());
    buf
}

fn encode_v1(v1: &MetaDataV1) -> Vec<u8> {
    let mut buf = encode_v0(&v1.base);
    buf.push(v1.flex_code);
    buf.push(v1.datatype);
    buf
}
