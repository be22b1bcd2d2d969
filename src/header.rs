//! Binary framing for segment files.
//!
//! ```text
//! segment: 'P' | version | flags | item*
//! item:    0xF0 | flags | len (u16 LE) | payload[len]
//! ```
//!
//! Items are packed back to back with no padding or alignment.

use std::io::{self, Read};

use crate::{Error, Result};

pub const SEGMENT_MAGIC: u8 = b'P';
pub const SEGMENT_VERSION: u8 = 1;
/// Reserved for reverse read order. Never set by this crate.
pub const SEGMENT_FLAG_REVERSE: u8 = 1 << 0;
pub const SEGMENT_HEADER_SIZE: usize = 3;

pub const ITEM_MAGIC: u8 = 0xF0;
pub const ITEM_FLAG_ACTIVE: u8 = 1 << 0;
pub const ITEM_HEADER_SIZE: usize = 4;
/// Offset of the flags byte from the start of an item header.
pub const ITEM_FLAGS_OFFSET: u64 = 1;
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: u8,
    pub version: u8,
    pub flags: u8,
}

impl Default for SegmentHeader {
    fn default() -> Self {
        Self {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            flags: 0,
        }
    }
}

impl SegmentHeader {
    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        [self.magic, self.version, self.flags]
    }

    pub fn from_bytes(bytes: &[u8; SEGMENT_HEADER_SIZE]) -> Result<Self> {
        let header = Self {
            magic: bytes[0],
            version: bytes[1],
            flags: bytes[2],
        };
        if header.magic != SEGMENT_MAGIC {
            return Err(Error::Corrupt("segment magic mismatch"));
        }
        if header.version != SEGMENT_VERSION {
            return Err(Error::UnsupportedVersion(header.version));
        }
        Ok(header)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemHeader {
    pub magic: u8,
    pub flags: u8,
    pub length: u16,
}

impl ItemHeader {
    /// Header for a freshly pushed item.
    pub fn active(length: u16) -> Self {
        Self {
            magic: ITEM_MAGIC,
            flags: ITEM_FLAG_ACTIVE,
            length,
        }
    }

    pub fn is_active(&self) -> bool {
        self.flags & ITEM_FLAG_ACTIVE != 0
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize
    }

    /// Header plus payload, in bytes.
    pub fn framed_len(&self) -> u64 {
        framed_len(self.payload_len())
    }

    pub fn to_bytes(&self) -> [u8; ITEM_HEADER_SIZE] {
        let len = self.length.to_le_bytes();
        [self.magic, self.flags, len[0], len[1]]
    }

    pub fn from_bytes(bytes: &[u8; ITEM_HEADER_SIZE]) -> Self {
        Self {
            magic: bytes[0],
            flags: bytes[1],
            length: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }
}

/// Outcome of decoding the item header at the current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemRead {
    Item(ItemHeader),
    /// Clean end of data: no bytes left.
    End,
    /// Some bytes exist but not a whole item; an interrupted append.
    Torn,
    /// A complete header with the wrong magic.
    Corrupt,
}

pub fn framed_len(payload_len: usize) -> u64 {
    (ITEM_HEADER_SIZE + payload_len) as u64
}

/// Encode a whole item so it can be appended with a single write.
pub fn encode_item(payload: &[u8]) -> Result<Vec<u8>> {
    let length = u16::try_from(payload.len()).map_err(|_| Error::PayloadTooLarge(payload.len()))?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(ITEM_HEADER_SIZE + payload.len())?;
    buf.extend_from_slice(&ItemHeader::active(length).to_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Read until `buf` is full or the reader is exhausted.
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

pub fn read_segment_header<R: Read + ?Sized>(reader: &mut R) -> Result<SegmentHeader> {
    let mut buf = [0u8; SEGMENT_HEADER_SIZE];
    if read_full(reader, &mut buf)? < SEGMENT_HEADER_SIZE {
        return Err(Error::ShortHeader);
    }
    SegmentHeader::from_bytes(&buf)
}

pub fn read_item_header<R: Read + ?Sized>(reader: &mut R) -> io::Result<ItemRead> {
    let mut buf = [0u8; ITEM_HEADER_SIZE];
    match read_full(reader, &mut buf)? {
        0 => Ok(ItemRead::End),
        n if n < ITEM_HEADER_SIZE => Ok(ItemRead::Torn),
        _ => {
            let header = ItemHeader::from_bytes(&buf);
            if header.magic != ITEM_MAGIC {
                Ok(ItemRead::Corrupt)
            } else {
                Ok(ItemRead::Item(header))
            }
        }
    }
}
