#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fixed device block size for the whole format.
pub const BLOCK_SIZE: usize = 4096;

/// Magic constant at the start of the superblock.
pub const SUPERBLOCK_SIGNATURE: [u8; 8] = *b"ECS150FS";

/// Physical block holding the superblock.
pub const SUPERBLOCK_BLOCK: u32 = 0;

/// First physical block of the chain table.
pub const CHAIN_TABLE_START_BLOCK: u32 = 1;

/// Chain-table entry value marking the last block of a chain.
///
/// Also stored in a directory entry's `first_block` field when the file
/// owns no blocks.
pub const CHAIN_END: u16 = 0xFFFF;

/// Chain-table entry value marking an unallocated data block.
pub const CHAIN_FREE: u16 = 0;

/// 16-bit chain entries packed into one 4096-byte block.
pub const CHAIN_ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / 2;

/// Number of file entries in the root directory block.
pub const ROOT_DIR_CAPACITY: usize = 128;

/// Size of one root-directory entry in bytes.
pub const DIR_ENTRY_SIZE: usize = 32;

/// Filename buffer size inside a directory entry, including the NUL
/// terminator. The longest representable name is one byte shorter.
pub const FILENAME_SIZE: usize = 16;

/// Maximum number of simultaneously open descriptors.
pub const OPEN_TABLE_CAPACITY: usize = 32;

/// Index of an allocatable data block, in `0..data_block_count`.
///
/// This is the chain table's domain: entry `i` of the table describes data
/// block `i`, and chain links are `DataBlock` values. Index 0 is a permanent
/// sentinel and never backs file data. The physical device block is
/// `data_start_block + i`; the conversion lives on the superblock so that
/// nothing else mixes the two index spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataBlock(pub u16);

/// Slot index of a file's entry in the root directory.
///
/// Stable for the entry's lifetime; freed slots may be reused by later
/// creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub usize);

/// Slot index in the open-file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fd(pub usize);

impl fmt::Display for DataBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Write a little-endian u16 at `offset`. Caller guarantees the range fits.
#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// Write a little-endian u32 at `offset`. Caller guarantees the range fits.
#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Decode a NUL-terminated byte buffer into an owned string.
///
/// Bytes past the first NUL are ignored; non-UTF-8 bytes are replaced.
#[must_use]
pub fn decode_nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Number of blocks needed to hold `size` bytes (4096-byte blocks).
#[must_use]
pub fn blocks_for(size: u32) -> u32 {
    size.div_ceil(BLOCK_SIZE as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_helpers_decode_little_endian() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
    }

    #[test]
    fn read_past_end_reports_shortfall() {
        let bytes = [0_u8; 3];
        assert_eq!(
            read_le_u32(&bytes, 2),
            Err(ParseError::InsufficientData {
                needed: 4,
                offset: 2,
                actual: 1,
            })
        );
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut buf = [0_u8; 8];
        write_le_u16(&mut buf, 0, 0xBEEF);
        write_le_u32(&mut buf, 2, 0xDEAD_F00D);
        assert_eq!(read_le_u16(&buf, 0).expect("u16"), 0xBEEF);
        assert_eq!(read_le_u32(&buf, 2).expect("u32"), 0xDEAD_F00D);
    }

    #[test]
    fn decode_nul_terminated_stops_at_nul() {
        assert_eq!(decode_nul_terminated(b"file.txt\0\0\0\0"), "file.txt");
        assert_eq!(decode_nul_terminated(b"full-buffer-name"), "full-buffer-name");
        assert_eq!(decode_nul_terminated(b"\0garbage"), "");
    }

    #[test]
    fn blocks_for_rounds_up() {
        assert_eq!(blocks_for(0), 0);
        assert_eq!(blocks_for(1), 1);
        assert_eq!(blocks_for(4096), 1);
        assert_eq!(blocks_for(4097), 2);
        assert_eq!(blocks_for(8192), 2);
        assert_eq!(blocks_for(u32::MAX), 0x10_0000);
    }
}
