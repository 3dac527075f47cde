#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default logical sector size in bytes (512e drives and most images).
pub const DEFAULT_LOGICAL_SECTOR_SIZE: u32 = 512;
/// Default physical sector size in bytes.
pub const DEFAULT_PHYSICAL_SECTOR_SIZE: u32 = 512;

/// MBR boot signature stored in the last two bytes of sector 0.
pub const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
/// Byte offset of the first MBR partition entry within sector 0.
pub const MBR_ENTRY_TABLE_OFFSET: usize = 446;
/// On-disk size of one MBR partition entry.
pub const MBR_ENTRY_SIZE: usize = 16;
/// Number of slots in the MBR partition table.
pub const MBR_ENTRY_COUNT: usize = 4;
/// Byte offset of the 32-bit disk signature within sector 0.
pub const MBR_DISK_SIGNATURE_OFFSET: usize = 440;

/// GPT header signature ("EFI PART" little-endian).
pub const GPT_SIGNATURE: u64 = 0x5452_4150_2049_4645;
/// GPT revision 1.0 as stored on disk.
pub const GPT_REVISION: u32 = 0x0001_0000;
/// Size in bytes of the GPT header proper (the rest of the sector is reserved).
pub const GPT_HEADER_SIZE: u32 = 92;
/// Conventional size of one GPT partition entry.
pub const GPT_ENTRY_SIZE: u32 = 128;
/// Conventional number of GPT partition entries.
pub const GPT_ENTRY_COUNT: u32 = 128;
/// Maximum UTF-16LE code units in a GPT partition name.
pub const GPT_NAME_UNITS: usize = 36;

/// SquashFS superblock magic ("hsqs" little-endian).
pub const SQUASH_MAGIC: u32 = 0x7371_7368;
/// On-disk size of the SquashFS superblock.
pub const SQUASH_SUPERBLOCK_SIZE: usize = 96;
/// Decompressed size cap of one metadata block.
pub const SQUASH_METADATA_BLOCK_SIZE: usize = 8 * 1024;
/// Smallest allowed data block size.
pub const SQUASH_MIN_BLOCK_SIZE: u32 = 4 * 1024;
/// Largest allowed data block size.
pub const SQUASH_MAX_BLOCK_SIZE: u32 = 1024 * 1024;

/// Logical Block Address: a sector index from the start of the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lba(pub u64);

impl Lba {
    /// Add a sector count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, sectors: u64) -> Option<Self> {
        self.0.checked_add(sectors).map(Self)
    }

    /// Byte offset of this sector for the given sector size.
    ///
    /// Returns `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self, sector_size: u32) -> Option<ByteOffset> {
        self.0.checked_mul(u64::from(sector_size)).map(ByteOffset)
    }
}

/// Byte offset on a backend (pread/pwrite semantics).
///
/// Unit-carrying wrapper to keep sectors and bytes from mixing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Subtract a byte count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }

    /// Narrow to `usize`, returning `ParseError::IntegerConversion` on overflow.
    pub fn to_usize(self) -> Result<usize, ParseError> {
        usize::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "byte_offset",
        })
    }
}

/// Validated filesystem data-block size (power of two in 4 KiB..=1 MiB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [4096, 1048576].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(SQUASH_MIN_BLOCK_SIZE..=SQUASH_MAX_BLOCK_SIZE).contains(&value)
        {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 4096..=1048576",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
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
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
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
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u16 = 0o010_000;
/// Character device.
pub const S_IFCHR: u16 = 0o020_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Block device.
pub const S_IFBLK: u16 = 0o060_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u16 = 0o140_000;

// ── Free-standing checked arithmetic helpers ────────────────────────────────

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Narrow a `u64` to `usize` with an explicit error path.
///
/// On 64-bit platforms this is infallible; on 32-bit it can fail.
/// The `field` label is included in the error for diagnostics.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

impl fmt::Display for Lba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
