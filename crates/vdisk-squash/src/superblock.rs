//! Superblock parsing.
//!
//! The 96-byte little-endian record at the start of the filesystem: magic,
//! compression id, validated block size, object counts, flag bits, the five
//! table start offsets, and the root inode reference.

use serde::{Deserialize, Serialize};
use vdisk_error::{DiskError, Result};
use vdisk_types::{
    BlockSize, SQUASH_MAGIC, SQUASH_SUPERBLOCK_SIZE, read_le_u16, read_le_u32, read_le_u64,
};

/// Sentinel for "table absent" in the 64-bit table start fields.
pub const NO_TABLE: u64 = 0xFFFF_FFFF_FFFF_FFFF;

// Superblock flag bits.
pub const FLAG_UNCOMPRESSED_INODES: u16 = 0x0001;
pub const FLAG_UNCOMPRESSED_DATA: u16 = 0x0002;
pub const FLAG_UNCOMPRESSED_FRAGMENTS: u16 = 0x0008;
pub const FLAG_NO_FRAGMENTS: u16 = 0x0010;
pub const FLAG_ALWAYS_FRAGMENTS: u16 = 0x0020;
pub const FLAG_DUPLICATES: u16 = 0x0040;
pub const FLAG_EXPORTABLE: u16 = 0x0080;
pub const FLAG_UNCOMPRESSED_XATTRS: u16 = 0x0100;
pub const FLAG_NO_XATTRS: u16 = 0x0200;
pub const FLAG_COMPRESSOR_OPTIONS: u16 = 0x0400;
pub const FLAG_UNCOMPRESSED_IDS: u16 = 0x0800;

/// Location of an inode inside the inode table: the byte offset of its
/// metadata block relative to the table start, and the offset within the
/// decompressed 8 KiB payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InodeRef {
    pub block: u32,
    pub offset: u16,
}

impl InodeRef {
    /// Unpack the on-disk 48-bit reference (`block << 16 | offset`).
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        #[allow(clippy::cast_possible_truncation)] // masked to their widths
        Self {
            block: ((raw >> 16) & 0xFFFF_FFFF) as u32,
            offset: (raw & 0xFFFF) as u16,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u64 {
        (u64::from(self.block) << 16) | u64::from(self.offset)
    }
}

/// The fixed-position root record of the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub inode_count: u32,
    pub mod_time: u32,
    pub block_size: BlockSize,
    pub fragment_count: u32,
    pub compression_id: u16,
    pub flags: u16,
    pub id_count: u16,
    pub version_major: u16,
    pub version_minor: u16,
    pub root_inode: InodeRef,
    pub bytes_used: u64,
    pub id_table_start: u64,
    pub xattr_table_start: u64,
    pub inode_table_start: u64,
    pub directory_table_start: u64,
    pub fragment_table_start: u64,
    pub export_table_start: u64,
}

impl Superblock {
    /// Parse the 96-byte superblock region.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < SQUASH_SUPERBLOCK_SIZE {
            return Err(DiskError::CorruptSuperblock { field: "length" });
        }

        let magic = read_le_u32(data, 0x00)?;
        if magic != SQUASH_MAGIC {
            return Err(DiskError::CorruptSuperblock { field: "magic" });
        }

        let raw_block_size = read_le_u32(data, 0x0C)?;
        if !raw_block_size.is_power_of_two()
            || !(vdisk_types::SQUASH_MIN_BLOCK_SIZE..=vdisk_types::SQUASH_MAX_BLOCK_SIZE)
                .contains(&raw_block_size)
        {
            return Err(DiskError::UnsupportedBlocksize {
                value: u64::from(raw_block_size),
            });
        }
        let block_size = BlockSize::new(raw_block_size)?;

        let block_log = read_le_u16(data, 0x16)?;
        if u32::from(block_log) != block_size.shift() {
            return Err(DiskError::CorruptSuperblock { field: "block_log" });
        }

        let version_major = read_le_u16(data, 0x1C)?;
        let version_minor = read_le_u16(data, 0x1E)?;
        if version_major != 4 || version_minor != 0 {
            return Err(DiskError::CorruptSuperblock { field: "version" });
        }

        Ok(Self {
            inode_count: read_le_u32(data, 0x04)?,
            mod_time: read_le_u32(data, 0x08)?,
            block_size,
            fragment_count: read_le_u32(data, 0x10)?,
            compression_id: read_le_u16(data, 0x14)?,
            flags: read_le_u16(data, 0x18)?,
            id_count: read_le_u16(data, 0x1A)?,
            version_major,
            version_minor,
            root_inode: InodeRef::from_raw(read_le_u64(data, 0x20)?),
            bytes_used: read_le_u64(data, 0x28)?,
            id_table_start: read_le_u64(data, 0x30)?,
            xattr_table_start: read_le_u64(data, 0x38)?,
            inode_table_start: read_le_u64(data, 0x40)?,
            directory_table_start: read_le_u64(data, 0x48)?,
            fragment_table_start: read_le_u64(data, 0x50)?,
            export_table_start: read_le_u64(data, 0x58)?,
        })
    }

    /// Serialize back to the 96-byte on-disk layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SQUASH_SUPERBLOCK_SIZE] {
        let mut out = [0_u8; SQUASH_SUPERBLOCK_SIZE];
        out[0x00..0x04].copy_from_slice(&SQUASH_MAGIC.to_le_bytes());
        out[0x04..0x08].copy_from_slice(&self.inode_count.to_le_bytes());
        out[0x08..0x0C].copy_from_slice(&self.mod_time.to_le_bytes());
        out[0x0C..0x10].copy_from_slice(&self.block_size.get().to_le_bytes());
        out[0x10..0x14].copy_from_slice(&self.fragment_count.to_le_bytes());
        out[0x14..0x16].copy_from_slice(&self.compression_id.to_le_bytes());
        #[allow(clippy::cast_possible_truncation)] // shift of a u32 is at most 31
        let block_log = self.block_size.shift() as u16;
        out[0x16..0x18].copy_from_slice(&block_log.to_le_bytes());
        out[0x18..0x1A].copy_from_slice(&self.flags.to_le_bytes());
        out[0x1A..0x1C].copy_from_slice(&self.id_count.to_le_bytes());
        out[0x1C..0x1E].copy_from_slice(&self.version_major.to_le_bytes());
        out[0x1E..0x20].copy_from_slice(&self.version_minor.to_le_bytes());
        out[0x20..0x28].copy_from_slice(&self.root_inode.to_raw().to_le_bytes());
        out[0x28..0x30].copy_from_slice(&self.bytes_used.to_le_bytes());
        out[0x30..0x38].copy_from_slice(&self.id_table_start.to_le_bytes());
        out[0x38..0x40].copy_from_slice(&self.xattr_table_start.to_le_bytes());
        out[0x40..0x48].copy_from_slice(&self.inode_table_start.to_le_bytes());
        out[0x48..0x50].copy_from_slice(&self.directory_table_start.to_le_bytes());
        out[0x50..0x58].copy_from_slice(&self.fragment_table_start.to_le_bytes());
        out[0x58..0x60].copy_from_slice(&self.export_table_start.to_le_bytes());
        out
    }

    #[must_use]
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    #[must_use]
    pub fn no_xattrs(&self) -> bool {
        self.has_flag(FLAG_NO_XATTRS) || self.xattr_table_start == NO_TABLE
    }

    #[must_use]
    pub fn has_fragments(&self) -> bool {
        !self.has_flag(FLAG_NO_FRAGMENTS)
            && self.fragment_count > 0
            && self.fragment_table_start != NO_TABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        Superblock {
            inode_count: 7,
            mod_time: 1_700_000_000,
            block_size: BlockSize::new(131_072).unwrap(),
            fragment_count: 1,
            compression_id: 1,
            flags: FLAG_DUPLICATES,
            id_count: 2,
            version_major: 4,
            version_minor: 0,
            root_inode: InodeRef { block: 0, offset: 32 },
            bytes_used: 4096,
            id_table_start: 3000,
            xattr_table_start: NO_TABLE,
            inode_table_start: 96,
            directory_table_start: 1024,
            fragment_table_start: 2048,
            export_table_start: NO_TABLE,
        }
    }

    #[test]
    fn round_trip() {
        let sb = sample();
        let parsed = Superblock::parse(&sb.to_bytes()).expect("parse");
        assert_eq!(parsed, sb);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample().to_bytes();
        bytes[0] = 0;
        assert!(matches!(
            Superblock::parse(&bytes).unwrap_err(),
            DiskError::CorruptSuperblock { field: "magic" }
        ));
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        let mut bytes = sample().to_bytes();
        bytes[0x0C..0x10].copy_from_slice(&3000_u32.to_le_bytes());
        assert!(matches!(
            Superblock::parse(&bytes).unwrap_err(),
            DiskError::UnsupportedBlocksize { value: 3000 }
        ));
    }

    #[test]
    fn rejects_out_of_range_block_size() {
        let mut bytes = sample().to_bytes();
        bytes[0x0C..0x10].copy_from_slice(&2048_u32.to_le_bytes());
        assert!(matches!(
            Superblock::parse(&bytes).unwrap_err(),
            DiskError::UnsupportedBlocksize { value: 2048 }
        ));

        let mut bytes = sample().to_bytes();
        bytes[0x0C..0x10].copy_from_slice(&(2 * 1024 * 1024_u32).to_le_bytes());
        assert!(Superblock::parse(&bytes).is_err());
    }

    #[test]
    fn rejects_mismatched_block_log() {
        let mut bytes = sample().to_bytes();
        bytes[0x16..0x18].copy_from_slice(&12_u16.to_le_bytes()); // log2(131072) = 17
        assert!(matches!(
            Superblock::parse(&bytes).unwrap_err(),
            DiskError::CorruptSuperblock { field: "block_log" }
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = sample().to_bytes();
        bytes[0x1C..0x1E].copy_from_slice(&3_u16.to_le_bytes());
        assert!(matches!(
            Superblock::parse(&bytes).unwrap_err(),
            DiskError::CorruptSuperblock { field: "version" }
        ));
    }

    #[test]
    fn inode_ref_packing() {
        let reference = InodeRef {
            block: 0x0001_0203,
            offset: 0x1F2E,
        };
        assert_eq!(InodeRef::from_raw(reference.to_raw()), reference);
        assert_eq!(
            InodeRef::from_raw(0x0000_0001_0000_0020),
            InodeRef {
                block: 1,
                offset: 0x20
            }
        );
    }

    #[test]
    fn table_presence_helpers() {
        let sb = sample();
        assert!(sb.no_xattrs());
        assert!(sb.has_fragments());

        let mut no_frag = sb.clone();
        no_frag.fragment_count = 0;
        assert!(!no_frag.has_fragments());
    }
}
