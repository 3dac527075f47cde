//! Fragment table.
//!
//! Tails of files too small to fill a data block are packed together into
//! shared fragment blocks. Each 16-byte entry gives a fragment block's
//! absolute position and its on-disk size word (bit 24 marks it stored
//! uncompressed). Entries are packed 512 to a metadata block; a flat
//! array of u64 offsets at `fragment_table_start` indexes those blocks.

use crate::metadata::MetaStore;
use crate::superblock::Superblock;
use vdisk_error::{DiskError, Result};
use vdisk_types::{read_le_u32, read_le_u64};

/// On-disk size of one fragment entry.
pub const FRAGMENT_ENTRY_SIZE: usize = 16;
/// Entries per metadata block (8 KiB / 16).
pub const FRAGMENT_ENTRIES_PER_BLOCK: u32 = 512;
/// Size-word bit marking an uncompressed fragment block.
pub const FRAGMENT_UNCOMPRESSED_FLAG: u32 = 1 << 24;

/// Location and size of one fragment block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentEntry {
    /// Absolute byte offset of the fragment block.
    pub start: u64,
    /// On-disk size in bytes.
    pub size: u32,
    pub compressed: bool,
}

/// Decode one 16-byte fragment entry.
pub fn parse_fragment_entry(data: &[u8]) -> Result<FragmentEntry> {
    if data.len() < FRAGMENT_ENTRY_SIZE {
        return Err(DiskError::Format(format!(
            "fragment entry was {} bytes instead of expected {FRAGMENT_ENTRY_SIZE}",
            data.len()
        )));
    }
    let size_word = read_le_u32(data, 8)?;
    Ok(FragmentEntry {
        start: read_le_u64(data, 0)?,
        size: size_word & !FRAGMENT_UNCOMPRESSED_FLAG,
        compressed: size_word & FRAGMENT_UNCOMPRESSED_FLAG == 0,
    })
}

/// Encode an entry for synthetic images.
#[must_use]
pub fn fragment_entry_bytes(entry: FragmentEntry) -> [u8; FRAGMENT_ENTRY_SIZE] {
    let mut out = [0_u8; FRAGMENT_ENTRY_SIZE];
    out[0..8].copy_from_slice(&entry.start.to_le_bytes());
    let mut size_word = entry.size;
    if !entry.compressed {
        size_word |= FRAGMENT_UNCOMPRESSED_FLAG;
    }
    out[8..12].copy_from_slice(&size_word.to_le_bytes());
    out
}

/// Load the whole fragment table through its first-level index.
pub(crate) fn read_fragment_table(
    superblock: &Superblock,
    meta: &MetaStore,
) -> Result<Vec<FragmentEntry>> {
    if !superblock.has_fragments() {
        return Ok(Vec::new());
    }

    let block_count = superblock
        .fragment_count
        .div_ceil(FRAGMENT_ENTRIES_PER_BLOCK);
    let mut index = vec![0_u8; block_count as usize * 8];
    meta.read_at(&mut index, superblock.fragment_table_start)?;

    let mut entries = Vec::with_capacity(superblock.fragment_count as usize);
    for i in 0..block_count as usize {
        let pos = read_le_u64(&index, 8 * i)?;
        let block = meta.read_meta_block(pos)?;
        for chunk in block.data.chunks_exact(FRAGMENT_ENTRY_SIZE) {
            if entries.len() == superblock.fragment_count as usize {
                break;
            }
            entries.push(parse_fragment_entry(chunk)?);
        }
    }

    if entries.len() != superblock.fragment_count as usize {
        return Err(DiskError::Format(format!(
            "fragment table holds {} entries, superblock promises {}",
            entries.len(),
            superblock.fragment_count
        )));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trip() {
        let entry = FragmentEntry {
            start: 0x0001_0203_0405,
            size: 12_345,
            compressed: true,
        };
        let decoded = parse_fragment_entry(&fragment_entry_bytes(entry)).expect("decode");
        assert_eq!(decoded, entry);
    }

    #[test]
    fn uncompressed_flag_is_bit_24() {
        let entry = FragmentEntry {
            start: 96,
            size: 17,
            compressed: false,
        };
        let bytes = fragment_entry_bytes(entry);
        assert_eq!(read_le_u32(&bytes, 8).unwrap(), 17 | (1 << 24));
        let decoded = parse_fragment_entry(&bytes).expect("decode");
        assert!(!decoded.compressed);
        assert_eq!(decoded.size, 17);
    }

    #[test]
    fn short_entry_is_an_error() {
        assert!(parse_fragment_entry(&[0_u8; 8]).is_err());
    }
}
