//! Directory table records.
//!
//! A directory's listing is a chain of runs: a 12-byte header naming the
//! inode-table metadata block shared by up to 256 entries, then the
//! entries themselves, each with a per-block offset, a type class, and a
//! name. Header and entry together reconstruct the (block, offset, type)
//! triple of the child's inode.

use crate::inode::InodeType;
use crate::superblock::InodeRef;
use vdisk_error::{DiskError, Result};
use vdisk_types::{read_le_u16, read_le_u32};

/// On-disk size of one run header.
pub const DIR_HEADER_SIZE: usize = 12;
/// Most entries one run may carry.
pub const DIR_MAX_ENTRIES_PER_RUN: usize = 256;
/// Directory listing sizes are biased by the three virtual bytes of the
/// `.`/`..` entries.
pub const DIR_SIZE_BIAS: u64 = 3;

/// One directory entry with its inode location resolved against the run
/// header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDirEntry {
    /// Metadata-block offset of the child's inode, from the run header.
    pub block: u32,
    /// Offset of the child's inode within its decompressed block.
    pub offset: u16,
    pub inode_number: u32,
    /// Basic type class the child's inode must match.
    pub itype: InodeType,
    /// Name bytes; comparison is byte-exact and case-sensitive.
    pub name: Vec<u8>,
}

impl RawDirEntry {
    #[must_use]
    pub fn inode_ref(&self) -> InodeRef {
        InodeRef {
            block: self.block,
            offset: self.offset,
        }
    }
}

/// Parse a directory listing of exactly `data` bytes (bias already
/// subtracted by the caller).
pub fn parse_directory(data: &[u8], locator: InodeRef) -> Result<Vec<RawDirEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0_usize;

    while pos + DIR_HEADER_SIZE <= data.len() {
        let count = read_le_u32(data, pos)? as usize + 1;
        let start_block = read_le_u32(data, pos + 4)?;
        let base_inode = read_le_u32(data, pos + 8)?;
        pos += DIR_HEADER_SIZE;

        if count > DIR_MAX_ENTRIES_PER_RUN {
            return Err(corrupt_dir(
                locator,
                &format!("run of {count} entries exceeds the 256-entry limit"),
            ));
        }

        for _ in 0..count {
            if pos + 8 > data.len() {
                return Err(corrupt_dir(locator, "entry header past end of listing"));
            }
            let offset = read_le_u16(data, pos)?;
            let inode_delta = read_le_u16(data, pos + 2)? as i16;
            let raw_type = read_le_u16(data, pos + 4)?;
            let name_size = read_le_u16(data, pos + 6)? as usize + 1;
            pos += 8;

            if pos + name_size > data.len() {
                return Err(corrupt_dir(locator, "entry name past end of listing"));
            }
            let name = data[pos..pos + name_size].to_vec();
            pos += name_size;

            let Some(itype) = InodeType::from_u16(raw_type) else {
                return Err(corrupt_dir(
                    locator,
                    &format!("unknown entry type {raw_type}"),
                ));
            };

            let inode_number = base_inode.wrapping_add_signed(i32::from(inode_delta));
            entries.push(RawDirEntry {
                block: start_block,
                offset,
                inode_number,
                itype: itype.basic_kind(),
                name,
            });
        }
    }

    Ok(entries)
}

fn corrupt_dir(locator: InodeRef, detail: &str) -> DiskError {
    DiskError::CorruptDirectory {
        block: u64::from(locator.block),
        offset: u32::from(locator.offset),
        detail: detail.to_owned(),
    }
}

/// Serialize a listing into run records (single-run for ≤256 entries).
///
/// Test support for building synthetic images; entries must share
/// `start_block`.
#[must_use]
pub fn build_directory(start_block: u32, base_inode: u32, entries: &[(u16, u32, InodeType, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    if entries.is_empty() {
        return out;
    }
    assert!(entries.len() <= DIR_MAX_ENTRIES_PER_RUN);

    out.extend_from_slice(&((entries.len() - 1) as u32).to_le_bytes());
    out.extend_from_slice(&start_block.to_le_bytes());
    out.extend_from_slice(&base_inode.to_le_bytes());
    for (offset, inode_number, itype, name) in entries {
        let delta = i64::from(*inode_number) - i64::from(base_inode);
        let delta = i16::try_from(delta).expect("inode delta fits i16");
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&delta.to_le_bytes());
        out.extend_from_slice(&itype.to_u16().to_le_bytes());
        out.extend_from_slice(&((name.len() - 1) as u16).to_le_bytes());
        out.extend_from_slice(name);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOC: InodeRef = InodeRef { block: 0, offset: 0 };

    #[test]
    fn parse_single_run() {
        let listing = build_directory(
            64,
            100,
            &[
                (32, 100, InodeType::BasicDirectory, b"etc"),
                (96, 101, InodeType::BasicFile, b"kernel.img"),
                (160, 103, InodeType::BasicSymlink, b"init"),
            ],
        );
        let entries = parse_directory(&listing, LOC).expect("parse");
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].name, b"etc");
        assert_eq!(entries[0].block, 64);
        assert_eq!(entries[0].offset, 32);
        assert_eq!(entries[0].inode_number, 100);
        assert_eq!(entries[0].itype, InodeType::BasicDirectory);

        assert_eq!(entries[1].name, b"kernel.img");
        assert_eq!(entries[1].inode_number, 101);
        assert_eq!(entries[2].itype, InodeType::BasicSymlink);
        assert_eq!(entries[2].inode_ref(), InodeRef { block: 64, offset: 160 });
    }

    #[test]
    fn parse_multiple_runs() {
        let mut listing = build_directory(64, 10, &[(0, 10, InodeType::BasicFile, b"a")]);
        listing.extend_from_slice(&build_directory(
            8192,
            50,
            &[(16, 49, InodeType::BasicFile, b"b")],
        ));

        let entries = parse_directory(&listing, LOC).expect("parse");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].block, 64);
        assert_eq!(entries[1].block, 8192);
        // Negative inode delta resolves against the run's base.
        assert_eq!(entries[1].inode_number, 49);
    }

    #[test]
    fn empty_listing_has_no_entries() {
        assert!(parse_directory(&[], LOC).expect("parse").is_empty());
        // A trailing stub shorter than a header is ignored, matching the
        // 3-byte bias left by over-reads.
        assert!(parse_directory(&[0, 0], LOC).expect("parse").is_empty());
    }

    #[test]
    fn oversized_run_is_corrupt() {
        let mut listing = Vec::new();
        listing.extend_from_slice(&300_u32.to_le_bytes());
        listing.extend_from_slice(&0_u32.to_le_bytes());
        listing.extend_from_slice(&1_u32.to_le_bytes());
        assert!(matches!(
            parse_directory(&listing, LOC).unwrap_err(),
            DiskError::CorruptDirectory { .. }
        ));
    }

    #[test]
    fn truncated_name_is_corrupt() {
        let mut listing = build_directory(0, 1, &[(0, 1, InodeType::BasicFile, b"file")]);
        listing.truncate(listing.len() - 2);
        assert!(matches!(
            parse_directory(&listing, LOC).unwrap_err(),
            DiskError::CorruptDirectory { .. }
        ));
    }

    #[test]
    fn unknown_entry_type_is_corrupt() {
        let mut listing = build_directory(0, 1, &[(0, 1, InodeType::BasicFile, b"x")]);
        // Entry type field sits after header (12) + offset (2) + delta (2).
        listing[16] = 99;
        assert!(matches!(
            parse_directory(&listing, LOC).unwrap_err(),
            DiskError::CorruptDirectory { .. }
        ));
    }
}
