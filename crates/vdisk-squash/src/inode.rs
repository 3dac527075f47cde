//! Inode records.
//!
//! Every inode is a 16-byte common header followed by a body whose layout
//! depends on the type tag. File bodies end in a variable-length array of
//! per-block sizes, so parsing may report how many more bytes it needs
//! before it can finish; the resolver in `lib.rs` re-reads and retries.

use crate::superblock::InodeRef;
use vdisk_error::{DiskError, Result};
use vdisk_types::{read_le_u16, read_le_u32, read_le_u64};

/// On-disk size of the common inode header.
pub const INODE_HEADER_SIZE: usize = 16;

/// Fragment-index sentinel for "no fragment tail".
pub const NO_FRAGMENT: u32 = 0xFFFF_FFFF;
/// Xattr-index sentinel for "no extended attributes".
pub const NO_XATTR: u32 = 0xFFFF_FFFF;

/// Data-block size-word bit marking an uncompressed block.
pub const DATA_BLOCK_UNCOMPRESSED_FLAG: u32 = 1 << 24;

/// The fourteen inode type tags: basic/extended crossed with the seven
/// object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InodeType {
    BasicDirectory,
    BasicFile,
    BasicSymlink,
    BasicBlockDevice,
    BasicCharDevice,
    BasicFifo,
    BasicSocket,
    ExtendedDirectory,
    ExtendedFile,
    ExtendedSymlink,
    ExtendedBlockDevice,
    ExtendedCharDevice,
    ExtendedFifo,
    ExtendedSocket,
}

impl InodeType {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::BasicDirectory),
            2 => Some(Self::BasicFile),
            3 => Some(Self::BasicSymlink),
            4 => Some(Self::BasicBlockDevice),
            5 => Some(Self::BasicCharDevice),
            6 => Some(Self::BasicFifo),
            7 => Some(Self::BasicSocket),
            8 => Some(Self::ExtendedDirectory),
            9 => Some(Self::ExtendedFile),
            10 => Some(Self::ExtendedSymlink),
            11 => Some(Self::ExtendedBlockDevice),
            12 => Some(Self::ExtendedCharDevice),
            13 => Some(Self::ExtendedFifo),
            14 => Some(Self::ExtendedSocket),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_u16(self) -> u16 {
        match self {
            Self::BasicDirectory => 1,
            Self::BasicFile => 2,
            Self::BasicSymlink => 3,
            Self::BasicBlockDevice => 4,
            Self::BasicCharDevice => 5,
            Self::BasicFifo => 6,
            Self::BasicSocket => 7,
            Self::ExtendedDirectory => 8,
            Self::ExtendedFile => 9,
            Self::ExtendedSymlink => 10,
            Self::ExtendedBlockDevice => 11,
            Self::ExtendedCharDevice => 12,
            Self::ExtendedFifo => 13,
            Self::ExtendedSocket => 14,
        }
    }

    /// Minimum body size: the fixed part before any trailing array.
    #[must_use]
    pub fn min_body_size(self) -> usize {
        match self {
            Self::BasicDirectory => 16,
            Self::BasicFile => 16,
            Self::BasicSymlink => 8,
            Self::BasicBlockDevice | Self::BasicCharDevice => 8,
            Self::BasicFifo | Self::BasicSocket => 4,
            Self::ExtendedDirectory => 24,
            Self::ExtendedFile => 40,
            Self::ExtendedSymlink => 8,
            Self::ExtendedBlockDevice | Self::ExtendedCharDevice => 12,
            Self::ExtendedFifo | Self::ExtendedSocket => 8,
        }
    }

    #[must_use]
    pub fn is_directory(self) -> bool {
        matches!(self, Self::BasicDirectory | Self::ExtendedDirectory)
    }

    #[must_use]
    pub fn is_file(self) -> bool {
        matches!(self, Self::BasicFile | Self::ExtendedFile)
    }

    /// The directory-entry type class: a directory header may only refer to
    /// inodes whose basic kind matches the entry's.
    #[must_use]
    pub fn basic_kind(self) -> Self {
        match self {
            Self::ExtendedDirectory => Self::BasicDirectory,
            Self::ExtendedFile => Self::BasicFile,
            Self::ExtendedSymlink => Self::BasicSymlink,
            Self::ExtendedBlockDevice => Self::BasicBlockDevice,
            Self::ExtendedCharDevice => Self::BasicCharDevice,
            Self::ExtendedFifo => Self::BasicFifo,
            Self::ExtendedSocket => Self::BasicSocket,
            basic => basic,
        }
    }
}

/// The 16-byte common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeHeader {
    pub itype: InodeType,
    /// Permission bits; the type tag, not the mode, carries the file kind.
    pub mode: u16,
    pub uid_idx: u16,
    pub gid_idx: u16,
    pub mtime: u32,
    pub number: u32,
}

/// Parse the common header at the start of `data`.
pub fn parse_inode_header(data: &[u8], locator: InodeRef) -> Result<InodeHeader> {
    if data.len() < INODE_HEADER_SIZE {
        return Err(corrupt(locator, "inode shorter than its 16-byte header"));
    }
    let raw_type = read_le_u16(data, 0)?;
    let Some(itype) = InodeType::from_u16(raw_type) else {
        return Err(corrupt(locator, &format!("unknown inode type {raw_type}")));
    };
    Ok(InodeHeader {
        itype,
        mode: read_le_u16(data, 2)?,
        uid_idx: read_le_u16(data, 4)?,
        gid_idx: read_le_u16(data, 6)?,
        mtime: read_le_u32(data, 8)?,
        number: read_le_u32(data, 12)?,
    })
}

/// A parsed inode body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeBody {
    BasicDirectory {
        start_block: u32,
        nlink: u32,
        file_size: u16,
        offset: u16,
        parent: u32,
    },
    ExtendedDirectory {
        nlink: u32,
        file_size: u32,
        start_block: u32,
        parent: u32,
        index_count: u16,
        offset: u16,
        xattr: u32,
    },
    BasicFile {
        blocks_start: u32,
        frag_index: u32,
        frag_offset: u32,
        file_size: u32,
        block_sizes: Vec<u32>,
    },
    ExtendedFile {
        blocks_start: u64,
        file_size: u64,
        sparse: u64,
        nlink: u32,
        frag_index: u32,
        frag_offset: u32,
        xattr: u32,
        block_sizes: Vec<u32>,
    },
    BasicSymlink {
        nlink: u32,
        target: Vec<u8>,
    },
    ExtendedSymlink {
        nlink: u32,
        target: Vec<u8>,
        xattr: u32,
    },
    BasicDevice {
        nlink: u32,
        rdev: u32,
    },
    ExtendedDevice {
        nlink: u32,
        rdev: u32,
        xattr: u32,
    },
    BasicIpc {
        nlink: u32,
    },
    ExtendedIpc {
        nlink: u32,
        xattr: u32,
    },
}

impl InodeBody {
    /// Logical size: byte length for files and directories, target length
    /// for symlinks, zero for the rest.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::BasicDirectory { file_size, .. } => u64::from(*file_size),
            Self::ExtendedDirectory { file_size, .. } => u64::from(*file_size),
            Self::BasicFile { file_size, .. } => u64::from(*file_size),
            Self::ExtendedFile { file_size, .. } => *file_size,
            Self::BasicSymlink { target, .. } | Self::ExtendedSymlink { target, .. } => {
                target.len() as u64
            }
            _ => 0,
        }
    }

    /// Index into the xattr table, if the body carries one.
    #[must_use]
    pub fn xattr_index(&self) -> Option<u32> {
        let raw = match self {
            Self::ExtendedDirectory { xattr, .. }
            | Self::ExtendedFile { xattr, .. }
            | Self::ExtendedSymlink { xattr, .. }
            | Self::ExtendedDevice { xattr, .. }
            | Self::ExtendedIpc { xattr, .. } => *xattr,
            _ => NO_XATTR,
        };
        (raw != NO_XATTR).then_some(raw)
    }
}

/// A fully decoded inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub header: InodeHeader,
    pub body: InodeBody,
}

/// Outcome of one body-parse attempt.
#[derive(Debug)]
pub enum BodyParse {
    Done(InodeBody),
    /// The trailing array needs this total body size; re-read and retry.
    NeedMore(usize),
}

/// Number of data blocks covered by a file: files with a fragment tail
/// round down, files without round up.
#[must_use]
pub fn file_block_count(file_size: u64, block_size: u32, frag_index: u32) -> usize {
    let bs = u64::from(block_size);
    let blocks = if frag_index == NO_FRAGMENT {
        file_size.div_ceil(bs)
    } else {
        file_size / bs
    };
    usize::try_from(blocks).unwrap_or(usize::MAX)
}

/// Parse the body following the common header.
///
/// `data` is the byte stream after the header. Returns `NeedMore(total)`
/// when a trailing variable-length array extends past `data`.
pub fn parse_inode_body(
    data: &[u8],
    block_size: u32,
    itype: InodeType,
    locator: InodeRef,
) -> Result<BodyParse> {
    let min = itype.min_body_size();
    if data.len() < min {
        return Ok(BodyParse::NeedMore(min));
    }

    let body = match itype {
        InodeType::BasicDirectory => InodeBody::BasicDirectory {
            start_block: read_le_u32(data, 0)?,
            nlink: read_le_u32(data, 4)?,
            file_size: read_le_u16(data, 8)?,
            offset: read_le_u16(data, 10)?,
            parent: read_le_u32(data, 12)?,
        },
        InodeType::ExtendedDirectory => InodeBody::ExtendedDirectory {
            nlink: read_le_u32(data, 0)?,
            file_size: read_le_u32(data, 4)?,
            start_block: read_le_u32(data, 8)?,
            parent: read_le_u32(data, 12)?,
            index_count: read_le_u16(data, 16)?,
            offset: read_le_u16(data, 18)?,
            xattr: read_le_u32(data, 20)?,
        },
        InodeType::BasicFile => {
            let frag_index = read_le_u32(data, 4)?;
            let file_size = read_le_u32(data, 12)?;
            let count = file_block_count(u64::from(file_size), block_size, frag_index);
            let Some(total) = count.checked_mul(4).and_then(|n| n.checked_add(16)) else {
                return Err(corrupt(locator, "file block list size overflows"));
            };
            if data.len() < total {
                return Ok(BodyParse::NeedMore(total));
            }
            InodeBody::BasicFile {
                blocks_start: read_le_u32(data, 0)?,
                frag_index,
                frag_offset: read_le_u32(data, 8)?,
                file_size,
                block_sizes: read_block_sizes(data, 16, count)?,
            }
        }
        InodeType::ExtendedFile => {
            let file_size = read_le_u64(data, 8)?;
            let frag_index = read_le_u32(data, 28)?;
            let count = file_block_count(file_size, block_size, frag_index);
            let Some(total) = count.checked_mul(4).and_then(|n| n.checked_add(40)) else {
                return Err(corrupt(locator, "file block list size overflows"));
            };
            if data.len() < total {
                return Ok(BodyParse::NeedMore(total));
            }
            InodeBody::ExtendedFile {
                blocks_start: read_le_u64(data, 0)?,
                file_size,
                sparse: read_le_u64(data, 16)?,
                nlink: read_le_u32(data, 24)?,
                frag_index,
                frag_offset: read_le_u32(data, 32)?,
                xattr: read_le_u32(data, 36)?,
                block_sizes: read_block_sizes(data, 40, count)?,
            }
        }
        InodeType::BasicSymlink => {
            let target_size = read_le_u32(data, 4)? as usize;
            let total = 8 + target_size;
            if data.len() < total {
                return Ok(BodyParse::NeedMore(total));
            }
            InodeBody::BasicSymlink {
                nlink: read_le_u32(data, 0)?,
                target: data[8..total].to_vec(),
            }
        }
        InodeType::ExtendedSymlink => {
            let target_size = read_le_u32(data, 4)? as usize;
            let total = 8 + target_size + 4;
            if data.len() < total {
                return Ok(BodyParse::NeedMore(total));
            }
            InodeBody::ExtendedSymlink {
                nlink: read_le_u32(data, 0)?,
                target: data[8..8 + target_size].to_vec(),
                xattr: read_le_u32(data, 8 + target_size)?,
            }
        }
        InodeType::BasicBlockDevice | InodeType::BasicCharDevice => InodeBody::BasicDevice {
            nlink: read_le_u32(data, 0)?,
            rdev: read_le_u32(data, 4)?,
        },
        InodeType::ExtendedBlockDevice | InodeType::ExtendedCharDevice => {
            InodeBody::ExtendedDevice {
                nlink: read_le_u32(data, 0)?,
                rdev: read_le_u32(data, 4)?,
                xattr: read_le_u32(data, 8)?,
            }
        }
        InodeType::BasicFifo | InodeType::BasicSocket => InodeBody::BasicIpc {
            nlink: read_le_u32(data, 0)?,
        },
        InodeType::ExtendedFifo | InodeType::ExtendedSocket => InodeBody::ExtendedIpc {
            nlink: read_le_u32(data, 0)?,
            xattr: read_le_u32(data, 4)?,
        },
    };
    Ok(BodyParse::Done(body))
}

fn read_block_sizes(data: &[u8], offset: usize, count: usize) -> Result<Vec<u32>> {
    let mut sizes = Vec::with_capacity(count);
    for i in 0..count {
        sizes.push(read_le_u32(data, offset + 4 * i)?);
    }
    Ok(sizes)
}

pub(crate) fn corrupt(locator: InodeRef, detail: &str) -> DiskError {
    DiskError::CorruptInode {
        block: u64::from(locator.block),
        offset: u32::from(locator.offset),
        detail: detail.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOC: InodeRef = InodeRef { block: 0, offset: 0 };

    fn header_bytes(itype: u16, mode: u16, number: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&itype.to_le_bytes());
        out.extend_from_slice(&mode.to_le_bytes());
        out.extend_from_slice(&0_u16.to_le_bytes()); // uid idx
        out.extend_from_slice(&1_u16.to_le_bytes()); // gid idx
        out.extend_from_slice(&1_700_000_000_u32.to_le_bytes());
        out.extend_from_slice(&number.to_le_bytes());
        out
    }

    #[test]
    fn header_round_trip() {
        let bytes = header_bytes(1, 0o755, 42);
        let header = parse_inode_header(&bytes, LOC).expect("parse");
        assert_eq!(header.itype, InodeType::BasicDirectory);
        assert_eq!(header.mode, 0o755);
        assert_eq!(header.uid_idx, 0);
        assert_eq!(header.gid_idx, 1);
        assert_eq!(header.number, 42);
    }

    #[test]
    fn unknown_type_tag_is_corrupt() {
        let bytes = header_bytes(15, 0, 1);
        assert!(matches!(
            parse_inode_header(&bytes, InodeRef { block: 3, offset: 9 }).unwrap_err(),
            DiskError::CorruptInode {
                block: 3,
                offset: 9,
                ..
            }
        ));
    }

    #[test]
    fn basic_directory_body() {
        let mut body = Vec::new();
        body.extend_from_slice(&7_u32.to_le_bytes()); // start_block
        body.extend_from_slice(&2_u32.to_le_bytes()); // nlink
        body.extend_from_slice(&35_u16.to_le_bytes()); // file_size
        body.extend_from_slice(&64_u16.to_le_bytes()); // offset
        body.extend_from_slice(&1_u32.to_le_bytes()); // parent

        match parse_inode_body(&body, 131_072, InodeType::BasicDirectory, LOC).expect("parse") {
            BodyParse::Done(InodeBody::BasicDirectory {
                start_block,
                nlink,
                file_size,
                offset,
                parent,
            }) => {
                assert_eq!(start_block, 7);
                assert_eq!(nlink, 2);
                assert_eq!(file_size, 35);
                assert_eq!(offset, 64);
                assert_eq!(parent, 1);
            }
            other => panic!("unexpected parse outcome: {other:?}"),
        }
    }

    #[test]
    fn file_block_count_rounding() {
        // With a fragment tail: round down.
        assert_eq!(file_block_count(131_072 + 17, 131_072, 0), 1);
        // Without: round up.
        assert_eq!(file_block_count(131_072 + 17, 131_072, NO_FRAGMENT), 2);
        assert_eq!(file_block_count(0, 131_072, NO_FRAGMENT), 0);
        assert_eq!(file_block_count(131_072, 131_072, NO_FRAGMENT), 1);
    }

    #[test]
    fn basic_file_body_reports_needed_tail() {
        // A 3-block file (no fragment) needs 16 + 12 bytes of body.
        let mut body = Vec::new();
        body.extend_from_slice(&96_u32.to_le_bytes()); // blocks_start
        body.extend_from_slice(&NO_FRAGMENT.to_le_bytes());
        body.extend_from_slice(&0_u32.to_le_bytes()); // frag_offset
        body.extend_from_slice(&(3 * 4096_u32).to_le_bytes()); // file_size

        match parse_inode_body(&body, 4096, InodeType::BasicFile, LOC).expect("parse") {
            BodyParse::NeedMore(total) => assert_eq!(total, 16 + 12),
            BodyParse::Done(_) => panic!("should need the block-size array"),
        }

        for size in [100_u32, 200, 4096] {
            body.extend_from_slice(&size.to_le_bytes());
        }
        match parse_inode_body(&body, 4096, InodeType::BasicFile, LOC).expect("parse") {
            BodyParse::Done(InodeBody::BasicFile { block_sizes, .. }) => {
                assert_eq!(block_sizes, vec![100, 200, 4096]);
            }
            other => panic!("unexpected parse outcome: {other:?}"),
        }
    }

    #[test]
    fn symlink_body_carries_target_bytes() {
        let mut body = Vec::new();
        body.extend_from_slice(&1_u32.to_le_bytes());
        body.extend_from_slice(&11_u32.to_le_bytes());
        body.extend_from_slice(b"/etc/passwd");

        match parse_inode_body(&body, 4096, InodeType::BasicSymlink, LOC).expect("parse") {
            BodyParse::Done(InodeBody::BasicSymlink { nlink, target }) => {
                assert_eq!(nlink, 1);
                assert_eq!(target, b"/etc/passwd");
            }
            other => panic!("unexpected parse outcome: {other:?}"),
        }

        // Truncated target: the parser names the total it needs.
        match parse_inode_body(&body[..12], 4096, InodeType::BasicSymlink, LOC).expect("parse") {
            BodyParse::NeedMore(total) => assert_eq!(total, 8 + 11),
            BodyParse::Done(_) => panic!("should need the target bytes"),
        }
    }

    #[test]
    fn extended_file_body() {
        let mut body = Vec::new();
        body.extend_from_slice(&4096_u64.to_le_bytes()); // blocks_start
        body.extend_from_slice(&10_u64.to_le_bytes()); // file_size
        body.extend_from_slice(&0_u64.to_le_bytes()); // sparse
        body.extend_from_slice(&1_u32.to_le_bytes()); // nlink
        body.extend_from_slice(&0_u32.to_le_bytes()); // frag_index -> fragment 0
        body.extend_from_slice(&96_u32.to_le_bytes()); // frag_offset
        body.extend_from_slice(&NO_XATTR.to_le_bytes());
        // file_size 10 < block_size with a fragment: zero full blocks.

        match parse_inode_body(&body, 4096, InodeType::ExtendedFile, LOC).expect("parse") {
            BodyParse::Done(InodeBody::ExtendedFile {
                blocks_start,
                file_size,
                frag_index,
                frag_offset,
                block_sizes,
                ..
            }) => {
                assert_eq!(blocks_start, 4096);
                assert_eq!(file_size, 10);
                assert_eq!(frag_index, 0);
                assert_eq!(frag_offset, 96);
                assert!(block_sizes.is_empty());
            }
            other => panic!("unexpected parse outcome: {other:?}"),
        }
    }

    #[test]
    fn device_and_ipc_bodies() {
        let mut dev = Vec::new();
        dev.extend_from_slice(&1_u32.to_le_bytes());
        dev.extend_from_slice(&0x0103_u32.to_le_bytes());
        match parse_inode_body(&dev, 4096, InodeType::BasicCharDevice, LOC).expect("parse") {
            BodyParse::Done(InodeBody::BasicDevice { nlink, rdev }) => {
                assert_eq!(nlink, 1);
                assert_eq!(rdev, 0x0103);
            }
            other => panic!("unexpected parse outcome: {other:?}"),
        }

        let ipc = 3_u32.to_le_bytes();
        match parse_inode_body(&ipc, 4096, InodeType::BasicFifo, LOC).expect("parse") {
            BodyParse::Done(InodeBody::BasicIpc { nlink }) => assert_eq!(nlink, 3),
            other => panic!("unexpected parse outcome: {other:?}"),
        }
    }

    #[test]
    fn xattr_index_sentinel() {
        let body = InodeBody::ExtendedIpc {
            nlink: 1,
            xattr: NO_XATTR,
        };
        assert_eq!(body.xattr_index(), None);

        let body = InodeBody::ExtendedIpc { nlink: 1, xattr: 4 };
        assert_eq!(body.xattr_index(), Some(4));

        let body = InodeBody::BasicIpc { nlink: 1 };
        assert_eq!(body.xattr_index(), None);
    }

    #[test]
    fn basic_kind_collapses_extended_types() {
        assert_eq!(
            InodeType::ExtendedDirectory.basic_kind(),
            InodeType::BasicDirectory
        );
        assert_eq!(InodeType::ExtendedFile.basic_kind(), InodeType::BasicFile);
        assert_eq!(InodeType::BasicSymlink.basic_kind(), InodeType::BasicSymlink);
    }
}
