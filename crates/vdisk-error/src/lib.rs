#![forbid(unsafe_code)]
//! Error types for vdisk.
//!
//! Defines `DiskError` and a `Result<T>` alias used throughout the workspace.

use thiserror::Error;
use vdisk_types::ParseError;

/// Unified error type for all vdisk operations.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation on a closed backend")]
    BackendClosed,

    #[error("invalid partition: {reason}")]
    InvalidEntry { reason: String },

    #[error("checksum mismatch in {location}: expected {expected:#010x}, got {got:#010x}")]
    ChecksumMismatch {
        location: &'static str,
        expected: u32,
        got: u32,
    },

    #[error("partition {asked} out of range: table has {have} slots")]
    PartitionIndexOutOfRange { asked: usize, have: usize },

    #[error("partition too small: wrote {written} bytes of a partition holding {capacity}")]
    PartitionTooSmall { written: u64, capacity: u64 },

    #[error("corrupt superblock: {field}")]
    CorruptSuperblock { field: &'static str },

    #[error("corrupt inode at block {block}, offset {offset}: {detail}")]
    CorruptInode {
        block: u64,
        offset: u32,
        detail: String,
    },

    #[error("corrupt directory at block {block}, offset {offset}: {detail}")]
    CorruptDirectory {
        block: u64,
        offset: u32,
        detail: String,
    },

    #[error("unsupported compression id {id}")]
    UnsupportedCompression { id: u16 },

    #[error("unsupported block size {value}")]
    UnsupportedBlocksize { value: u64 },

    #[error("filesystem is read-only")]
    ReadOnly,

    #[error("not implemented")]
    NotImplemented,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl DiskError {
    /// Wrap this error for use behind `std::io` trait boundaries.
    #[must_use]
    pub fn into_io(self) -> std::io::Error {
        match self {
            Self::Io(err) => err,
            other => std::io::Error::other(other),
        }
    }
}

/// Result alias using `DiskError`.
pub type Result<T> = std::result::Result<T, DiskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_counts() {
        let err = DiskError::PartitionTooSmall {
            written: 512,
            capacity: 512,
        };
        let text = err.to_string();
        assert!(text.contains("512"), "{text}");

        let err = DiskError::InvalidEntry {
            reason: "data for partition was 15 bytes instead of expected 16".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "invalid partition: data for partition was 15 bytes instead of expected 16"
        );
    }

    #[test]
    fn parse_error_converts() {
        let parse = ParseError::InvalidField {
            field: "block_size",
            reason: "must be power of two in 4096..=1048576",
        };
        let err: DiskError = parse.into();
        assert!(matches!(err, DiskError::Parse(_)));
    }

    #[test]
    fn io_round_trip() {
        let err = DiskError::ReadOnly;
        let io = err.into_io();
        assert_eq!(io.kind(), std::io::ErrorKind::Other);
    }
}
