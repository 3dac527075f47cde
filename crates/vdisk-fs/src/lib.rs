#![forbid(unsafe_code)]
//! Common filesystem contract.
//!
//! Every filesystem the disk layer can host exposes the same shape:
//! enumerate a directory, open a file for streaming, create directories
//! where supported, and report a label and type tag. Read-only
//! filesystems keep the full surface and answer mutations with
//! `ReadOnly` instead of dropping the methods.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Seek, Write};
use vdisk_error::Result;
use vdisk_types::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK};

/// Tag identifying a filesystem variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilesystemType {
    Fat32,
    Iso9660,
    Ext4,
    Squash,
}

bitflags! {
    /// Conventional open-mode bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0;
        const WRONLY = 1 << 0;
        const RDWR = 1 << 1;
        const APPEND = 1 << 2;
        const CREATE = 1 << 3;
        const TRUNCATE = 1 << 4;
        const EXCLUSIVE = 1 << 5;
    }
}

impl OpenFlags {
    /// Whether any of the bits imply an intent to modify the file.
    #[must_use]
    pub fn wants_write(self) -> bool {
        self.intersects(
            Self::WRONLY | Self::RDWR | Self::APPEND | Self::CREATE | Self::TRUNCATE
                | Self::EXCLUSIVE,
        )
    }
}

/// The kind of object a directory entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// Derive the kind from the file-type bits of a POSIX mode word.
    #[must_use]
    pub fn from_mode(mode: u16) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(Self::Regular),
            S_IFDIR => Some(Self::Directory),
            S_IFLNK => Some(Self::Symlink),
            S_IFBLK => Some(Self::BlockDevice),
            S_IFCHR => Some(Self::CharDevice),
            S_IFIFO => Some(Self::Fifo),
            S_IFSOCK => Some(Self::Socket),
            _ => None,
        }
    }
}

/// One entry of a directory listing, hydrated with its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: u32,
    /// Permission bits (file-type bits stripped).
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub xattrs: BTreeMap<String, String>,
}

impl DirEntry {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// An open file: positioned streaming reads, writes where the filesystem
/// supports them.
pub trait File: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send + ?Sized> File for T {}

/// The operations every hosted filesystem exposes.
pub trait Filesystem: Send + Sync {
    /// Tag identifying the variant.
    fn fs_type(&self) -> FilesystemType;

    /// List the entries of the directory at an absolute path.
    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>>;

    /// Open the file at an absolute path for streaming.
    ///
    /// Any write intent against a read-only filesystem fails with
    /// `ReadOnly` before the path is resolved.
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Box<dyn File>>;

    /// Create a directory and any missing parents; idempotent.
    fn mkdir(&self, path: &str) -> Result<()>;

    /// The volume label, empty if the format has none.
    fn label(&self) -> String;

    /// Set the volume label where supported.
    fn set_label(&mut self, label: &str) -> Result<()>;

    /// Release cached resources and the backing store handle.
    fn close(&mut self) -> Result<()>;
}
