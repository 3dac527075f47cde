#![forbid(unsafe_code)]
//! Read-only SquashFS 4.0 engine.
//!
//! Opens an image inside a backing-store region, pre-loads the fragment,
//! id, and xattr tables, and serves directory listings and streaming file
//! reads through a shared decompressed-block cache. Mutation is only
//! possible on a handle created with [`SquashFs::create`], which stages
//! content in a scratch workspace; serializing that workspace into an
//! image is a separate concern.

pub mod compressor;
pub mod directory;
pub mod file;
pub mod fragment;
pub mod idtable;
pub mod inode;
pub mod metadata;
pub mod superblock;
pub mod synth;
pub mod xattr;

use crate::compressor::Compressor;
use crate::directory::{DIR_SIZE_BIAS, RawDirEntry, parse_directory};
use crate::file::{FilePlan, SquashFile};
use crate::fragment::FragmentEntry;
use crate::inode::{
    BodyParse, INODE_HEADER_SIZE, Inode, InodeBody, InodeType, NO_FRAGMENT, corrupt,
    parse_inode_body, parse_inode_header,
};
use crate::metadata::MetaStore;
use crate::superblock::{InodeRef, Superblock};
use crate::xattr::XattrTable;
use std::collections::BTreeMap;
use std::io::Read as _;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, warn};
use vdisk_backend::Backend;
use vdisk_error::{DiskError, Result};
use vdisk_fs::{DirEntry, File, FileKind, Filesystem, FilesystemType, OpenFlags};
use vdisk_types::{BlockSize, ByteOffset, SQUASH_SUPERBLOCK_SIZE};

/// Default decompressed-block cache budget in bytes.
pub const DEFAULT_CACHE_SIZE: usize = 128 << 20;
/// Default data block size for created filesystems.
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;

/// Shared read-side state of one open image.
pub(crate) struct Inner {
    pub(crate) meta: MetaStore,
    pub(crate) superblock: Superblock,
    pub(crate) fragments: Vec<FragmentEntry>,
    pub(crate) ids: Vec<u32>,
    pub(crate) xattrs: Option<XattrTable>,
}

impl Inner {
    /// Resolve the inode at `locator`.
    ///
    /// `hint` is the type the referrer expects; the header parsed from the
    /// metadata stream is authoritative, and the read is widened when the
    /// real type or a trailing array needs more bytes.
    pub(crate) fn inode_at(&self, locator: InodeRef, hint: InodeType) -> Result<Inode> {
        let table = self.superblock.inode_table_start;
        let block_size = self.superblock.block_size.get();

        let mut want = INODE_HEADER_SIZE + hint.min_body_size();
        let mut data = self
            .meta
            .read_metadata(table, locator.block, locator.offset, want)?;

        let header = parse_inode_header(&data, locator)?;
        if header.itype != hint {
            want = INODE_HEADER_SIZE + header.itype.min_body_size();
            if want > data.len() {
                data = self
                    .meta
                    .read_metadata(table, locator.block, locator.offset, want)?;
            }
        }

        let body = match parse_inode_body(
            &data[INODE_HEADER_SIZE..],
            block_size,
            header.itype,
            locator,
        )? {
            BodyParse::Done(body) => body,
            BodyParse::NeedMore(total) => {
                let data = self.meta.read_metadata(
                    table,
                    locator.block,
                    locator.offset,
                    INODE_HEADER_SIZE + total,
                )?;
                match parse_inode_body(
                    &data[INODE_HEADER_SIZE..],
                    block_size,
                    header.itype,
                    locator,
                )? {
                    BodyParse::Done(body) => body,
                    BodyParse::NeedMore(_) => {
                        return Err(corrupt(locator, "inode body truncated after re-read"));
                    }
                }
            }
        };

        Ok(Inode { header, body })
    }

    /// The raw listing of a directory inode.
    pub(crate) fn directory_entries(&self, inode: &Inode) -> Result<Vec<RawDirEntry>> {
        let (block, offset, stored_size) = match inode.body {
            InodeBody::BasicDirectory {
                start_block,
                offset,
                file_size,
                ..
            } => (start_block, offset, u64::from(file_size)),
            InodeBody::ExtendedDirectory {
                start_block,
                offset,
                file_size,
                ..
            } => (start_block, offset, u64::from(file_size)),
            _ => {
                return Err(DiskError::NotADirectory(format!(
                    "inode {} is not a directory",
                    inode.header.number
                )));
            }
        };

        let listing_len =
            vdisk_types::u64_to_usize(stored_size.saturating_sub(DIR_SIZE_BIAS), "dir_size")?;
        if listing_len == 0 {
            return Ok(Vec::new());
        }

        let locator = InodeRef { block, offset };
        let data = self.meta.read_metadata(
            self.superblock.directory_table_start,
            block,
            offset,
            listing_len,
        )?;
        parse_directory(&data[..listing_len], locator)
    }

    /// The tail bytes `[offset, offset + len)` of fragment `index`.
    pub(crate) fn read_fragment(&self, index: u32, offset: u32, len: u64) -> Result<Vec<u8>> {
        let Some(entry) = self.fragments.get(index as usize) else {
            return Err(DiskError::Format(format!(
                "fragment index {index} outside table of {}",
                self.fragments.len()
            )));
        };
        let block = self.meta.fragment_block(
            entry.start,
            entry.size,
            entry.compressed,
            self.superblock.block_size.get() as usize,
        )?;

        let start = offset as usize;
        let end = start + vdisk_types::u64_to_usize(len, "fragment_tail")?;
        if end > block.data.len() {
            return Err(DiskError::Format(format!(
                "fragment tail {start}..{end} outside block of {} bytes",
                block.data.len()
            )));
        }
        Ok(block.data[start..end].to_vec())
    }

    /// Walk `parts` from `from`, returning the listing of the final
    /// directory.
    fn walk(&self, from: &Inode, parts: &[&str], full_path: &str) -> Result<Vec<RawDirEntry>> {
        let entries = self.directory_entries(from)?;
        let Some((head, tail)) = parts.split_first() else {
            return Ok(entries);
        };

        let Some(found) = entries.iter().find(|e| e.name == head.as_bytes()) else {
            return Err(DiskError::NotFound(full_path.to_owned()));
        };
        if found.itype != InodeType::BasicDirectory {
            return Err(DiskError::NotADirectory(full_path.to_owned()));
        }
        let child = self.inode_at(found.inode_ref(), found.itype)?;
        if !child.header.itype.is_directory() {
            return Err(corrupt(
                found.inode_ref(),
                "directory entry resolves to a non-directory inode",
            ));
        }
        self.walk(&child, tail, full_path)
    }

    /// Flesh a raw entry out with inode metadata, ids, and xattrs.
    fn hydrate(&self, raw: &RawDirEntry) -> Result<DirEntry> {
        let locator = raw.inode_ref();
        let inode = self.inode_at(locator, raw.itype)?;
        if inode.header.itype.basic_kind() != raw.itype {
            return Err(corrupt(
                locator,
                "inode type does not match its directory entry class",
            ));
        }

        let uid_idx = inode.header.uid_idx;
        let gid_idx = inode.header.gid_idx;
        let uid = idtable::lookup_id(&self.ids, uid_idx, "uid")
            .map_err(|_| corrupt(locator, &format!("uid index {uid_idx} outside id table")))?;
        let gid = idtable::lookup_id(&self.ids, gid_idx, "gid")
            .map_err(|_| corrupt(locator, &format!("gid index {gid_idx} outside id table")))?;

        let xattrs = match (inode.body.xattr_index(), &self.xattrs) {
            (Some(index), Some(table)) => table.find(index)?,
            _ => BTreeMap::new(),
        };

        let kind = match inode.header.itype.basic_kind() {
            InodeType::BasicDirectory => FileKind::Directory,
            InodeType::BasicFile => FileKind::Regular,
            InodeType::BasicSymlink => FileKind::Symlink,
            InodeType::BasicBlockDevice => FileKind::BlockDevice,
            InodeType::BasicCharDevice => FileKind::CharDevice,
            InodeType::BasicFifo => FileKind::Fifo,
            InodeType::BasicSocket => FileKind::Socket,
            extended => {
                return Err(corrupt(
                    locator,
                    &format!("unexpected extended class {extended:?}"),
                ));
            }
        };

        Ok(DirEntry {
            name: String::from_utf8_lossy(&raw.name).into_owned(),
            kind,
            size: inode.body.size(),
            mtime: inode.header.mtime,
            mode: inode.header.mode,
            uid,
            gid,
            xattrs,
        })
    }

    /// Build the streaming plan for a regular-file inode.
    fn file_plan(&self, inode: &Inode, locator: InodeRef) -> Result<FilePlan> {
        let (blocks_start, file_size, frag_index, frag_offset, block_sizes) = match &inode.body {
            InodeBody::BasicFile {
                blocks_start,
                frag_index,
                frag_offset,
                file_size,
                block_sizes,
            } => (
                u64::from(*blocks_start),
                u64::from(*file_size),
                *frag_index,
                *frag_offset,
                block_sizes.clone(),
            ),
            InodeBody::ExtendedFile {
                blocks_start,
                file_size,
                frag_index,
                frag_offset,
                block_sizes,
                ..
            } => (
                *blocks_start,
                *file_size,
                *frag_index,
                *frag_offset,
                block_sizes.clone(),
            ),
            _ => {
                return Err(DiskError::Format(format!(
                    "inode {} is not a regular file",
                    inode.header.number
                )));
            }
        };

        let fragment = if frag_index == NO_FRAGMENT {
            None
        } else {
            if frag_index as usize >= self.fragments.len() {
                return Err(corrupt(
                    locator,
                    &format!(
                        "fragment index {frag_index} outside table of {}",
                        self.fragments.len()
                    ),
                ));
            }
            Some((frag_index, frag_offset))
        };

        Ok(FilePlan {
            blocks_start,
            block_sizes,
            fragment,
            file_size,
        })
    }
}

enum Mode {
    /// An image parsed from a backing store; read-only.
    Image { inner: Arc<Inner>, root: Inode },
    /// A staged filesystem-to-be, backed by a scratch directory.
    Workspace { dir: TempDir },
    /// Everything released; only `close` is a no-op from here.
    Closed,
}

/// One open SquashFS.
pub struct SquashFs {
    mode: Mode,
    closed: bool,
}

impl SquashFs {
    /// Open an existing image occupying `[start, start + size)` of the
    /// backing store, with the default cache budget.
    pub fn read(backend: Arc<dyn Backend>, size: u64, start: u64) -> Result<Self> {
        Self::read_with_cache(backend, size, start, DEFAULT_CACHE_SIZE)
    }

    /// Open an existing image with an explicit cache budget in bytes.
    ///
    /// The cache holds `cache_bytes / block_size` decompressed blocks;
    /// zero disables caching.
    pub fn read_with_cache(
        backend: Arc<dyn Backend>,
        size: u64,
        start: u64,
        cache_bytes: usize,
    ) -> Result<Self> {
        let mut raw = [0_u8; SQUASH_SUPERBLOCK_SIZE];
        backend.read_exact_at(&mut raw, ByteOffset(start))?;
        let superblock = Superblock::parse(&raw)?;
        debug!(
            target: "vdisk::squash",
            block_size = superblock.block_size.get(),
            inodes = superblock.inode_count,
            compression = superblock.compression_id,
            "parsed superblock"
        );

        if size > 0 && superblock.bytes_used > size {
            return Err(DiskError::CorruptSuperblock { field: "bytes_used" });
        }

        let compressor = Compressor::new(superblock.compression_id)?;
        let cache_slots = cache_bytes / superblock.block_size.get() as usize;
        let meta = MetaStore::new(backend, start, compressor, cache_slots);

        let fragments = fragment::read_fragment_table(&superblock, &meta)?;
        let ids = idtable::read_id_table(&superblock, &meta)?;
        let xattrs = xattr::read_xattr_table(&superblock, &meta)?;

        let inner = Inner {
            meta,
            superblock,
            fragments,
            ids,
            xattrs,
        };
        // The root inode is read eagerly; everything else resolves lazily.
        let root = inner.inode_at(inner.superblock.root_inode, InodeType::BasicDirectory)?;
        if !root.header.itype.is_directory() {
            return Err(corrupt(
                inner.superblock.root_inode,
                "root inode is not a directory",
            ));
        }

        Ok(Self {
            mode: Mode::Image {
                inner: Arc::new(inner),
                root,
            },
            closed: false,
        })
    }

    /// Stage a new filesystem in a scratch workspace.
    ///
    /// Content written through this handle lands in the workspace;
    /// serializing it into an image happens elsewhere.
    pub fn create(block_size: u32) -> Result<Self> {
        let block_size = if block_size == 0 {
            DEFAULT_BLOCK_SIZE
        } else {
            block_size
        };
        if BlockSize::new(block_size).is_err() {
            return Err(DiskError::UnsupportedBlocksize {
                value: u64::from(block_size),
            });
        }
        let dir = TempDir::with_prefix("vdisk_squash")?;
        Ok(Self {
            mode: Mode::Workspace { dir },
            closed: false,
        })
    }

    /// The staging directory of a created filesystem.
    #[must_use]
    pub fn workspace(&self) -> Option<&std::path::Path> {
        match &self.mode {
            Mode::Workspace { dir } => Some(dir.path()),
            Mode::Image { .. } | Mode::Closed => None,
        }
    }

    /// The parsed superblock of an opened image.
    #[must_use]
    pub fn superblock(&self) -> Option<&Superblock> {
        match &self.mode {
            Mode::Image { inner, .. } => Some(&inner.superblock),
            Mode::Workspace { .. } | Mode::Closed => None,
        }
    }

    /// The root inode's type tag, for diagnostics.
    #[must_use]
    pub fn root_inode_type(&self) -> Option<InodeType> {
        match &self.mode {
            Mode::Image { root, .. } => Some(root.header.itype),
            Mode::Workspace { .. } | Mode::Closed => None,
        }
    }

    /// Change the cache budget in bytes; zero or less disables caching.
    pub fn set_cache_size(&self, cache_bytes: usize) {
        if let Mode::Image { inner, .. } = &self.mode {
            let slots = cache_bytes / inner.superblock.block_size.get() as usize;
            inner.meta.cache.set_capacity(slots);
        }
    }

    /// Counters of the shared decompressed-block cache.
    #[must_use]
    pub fn cache_metrics(&self) -> Option<metadata::CacheMetrics> {
        match &self.mode {
            Mode::Image { inner, .. } => Some(inner.meta.cache.metrics()),
            Mode::Workspace { .. } | Mode::Closed => None,
        }
    }

    /// The current cache budget in bytes.
    #[must_use]
    pub fn cache_size(&self) -> usize {
        match &self.mode {
            Mode::Image { inner, .. } => {
                inner.meta.cache.capacity() * inner.superblock.block_size.get() as usize
            }
            Mode::Workspace { .. } | Mode::Closed => 0,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(DiskError::BackendClosed);
        }
        Ok(())
    }

    fn split_path(path: &str) -> Vec<&str> {
        path.split('/').filter(|part| !part.is_empty()).collect()
    }

    fn image_read_dir(inner: &Arc<Inner>, root: &Inode, path: &str) -> Result<Vec<DirEntry>> {
        let parts = Self::split_path(path);
        let raw = inner.walk(root, &parts, path)?;
        let mut entries = Vec::with_capacity(raw.len());
        for entry in &raw {
            entries.push(inner.hydrate(entry)?);
        }
        Ok(entries)
    }

    fn image_open(
        inner: &Arc<Inner>,
        root: &Inode,
        path: &str,
        flags: OpenFlags,
    ) -> Result<Box<dyn File>> {
        // Write intent fails before the path is even looked at.
        if flags.wants_write() {
            return Err(DiskError::ReadOnly);
        }

        let mut parts = Self::split_path(path);
        let Some(filename) = parts.pop() else {
            return Err(DiskError::IsADirectory(path.to_owned()));
        };

        let entries = inner.walk(root, &parts, path)?;
        let Some(found) = entries.iter().find(|e| e.name == filename.as_bytes()) else {
            return Err(DiskError::NotFound(path.to_owned()));
        };
        if found.itype == InodeType::BasicDirectory {
            return Err(DiskError::IsADirectory(path.to_owned()));
        }
        if found.itype != InodeType::BasicFile {
            return Err(DiskError::Format(format!(
                "cannot stream non-regular file {path}"
            )));
        }

        let locator = found.inode_ref();
        let inode = inner.inode_at(locator, found.itype)?;
        let plan = inner.file_plan(&inode, locator)?;
        Ok(Box::new(SquashFile::new(Arc::clone(inner), plan)))
    }

    /// Read a symlink's target bytes.
    pub fn read_link(&self, path: &str) -> Result<Vec<u8>> {
        self.check_open()?;
        let Mode::Image { inner, root } = &self.mode else {
            return Err(DiskError::NotImplemented);
        };
        let mut parts = Self::split_path(path);
        let Some(filename) = parts.pop() else {
            return Err(DiskError::IsADirectory(path.to_owned()));
        };
        let entries = inner.walk(root, &parts, path)?;
        let Some(found) = entries.iter().find(|e| e.name == filename.as_bytes()) else {
            return Err(DiskError::NotFound(path.to_owned()));
        };
        let inode = inner.inode_at(found.inode_ref(), found.itype)?;
        match inode.body {
            InodeBody::BasicSymlink { target, .. } | InodeBody::ExtendedSymlink { target, .. } => {
                Ok(target)
            }
            _ => Err(DiskError::Format(format!("{path} is not a symlink"))),
        }
    }

    fn workspace_not_found(err: std::io::Error, path: &str) -> DiskError {
        if err.kind() == std::io::ErrorKind::NotFound {
            DiskError::NotFound(path.to_owned())
        } else {
            err.into()
        }
    }

    fn workspace_read_dir(dir: &TempDir, path: &str) -> Result<Vec<DirEntry>> {
        let full = dir.path().join(path.trim_start_matches('/'));
        let mut entries = Vec::new();
        for item in std::fs::read_dir(&full).map_err(|err| Self::workspace_not_found(err, path))? {
            let item = item?;
            let meta = item.metadata()?;
            let kind = if meta.is_dir() {
                FileKind::Directory
            } else if meta.file_type().is_symlink() {
                FileKind::Symlink
            } else {
                FileKind::Regular
            };
            #[allow(clippy::cast_possible_truncation)] // seconds fit until 2106
            let mtime = meta.mtime().max(0) as u32;
            #[allow(clippy::cast_possible_truncation)] // permission bits only
            let mode = (meta.permissions().mode() & 0o7777) as u16;
            entries.push(DirEntry {
                name: item.file_name().to_string_lossy().into_owned(),
                kind,
                size: meta.len(),
                mtime,
                mode,
                uid: meta.uid(),
                gid: meta.gid(),
                xattrs: BTreeMap::new(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn workspace_open(dir: &TempDir, path: &str, flags: OpenFlags) -> Result<Box<dyn File>> {
        let full = dir.path().join(path.trim_start_matches('/'));
        let mut options = std::fs::OpenOptions::new();
        options
            .read(!flags.contains(OpenFlags::WRONLY) || flags.contains(OpenFlags::RDWR))
            .write(flags.wants_write())
            .append(flags.contains(OpenFlags::APPEND))
            .create(flags.contains(OpenFlags::CREATE))
            .truncate(flags.contains(OpenFlags::TRUNCATE))
            .create_new(flags.contains(OpenFlags::EXCLUSIVE));
        let file = options
            .open(&full)
            .map_err(|err| Self::workspace_not_found(err, path))?;
        Ok(Box::new(file))
    }
}

impl Filesystem for SquashFs {
    fn fs_type(&self) -> FilesystemType {
        FilesystemType::Squash
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.check_open()?;
        match &self.mode {
            Mode::Image { inner, root } => Self::image_read_dir(inner, root, path),
            Mode::Workspace { dir } => Self::workspace_read_dir(dir, path),
            Mode::Closed => Err(DiskError::BackendClosed),
        }
    }

    fn open(&self, path: &str, flags: OpenFlags) -> Result<Box<dyn File>> {
        self.check_open()?;
        match &self.mode {
            Mode::Image { inner, root } => Self::image_open(inner, root, path, flags),
            Mode::Workspace { dir } => Self::workspace_open(dir, path, flags),
            Mode::Closed => Err(DiskError::BackendClosed),
        }
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        self.check_open()?;
        match &self.mode {
            Mode::Image { .. } => Err(DiskError::ReadOnly),
            Mode::Workspace { dir } => {
                std::fs::create_dir_all(dir.path().join(path.trim_start_matches('/')))?;
                Ok(())
            }
            Mode::Closed => Err(DiskError::BackendClosed),
        }
    }

    fn label(&self) -> String {
        // The format stores no volume label.
        String::new()
    }

    fn set_label(&mut self, _label: &str) -> Result<()> {
        Err(DiskError::ReadOnly)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match std::mem::replace(&mut self.mode, Mode::Closed) {
            Mode::Image { inner, .. } => inner.meta.cache.clear(),
            Mode::Workspace { dir } => {
                // Workspace removal failures are logged, not fatal.
                if let Err(err) = dir.close() {
                    warn!(
                        target: "vdisk::squash",
                        error = %err,
                        "failed to remove staging workspace"
                    );
                }
            }
            Mode::Closed => {}
        }
        Ok(())
    }
}

/// Convenience: read a whole file out of an opened image.
pub fn read_file_contents(fs: &SquashFs, path: &str) -> Result<Vec<u8>> {
    let mut handle = fs.open(path, OpenFlags::RDONLY)?;
    let mut out = Vec::new();
    handle.read_to_end(&mut out)?;
    Ok(out)
}
