#![forbid(unsafe_code)]
//! Public façade: whole-disk images and their contents.
//!
//! A [`Disk`] wraps one backing store and exposes the two nested layers of
//! structure: the partition table dividing the store into regions, and one
//! filesystem per region. Partition numbers are 1-based throughout; 0
//! addresses the whole device where a filesystem operation accepts it.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use vdisk_backend::{Backend, FileBackend};
use vdisk_error::{DiskError, Result};
use vdisk_fs::{Filesystem, FilesystemType};
use vdisk_squash::SquashFs;
use vdisk_types::{DEFAULT_LOGICAL_SECTOR_SIZE, DEFAULT_PHYSICAL_SECTOR_SIZE};

pub use vdisk_backend::MemBackend;
pub use vdisk_error::Result as DiskResult;
pub use vdisk_fs::{DirEntry, File, OpenFlags};
pub use vdisk_partition::{
    Diagnostic, GptPartition, GptTable, MbrPartition, MbrTable, PartitionSummary, PartitionTable,
};

/// What to put on a partition (or the whole device) when creating a
/// filesystem.
#[derive(Debug, Clone)]
pub struct FilesystemSpec {
    /// 1-based partition number; 0 targets the whole device.
    pub partition: usize,
    pub fs_type: FilesystemType,
    pub volume_label: String,
    /// Data block size; 0 takes the filesystem's default.
    pub block_size: u32,
}

impl FilesystemSpec {
    #[must_use]
    pub fn new(partition: usize, fs_type: FilesystemType) -> Self {
        Self {
            partition,
            fs_type,
            volume_label: String::new(),
            block_size: 0,
        }
    }
}

/// One disk image or block device.
pub struct Disk {
    backend: Arc<dyn Backend>,
    pub size: u64,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
    /// The most recently read or written partition table.
    pub table: Option<PartitionTable>,
}

impl Disk {
    /// Open a disk image file (writable when permissions allow).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let backend = FileBackend::open(path)?;
        Ok(Self::from_backend(
            Arc::new(backend),
            DEFAULT_LOGICAL_SECTOR_SIZE,
            DEFAULT_PHYSICAL_SECTOR_SIZE,
        ))
    }

    /// Wrap an existing backend with explicit sector geometry.
    #[must_use]
    pub fn from_backend(
        backend: Arc<dyn Backend>,
        logical_sector_size: u32,
        physical_sector_size: u32,
    ) -> Self {
        let size = backend.size();
        Self {
            backend,
            size,
            logical_sector_size,
            physical_sector_size,
            table: None,
        }
    }

    /// Probe and remember the partition table.
    pub fn get_partition_table(&mut self) -> Result<&PartitionTable> {
        let table = PartitionTable::read(
            self.backend.as_ref(),
            self.logical_sector_size,
            self.physical_sector_size,
        )?
        .ok_or_else(|| DiskError::Format("unknown disk partition type".to_owned()))?;
        Ok(self.table.insert(table))
    }

    /// Write a partition table to the device and re-read it.
    pub fn partition(&mut self, mut table: PartitionTable) -> Result<()> {
        if !self.backend.writable() {
            return Err(DiskError::ReadOnly);
        }
        table.write(self.backend.as_ref(), self.size)?;
        self.table = Some(table);
        // Round-trip through the device so the cached table reflects what
        // was actually stored.
        self.get_partition_table()?;
        Ok(())
    }

    fn require_table(&self) -> Result<&PartitionTable> {
        self.table.as_ref().ok_or_else(|| {
            DiskError::Format("disk has no partition table; call get_partition_table".to_owned())
        })
    }

    /// Stream the contents of partition `index` (1-based) into `writer`.
    pub fn read_partition_contents(
        &self,
        index: usize,
        writer: &mut dyn Write,
    ) -> Result<u64> {
        self.require_table()?
            .read_partition_contents(index, self.backend.as_ref(), writer)
    }

    /// Fill partition `index` (1-based) from `reader`, returning the byte
    /// count written.
    pub fn write_partition_contents(
        &self,
        index: usize,
        reader: &mut dyn Read,
    ) -> Result<u64> {
        if !self.backend.writable() {
            return Err(DiskError::ReadOnly);
        }
        self.require_table()?
            .write_partition_contents(index, self.backend.as_ref(), reader)
    }

    /// Byte span of partition `index`, or the whole device for 0.
    fn partition_span(&self, index: usize) -> Result<(u64, u64)> {
        if index == 0 {
            return Ok((0, self.size));
        }
        let table = self.require_table()?;
        Ok((
            table.partition_start_bytes(index)?,
            table.partition_size_bytes(index)?,
        ))
    }

    /// Probe the filesystem on partition `index` (0 for the whole device).
    ///
    /// Candidates are tried in a fixed order; the first whose magic parses
    /// wins. The compressed read-only filesystem is the only engine built
    /// in.
    pub fn get_filesystem(&self, index: usize) -> Result<Box<dyn Filesystem>> {
        let (start, size) = self.partition_span(index)?;

        debug!(target: "vdisk::disk", partition = index, "trying squash");
        match SquashFs::read(Arc::clone(&self.backend), size, start) {
            Ok(fs) => return Ok(Box::new(fs)),
            Err(err) => debug!(target: "vdisk::disk", error = %err, "squash failed"),
        }

        Err(DiskError::Format(format!(
            "unknown filesystem on partition {index}"
        )))
    }

    /// Create a filesystem per `spec` (the mkfs analogue).
    ///
    /// The compressed filesystem is created as a staging workspace; its
    /// serialization into the image happens outside this layer.
    pub fn create_filesystem(&self, spec: &FilesystemSpec) -> Result<Box<dyn Filesystem>> {
        // Resolve the span up front so a bad partition number fails even
        // though the staged filesystem does not touch the device yet.
        let (_start, _size) = self.partition_span(spec.partition)?;

        match spec.fs_type {
            FilesystemType::Squash => Ok(Box::new(SquashFs::create(spec.block_size)?)),
            FilesystemType::Fat32 | FilesystemType::Iso9660 | FilesystemType::Ext4 => {
                Err(DiskError::NotImplemented)
            }
        }
    }

    /// Pure geometry check of the cached table against this device.
    pub fn verify(&self) -> Result<Vec<Diagnostic>> {
        Ok(self.require_table()?.verify(self.size))
    }

    /// Close the backing store; every derived handle fails from here on.
    pub fn close(&mut self) {
        self.backend.close();
        self.table = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use vdisk_partition::mbr;

    fn disk_with_mbr(partition_sectors: u32) -> Disk {
        let backend = Arc::new(MemBackend::new(8 << 20));
        let mut disk = Disk::from_backend(backend, 512, 512);

        let mut table = MbrTable::new(512, 512);
        table.partitions[0] = MbrPartition {
            bootable: false,
            start_head: 0,
            start_sector: 2,
            start_cylinder: 0,
            part_type: mbr::TYPE_LINUX,
            end_head: 0,
            end_sector: 2,
            end_cylinder: 0,
            start: 2048,
            size: partition_sectors,
        };
        disk.partition(PartitionTable::Mbr(table)).expect("partition");
        disk
    }

    #[test]
    fn partition_then_reread_round_trips() {
        let disk = disk_with_mbr(1000);
        let table = disk.table.as_ref().expect("cached table");
        assert_eq!(table.partition_count(), 4);
        assert_eq!(
            table.partition_start_bytes(1).expect("slot 1"),
            2048 * 512
        );
    }

    #[test]
    fn write_then_read_partition_contents() {
        let disk = disk_with_mbr(1000);
        let payload: Vec<u8> = (0..512_000_u32).map(|i| (i % 256) as u8).collect();

        let written = disk
            .write_partition_contents(1, &mut Cursor::new(payload.clone()))
            .expect("write");
        assert_eq!(written, 512_000);

        let mut sink = Vec::new();
        let read = disk
            .read_partition_contents(1, &mut sink)
            .expect("read");
        assert_eq!(read, 1000 * 512);
        assert_eq!(&sink[..payload.len()], payload.as_slice());
    }

    #[test]
    fn contents_of_unknown_partition_index() {
        let disk = disk_with_mbr(1000);
        let mut sink = Vec::new();
        assert!(matches!(
            disk.read_partition_contents(9, &mut sink).unwrap_err(),
            DiskError::PartitionIndexOutOfRange { asked: 9, have: 4 }
        ));
    }

    #[test]
    fn filesystem_probe_on_blank_partition_fails() {
        let disk = disk_with_mbr(1000);
        assert!(disk.get_filesystem(1).is_err());
    }

    #[test]
    fn create_filesystem_squash_stages_a_workspace() {
        let disk = disk_with_mbr(1000);
        let mut fs = disk
            .create_filesystem(&FilesystemSpec::new(1, FilesystemType::Squash))
            .expect("create");
        assert_eq!(fs.fs_type(), FilesystemType::Squash);
        fs.mkdir("/boot").expect("mkdir in workspace");
        fs.close().expect("close");
    }

    #[test]
    fn create_filesystem_other_types_not_implemented() {
        let disk = disk_with_mbr(1000);
        match disk.create_filesystem(&FilesystemSpec::new(1, FilesystemType::Ext4)) {
            Err(DiskError::NotImplemented) => {}
            Err(other) => panic!("expected DiskError::NotImplemented, got {other:?}"),
            Ok(_) => panic!("expected an error, got Ok"),
        }
    }

    #[test]
    fn close_invalidates_the_backend() {
        let mut disk = disk_with_mbr(1000);
        disk.close();
        let mut sink = Vec::new();
        assert!(disk.read_partition_contents(1, &mut sink).is_err());
    }
}
