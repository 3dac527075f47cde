//! MBR partition table.
//!
//! 16-byte entry codec with packed CHS triples, the four-slot table in
//! sector 0, and sector-granular partition content streaming.

use crate::contents;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use vdisk_backend::Backend;
use vdisk_error::{DiskError, Result};
use vdisk_types::{
    ByteOffset, MBR_DISK_SIGNATURE_OFFSET, MBR_ENTRY_COUNT, MBR_ENTRY_SIZE,
    MBR_ENTRY_TABLE_OFFSET, MBR_SIGNATURE, read_le_u32,
};

// Well-known partition type codes.
pub const TYPE_EMPTY: u8 = 0x00;
pub const TYPE_FAT32_LBA: u8 = 0x0C;
pub const TYPE_LINUX_SWAP: u8 = 0x82;
pub const TYPE_LINUX: u8 = 0x83;
pub const TYPE_LINUX_LVM: u8 = 0x8E;
pub const TYPE_GPT_PROTECTIVE: u8 = 0xEE;
pub const TYPE_EFI_SYSTEM: u8 = 0xEF;

/// Translation geometry used when CHS values must be synthesized from an LBA.
const CHS_HEADS_PER_CYLINDER: u64 = 255;
const CHS_SECTORS_PER_TRACK: u64 = 63;
const CHS_MAX_CYLINDER: u64 = 1023;

/// One slot of the MBR partition table.
///
/// CHS triples are carried verbatim: decoding and re-encoding an entry
/// reproduces the original 16 bytes bit-for-bit, even for values no BIOS
/// would generate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MbrPartition {
    pub bootable: bool,
    pub start_head: u8,
    pub start_sector: u8,
    pub start_cylinder: u16,
    pub part_type: u8,
    pub end_head: u8,
    pub end_sector: u8,
    pub end_cylinder: u16,
    /// First sector of the partition.
    pub start: u32,
    /// Length of the partition in sectors.
    pub size: u32,
}

impl MbrPartition {
    /// Decode one 16-byte table slot.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != MBR_ENTRY_SIZE {
            return Err(DiskError::InvalidEntry {
                reason: format!(
                    "data for partition was {} bytes instead of expected {}",
                    data.len(),
                    MBR_ENTRY_SIZE
                ),
            });
        }

        let bootable = match data[0] {
            0x00 => false,
            0x80 => true,
            other => {
                return Err(DiskError::InvalidEntry {
                    reason: format!("invalid bootable flag {other:#04x}"),
                });
            }
        };

        let (start_head, start_sector, start_cylinder) = unpack_chs(&data[1..4]);
        let (end_head, end_sector, end_cylinder) = unpack_chs(&data[5..8]);

        Ok(Self {
            bootable,
            start_head,
            start_sector,
            start_cylinder,
            part_type: data[4],
            end_head,
            end_sector,
            end_cylinder,
            start: read_le_u32(data, 8)?,
            size: read_le_u32(data, 12)?,
        })
    }

    /// Encode into the 16-byte on-disk layout.
    ///
    /// Caller-supplied CHS bytes are written verbatim. An all-zero CHS triple
    /// on a non-empty entry is treated as "never set" and synthesized from
    /// the LBA range using the fixed 255/63 translation geometry.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; MBR_ENTRY_SIZE] {
        let mut out = [0_u8; MBR_ENTRY_SIZE];
        out[0] = if self.bootable { 0x80 } else { 0x00 };

        let start = if self.chs_unset(self.start_head, self.start_sector, self.start_cylinder) {
            chs_from_lba(u64::from(self.start))
        } else {
            (self.start_head, self.start_sector, self.start_cylinder)
        };
        let end_lba = u64::from(self.start) + u64::from(self.size).saturating_sub(1);
        let end = if self.chs_unset(self.end_head, self.end_sector, self.end_cylinder) {
            chs_from_lba(end_lba)
        } else {
            (self.end_head, self.end_sector, self.end_cylinder)
        };

        out[1..4].copy_from_slice(&pack_chs(start.0, start.1, start.2));
        out[4] = self.part_type;
        out[5..8].copy_from_slice(&pack_chs(end.0, end.1, end.2));
        out[8..12].copy_from_slice(&self.start.to_le_bytes());
        out[12..16].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    fn chs_unset(&self, head: u8, sector: u8, cylinder: u16) -> bool {
        self.part_type != TYPE_EMPTY && head == 0 && sector == 0 && cylinder == 0
    }

    /// An all-zero slot: excluded from verification and content I/O.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.part_type == TYPE_EMPTY || self.size == 0
    }

    /// First byte of the partition on the backing store.
    #[must_use]
    pub fn start_bytes(&self, logical_sector_size: u32) -> u64 {
        u64::from(self.start) * u64::from(logical_sector_size)
    }

    /// Length of the partition in bytes.
    #[must_use]
    pub fn size_bytes(&self, logical_sector_size: u32) -> u64 {
        u64::from(self.size) * u64::from(logical_sector_size)
    }

    /// Stream the partition's bytes into `writer`.
    ///
    /// Stops at the end of the partition or on the first sink error.
    /// Returns the number of bytes delivered.
    pub fn read_contents(
        &self,
        backend: &dyn Backend,
        writer: &mut dyn Write,
        logical_sector_size: u32,
        physical_sector_size: u32,
    ) -> Result<u64> {
        contents::read_span(
            backend,
            writer,
            self.start_bytes(logical_sector_size),
            self.size_bytes(logical_sector_size),
            contents::chunk_size(logical_sector_size, physical_sector_size),
        )
    }

    /// Fill the partition from `reader`, sector-aligned chunks at a time.
    ///
    /// Fails with `PartitionTooSmall` once the producer has more bytes than
    /// the partition can hold; the error carries the count already written.
    pub fn write_contents(
        &self,
        backend: &dyn Backend,
        reader: &mut dyn Read,
        logical_sector_size: u32,
        physical_sector_size: u32,
    ) -> Result<u64> {
        contents::write_span(
            backend,
            reader,
            self.start_bytes(logical_sector_size),
            self.size_bytes(logical_sector_size),
            contents::chunk_size(logical_sector_size, physical_sector_size),
        )
    }
}

/// Unpack the 3-byte CHS encoding: head, 6-bit sector, 10-bit cylinder.
fn unpack_chs(b: &[u8]) -> (u8, u8, u16) {
    let head = b[0];
    let sector = b[1] & 0x3F;
    let cylinder = (u16::from(b[1] & 0xC0) << 2) | u16::from(b[2]);
    (head, sector, cylinder)
}

/// Pack a CHS triple into its 3-byte encoding.
fn pack_chs(head: u8, sector: u8, cylinder: u16) -> [u8; 3] {
    [
        head,
        (sector & 0x3F) | (((cylinder >> 2) & 0xC0) as u8),
        (cylinder & 0xFF) as u8,
    ]
}

/// Synthesize a CHS triple from an LBA with the 255/63 geometry, clamping
/// past the 10-bit cylinder ceiling.
fn chs_from_lba(lba: u64) -> (u8, u8, u16) {
    let sectors_per_cylinder = CHS_HEADS_PER_CYLINDER * CHS_SECTORS_PER_TRACK;
    let cylinder = lba / sectors_per_cylinder;
    if cylinder > CHS_MAX_CYLINDER {
        return (0xFF, 0x3F, 0x3FF);
    }
    let head = (lba / CHS_SECTORS_PER_TRACK) % CHS_HEADS_PER_CYLINDER;
    let sector = (lba % CHS_SECTORS_PER_TRACK) + 1;
    (head as u8, sector as u8, cylinder as u16)
}

/// The four-slot MBR table in sector 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MbrTable {
    pub disk_signature: u32,
    /// All four slots, empty ones included; indexes are stable.
    pub partitions: Vec<MbrPartition>,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
    /// Boot region preserved from the device, zeros for a synthesized table.
    boot_code: Vec<u8>,
}

impl MbrTable {
    /// A fresh table with four empty slots and a zeroed boot region.
    #[must_use]
    pub fn new(logical_sector_size: u32, physical_sector_size: u32) -> Self {
        let empty = MbrPartition {
            bootable: false,
            start_head: 0,
            start_sector: 0,
            start_cylinder: 0,
            part_type: TYPE_EMPTY,
            end_head: 0,
            end_sector: 0,
            end_cylinder: 0,
            start: 0,
            size: 0,
        };
        Self {
            disk_signature: 0,
            partitions: vec![empty; MBR_ENTRY_COUNT],
            logical_sector_size,
            physical_sector_size,
            boot_code: vec![0_u8; MBR_DISK_SIGNATURE_OFFSET],
        }
    }

    /// Parse the table from the first sector of the device.
    pub fn from_sector(
        sector: &[u8],
        logical_sector_size: u32,
        physical_sector_size: u32,
    ) -> Result<Self> {
        if sector.len() < 512 {
            return Err(DiskError::Format(format!(
                "MBR sector was {} bytes instead of expected 512",
                sector.len()
            )));
        }
        if sector[510..512] != MBR_SIGNATURE {
            return Err(DiskError::Format(
                "missing 0x55AA signature in sector 0".to_owned(),
            ));
        }

        let mut partitions = Vec::with_capacity(MBR_ENTRY_COUNT);
        for slot in 0..MBR_ENTRY_COUNT {
            let offset = MBR_ENTRY_TABLE_OFFSET + slot * MBR_ENTRY_SIZE;
            partitions.push(MbrPartition::from_bytes(&sector[offset..offset + MBR_ENTRY_SIZE])?);
        }

        Ok(Self {
            disk_signature: read_le_u32(sector, MBR_DISK_SIGNATURE_OFFSET)?,
            partitions,
            logical_sector_size,
            physical_sector_size,
            boot_code: sector[..MBR_DISK_SIGNATURE_OFFSET].to_vec(),
        })
    }

    /// Read the table from a backing store.
    pub fn read(
        backend: &dyn Backend,
        logical_sector_size: u32,
        physical_sector_size: u32,
    ) -> Result<Self> {
        let mut sector = vec![0_u8; 512];
        backend.read_exact_at(&mut sector, ByteOffset::ZERO)?;
        Self::from_sector(&sector, logical_sector_size, physical_sector_size)
    }

    /// Serialize the full 512-byte sector image.
    #[must_use]
    pub fn to_sector(&self) -> Vec<u8> {
        let mut sector = vec![0_u8; 512];
        let preserved = self.boot_code.len().min(MBR_DISK_SIGNATURE_OFFSET);
        sector[..preserved].copy_from_slice(&self.boot_code[..preserved]);
        sector[MBR_DISK_SIGNATURE_OFFSET..MBR_DISK_SIGNATURE_OFFSET + 4]
            .copy_from_slice(&self.disk_signature.to_le_bytes());
        for (slot, partition) in self.partitions.iter().take(MBR_ENTRY_COUNT).enumerate() {
            let offset = MBR_ENTRY_TABLE_OFFSET + slot * MBR_ENTRY_SIZE;
            sector[offset..offset + MBR_ENTRY_SIZE].copy_from_slice(&partition.to_bytes());
        }
        sector[510..512].copy_from_slice(&MBR_SIGNATURE);
        sector
    }

    /// Write the table to sector 0 of the backing store.
    pub fn write(&self, backend: &dyn Backend, _disk_size: u64) -> Result<()> {
        backend.write_all_at(&self.to_sector(), ByteOffset::ZERO)
    }

    /// Number of slots (always four; empty slots keep their index).
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}
