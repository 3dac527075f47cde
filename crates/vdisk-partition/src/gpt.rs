//! GUID partition table.
//!
//! 92-byte header codec with CRC32-IEEE over header and entry array,
//! primary header at LBA 1 mirrored at the last LBA, entry array at LBA 2,
//! and the protective MBR at LBA 0.

use crate::contents;
use crate::mbr::{MbrPartition, MbrTable, TYPE_GPT_PROTECTIVE};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::debug;
use uuid::Uuid;
use vdisk_backend::Backend;
use vdisk_error::{DiskError, Result};
use vdisk_types::{
    ByteOffset, GPT_ENTRY_COUNT, GPT_ENTRY_SIZE, GPT_HEADER_SIZE, GPT_NAME_UNITS, GPT_REVISION,
    GPT_SIGNATURE, read_fixed, read_le_u32, read_le_u64,
};

/// Linux filesystem data.
pub const GUID_LINUX_FILESYSTEM: Uuid = Uuid::from_u128(0x0FC6_3DAF_8483_4772_8E79_3D69_D847_7DE4);
/// EFI system partition.
pub const GUID_EFI_SYSTEM: Uuid = Uuid::from_u128(0xC12A_7328_F81F_11D2_BA4B_00A0_C93E_C93B);
/// Microsoft basic data.
pub const GUID_MICROSOFT_BASIC_DATA: Uuid =
    Uuid::from_u128(0xEBD0_A0A2_B9E5_4433_87C0_68B6_B726_99C7);
/// BIOS boot partition.
pub const GUID_BIOS_BOOT: Uuid = Uuid::from_u128(0x2168_6148_6449_6E6F_744E_6565_6445_4649);

// Header field offsets within the first sector of LBA 1.
const HDR_SIGNATURE: usize = 0;
const HDR_REVISION: usize = 8;
const HDR_HEADER_SIZE: usize = 12;
const HDR_HEADER_CRC: usize = 16;
const HDR_CURRENT_LBA: usize = 24;
const HDR_BACKUP_LBA: usize = 32;
const HDR_FIRST_USABLE: usize = 40;
const HDR_LAST_USABLE: usize = 48;
const HDR_DISK_GUID: usize = 56;
const HDR_ENTRY_ARRAY_LBA: usize = 72;
const HDR_ENTRY_COUNT: usize = 80;
const HDR_ENTRY_SIZE: usize = 84;
const HDR_ENTRY_ARRAY_CRC: usize = 88;

/// One GPT partition entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GptPartition {
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    /// First sector of the partition.
    pub first_lba: u64,
    /// Last sector of the partition, inclusive.
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl GptPartition {
    /// A slot whose type GUID is all-zero: counted but unused.
    #[must_use]
    pub fn unused() -> Self {
        Self {
            type_guid: Uuid::nil(),
            unique_guid: Uuid::nil(),
            first_lba: 0,
            last_lba: 0,
            attributes: 0,
            name: String::new(),
        }
    }

    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.type_guid.is_nil()
    }

    /// Decode one entry of `entry_size` bytes.
    pub fn from_bytes(data: &[u8], entry_size: usize) -> Result<Self> {
        if data.len() != entry_size || entry_size < 128 {
            return Err(DiskError::InvalidEntry {
                reason: format!(
                    "data for partition was {} bytes instead of expected {entry_size}",
                    data.len()
                ),
            });
        }

        let type_guid = Uuid::from_bytes_le(read_fixed::<16>(data, 0)?);
        let unique_guid = Uuid::from_bytes_le(read_fixed::<16>(data, 16)?);
        let first_lba = read_le_u64(data, 32)?;
        let last_lba = read_le_u64(data, 40)?;
        if !type_guid.is_nil() && first_lba > last_lba {
            return Err(DiskError::InvalidEntry {
                reason: format!("starting LBA {first_lba} is after ending LBA {last_lba}"),
            });
        }

        let mut units = Vec::with_capacity(GPT_NAME_UNITS);
        for i in 0..GPT_NAME_UNITS {
            let unit = u16::from_le_bytes([data[56 + 2 * i], data[56 + 2 * i + 1]]);
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        let name = String::from_utf16(&units).map_err(|_| DiskError::InvalidEntry {
            reason: "partition name is not valid UTF-16".to_owned(),
        })?;

        Ok(Self {
            type_guid,
            unique_guid,
            first_lba,
            last_lba,
            attributes: read_le_u64(data, 48)?,
            name,
        })
    }

    /// Encode into `entry_size` bytes.
    pub fn to_bytes(&self, entry_size: usize) -> Result<Vec<u8>> {
        let units: Vec<u16> = self.name.encode_utf16().collect();
        if units.len() > GPT_NAME_UNITS {
            return Err(DiskError::InvalidEntry {
                reason: format!(
                    "partition name is {} UTF-16 units, maximum is {GPT_NAME_UNITS}",
                    units.len()
                ),
            });
        }
        if !self.type_guid.is_nil() && self.first_lba > self.last_lba {
            return Err(DiskError::InvalidEntry {
                reason: format!(
                    "starting LBA {} is after ending LBA {}",
                    self.first_lba, self.last_lba
                ),
            });
        }

        let mut out = vec![0_u8; entry_size];
        out[0..16].copy_from_slice(&self.type_guid.to_bytes_le());
        out[16..32].copy_from_slice(&self.unique_guid.to_bytes_le());
        out[32..40].copy_from_slice(&self.first_lba.to_le_bytes());
        out[40..48].copy_from_slice(&self.last_lba.to_le_bytes());
        out[48..56].copy_from_slice(&self.attributes.to_le_bytes());
        for (i, unit) in units.iter().enumerate() {
            out[56 + 2 * i..56 + 2 * i + 2].copy_from_slice(&unit.to_le_bytes());
        }
        Ok(out)
    }

    /// Number of sectors covered by the entry.
    #[must_use]
    pub fn sector_count(&self) -> u64 {
        if self.is_unused() {
            0
        } else {
            self.last_lba - self.first_lba + 1
        }
    }

    #[must_use]
    pub fn start_bytes(&self, logical_sector_size: u32) -> u64 {
        self.first_lba * u64::from(logical_sector_size)
    }

    #[must_use]
    pub fn size_bytes(&self, logical_sector_size: u32) -> u64 {
        self.sector_count() * u64::from(logical_sector_size)
    }

    /// Stream the partition's bytes into `writer`. See `MbrPartition::read_contents`.
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

    /// Fill the partition from `reader`. See `MbrPartition::write_contents`.
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

/// Which GPT header copy survived a damaged read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairIntent {
    /// The primary header failed its CRC; the table was read from the
    /// alternate at the last LBA.
    PrimaryHeader,
    /// The alternate header failed its CRC; the table was read from the
    /// primary.
    SecondaryHeader,
}

impl RepairIntent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrimaryHeader => "primary-header",
            Self::SecondaryHeader => "secondary-header",
        }
    }
}

/// The GUID partition table: header pair plus entry array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GptTable {
    pub disk_guid: Uuid,
    /// Every slot of the entry array, unused ones included.
    pub partitions: Vec<GptPartition>,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
    entry_size: u32,
    repaired: Option<RepairIntent>,
}

struct RawHeader {
    current_lba: u64,
    disk_guid: Uuid,
    entry_array_lba: u64,
    entry_count: u32,
    entry_size: u32,
    entry_array_crc: u32,
}

impl GptTable {
    /// A fresh table with a random disk GUID and a full array of unused slots.
    #[must_use]
    pub fn new(logical_sector_size: u32, physical_sector_size: u32) -> Self {
        Self {
            disk_guid: Uuid::new_v4(),
            partitions: vec![GptPartition::unused(); GPT_ENTRY_COUNT as usize],
            logical_sector_size,
            physical_sector_size,
            entry_size: GPT_ENTRY_SIZE,
            repaired: None,
        }
    }

    /// The repair recorded while reading a disk with one damaged header copy.
    #[must_use]
    pub fn repaired(&self) -> Option<RepairIntent> {
        self.repaired
    }

    /// Sectors occupied by the serialized entry array.
    fn entry_array_sectors(&self) -> u64 {
        let bytes = u64::from(self.entry_size) * self.partitions.len() as u64;
        bytes.div_ceil(u64::from(self.logical_sector_size))
    }

    /// Read and validate the table, falling back to the surviving header copy.
    pub fn read(
        backend: &dyn Backend,
        logical_sector_size: u32,
        physical_sector_size: u32,
    ) -> Result<Self> {
        let sector_size = u64::from(logical_sector_size);
        let total_sectors = backend.size() / sector_size;
        if total_sectors < 3 {
            return Err(DiskError::Format(
                "device too small to hold a GPT".to_owned(),
            ));
        }
        let last_lba = total_sectors - 1;

        let primary = Self::read_header_at(backend, logical_sector_size, 1);
        let secondary = Self::read_header_at(backend, logical_sector_size, last_lba);

        let (header, repaired) = match (primary, secondary) {
            (Ok(primary), Ok(_)) => (primary, None),
            (Err(err), Ok(secondary)) => {
                debug!(
                    target: "vdisk::partition",
                    error = %err,
                    "primary GPT header invalid, using alternate"
                );
                (secondary, Some(RepairIntent::PrimaryHeader))
            }
            (Ok(primary), Err(err)) => {
                debug!(
                    target: "vdisk::partition",
                    error = %err,
                    "alternate GPT header invalid, using primary"
                );
                (primary, Some(RepairIntent::SecondaryHeader))
            }
            (Err(err), Err(_)) => return Err(err),
        };

        if header.entry_size < 128 || header.entry_count == 0 || header.entry_count > 1024 {
            return Err(DiskError::Format(format!(
                "implausible GPT entry geometry: {} entries of {} bytes",
                header.entry_count, header.entry_size
            )));
        }

        // Entry array location comes from whichever header survived.
        let array_bytes = u64::from(header.entry_count) * u64::from(header.entry_size);
        let array_len = vdisk_types::u64_to_usize(array_bytes, "gpt_entry_array")?;
        let mut array = vec![0_u8; array_len];
        backend.read_exact_at(&mut array, ByteOffset(header.entry_array_lba * sector_size))?;

        let computed = crc32fast::hash(&array);
        if computed != header.entry_array_crc {
            return Err(DiskError::ChecksumMismatch {
                location: "gpt-entry-array",
                expected: header.entry_array_crc,
                got: computed,
            });
        }

        let entry_size = vdisk_types::u64_to_usize(u64::from(header.entry_size), "gpt_entry_size")?;
        let mut partitions = Vec::with_capacity(header.entry_count as usize);
        for chunk in array.chunks_exact(entry_size) {
            partitions.push(GptPartition::from_bytes(chunk, entry_size)?);
        }

        Ok(Self {
            disk_guid: header.disk_guid,
            partitions,
            logical_sector_size,
            physical_sector_size,
            entry_size: header.entry_size,
            repaired,
        })
    }

    fn read_header_at(
        backend: &dyn Backend,
        logical_sector_size: u32,
        lba: u64,
    ) -> Result<RawHeader> {
        let mut sector = vec![0_u8; logical_sector_size as usize];
        backend.read_exact_at(&mut sector, ByteOffset(lba * u64::from(logical_sector_size)))?;
        let header = Self::parse_header(&sector)?;
        if header.current_lba != lba {
            return Err(DiskError::Format(format!(
                "GPT header at LBA {lba} claims to live at LBA {}",
                header.current_lba
            )));
        }
        Ok(header)
    }

    fn parse_header(sector: &[u8]) -> Result<RawHeader> {
        let signature = read_le_u64(sector, HDR_SIGNATURE)?;
        if signature != GPT_SIGNATURE {
            return Err(DiskError::Format(format!(
                "bad GPT signature {signature:#018x}"
            )));
        }
        let header_size = read_le_u32(sector, HDR_HEADER_SIZE)?;
        if !(GPT_HEADER_SIZE..=512).contains(&header_size) {
            return Err(DiskError::Format(format!(
                "implausible GPT header size {header_size}"
            )));
        }
        let header_len = header_size as usize;
        if sector.len() < header_len {
            return Err(DiskError::Format(
                "GPT header extends past its sector".to_owned(),
            ));
        }

        let stored_crc = read_le_u32(sector, HDR_HEADER_CRC)?;
        let mut zeroed = sector[..header_len].to_vec();
        zeroed[HDR_HEADER_CRC..HDR_HEADER_CRC + 4].fill(0);
        let computed = crc32fast::hash(&zeroed);
        if computed != stored_crc {
            return Err(DiskError::ChecksumMismatch {
                location: "gpt-header",
                expected: stored_crc,
                got: computed,
            });
        }

        Ok(RawHeader {
            current_lba: read_le_u64(sector, HDR_CURRENT_LBA)?,
            disk_guid: Uuid::from_bytes_le(read_fixed::<16>(sector, HDR_DISK_GUID)?),
            entry_array_lba: read_le_u64(sector, HDR_ENTRY_ARRAY_LBA)?,
            entry_count: read_le_u32(sector, HDR_ENTRY_COUNT)?,
            entry_size: read_le_u32(sector, HDR_ENTRY_SIZE)?,
            entry_array_crc: read_le_u32(sector, HDR_ENTRY_ARRAY_CRC)?,
        })
    }

    fn serialize_header(
        &self,
        current_lba: u64,
        backup_lba: u64,
        first_usable: u64,
        last_usable: u64,
        entry_array_lba: u64,
        entry_array_crc: u32,
    ) -> Vec<u8> {
        let mut header = vec![0_u8; GPT_HEADER_SIZE as usize];
        header[HDR_SIGNATURE..HDR_SIGNATURE + 8].copy_from_slice(&GPT_SIGNATURE.to_le_bytes());
        header[HDR_REVISION..HDR_REVISION + 4].copy_from_slice(&GPT_REVISION.to_le_bytes());
        header[HDR_HEADER_SIZE..HDR_HEADER_SIZE + 4]
            .copy_from_slice(&GPT_HEADER_SIZE.to_le_bytes());
        header[HDR_CURRENT_LBA..HDR_CURRENT_LBA + 8].copy_from_slice(&current_lba.to_le_bytes());
        header[HDR_BACKUP_LBA..HDR_BACKUP_LBA + 8].copy_from_slice(&backup_lba.to_le_bytes());
        header[HDR_FIRST_USABLE..HDR_FIRST_USABLE + 8]
            .copy_from_slice(&first_usable.to_le_bytes());
        header[HDR_LAST_USABLE..HDR_LAST_USABLE + 8].copy_from_slice(&last_usable.to_le_bytes());
        header[HDR_DISK_GUID..HDR_DISK_GUID + 16].copy_from_slice(&self.disk_guid.to_bytes_le());
        header[HDR_ENTRY_ARRAY_LBA..HDR_ENTRY_ARRAY_LBA + 8]
            .copy_from_slice(&entry_array_lba.to_le_bytes());
        header[HDR_ENTRY_COUNT..HDR_ENTRY_COUNT + 4]
            .copy_from_slice(&(self.partitions.len() as u32).to_le_bytes());
        header[HDR_ENTRY_SIZE..HDR_ENTRY_SIZE + 4].copy_from_slice(&self.entry_size.to_le_bytes());
        header[HDR_ENTRY_ARRAY_CRC..HDR_ENTRY_ARRAY_CRC + 4]
            .copy_from_slice(&entry_array_crc.to_le_bytes());

        let crc = crc32fast::hash(&header);
        header[HDR_HEADER_CRC..HDR_HEADER_CRC + 4].copy_from_slice(&crc.to_le_bytes());
        header
    }

    fn serialize_entry_array(&self) -> Result<Vec<u8>> {
        let entry_size = self.entry_size as usize;
        let mut array = Vec::with_capacity(entry_size * self.partitions.len());
        for partition in &self.partitions {
            array.extend_from_slice(&partition.to_bytes(entry_size)?);
        }
        Ok(array)
    }

    /// Write protective MBR, both headers, and both entry array copies.
    ///
    /// After a successful write every CRC on disk validates and any recorded
    /// repair intent is discharged.
    pub fn write(&mut self, backend: &dyn Backend, disk_size: u64) -> Result<()> {
        let sector_size = u64::from(self.logical_sector_size);
        let total_sectors = disk_size / sector_size;
        let array_sectors = self.entry_array_sectors();
        // LBA 0 (protective MBR) + headers + two array copies must fit.
        if total_sectors < 3 + 2 * array_sectors {
            return Err(DiskError::Format(format!(
                "device of {total_sectors} sectors cannot hold a GPT with {} entries",
                self.partitions.len()
            )));
        }
        let last_lba = total_sectors - 1;
        let first_usable = 2 + array_sectors;
        let last_usable = last_lba - 1 - array_sectors;

        let array = self.serialize_entry_array()?;
        let entry_array_crc = crc32fast::hash(&array);

        // Protective MBR spanning the device (capped at the 32-bit limit).
        let mut protective = MbrTable::new(self.logical_sector_size, self.physical_sector_size);
        protective.partitions[0] = MbrPartition {
            bootable: false,
            start_head: 0,
            start_sector: 2,
            start_cylinder: 0,
            part_type: TYPE_GPT_PROTECTIVE,
            end_head: 0xFF,
            end_sector: 0x3F,
            end_cylinder: 0x3FF,
            start: 1,
            size: u32::try_from(total_sectors - 1).unwrap_or(u32::MAX),
        };
        backend.write_all_at(&protective.to_sector(), ByteOffset::ZERO)?;

        let primary = self.serialize_header(1, last_lba, first_usable, last_usable, 2, entry_array_crc);
        let secondary_array_lba = last_lba - array_sectors;
        let secondary = self.serialize_header(
            last_lba,
            1,
            first_usable,
            last_usable,
            secondary_array_lba,
            entry_array_crc,
        );

        backend.write_all_at(&primary, ByteOffset(sector_size))?;
        backend.write_all_at(&array, ByteOffset(2 * sector_size))?;
        backend.write_all_at(&array, ByteOffset(secondary_array_lba * sector_size))?;
        backend.write_all_at(&secondary, ByteOffset(last_lba * sector_size))?;

        self.repaired = None;
        Ok(())
    }

    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdisk_backend::MemBackend;
    use vdisk_types::ensure_slice;

    fn sample_partition(first: u64, last: u64, name: &str) -> GptPartition {
        GptPartition {
            type_guid: GUID_LINUX_FILESYSTEM,
            unique_guid: Uuid::new_v4(),
            first_lba: first,
            last_lba: last,
            attributes: 0,
            name: name.to_owned(),
        }
    }

    fn sample_table() -> GptTable {
        let mut table = GptTable::new(512, 512);
        table.partitions[0] = sample_partition(2048, 4095, "root");
        table.partitions[1] = sample_partition(4096, 8191, "データ");
        table
    }

    #[test]
    fn entry_round_trip() {
        let partition = sample_partition(2048, 4095, "root");
        let bytes = partition.to_bytes(128).expect("encode");
        assert_eq!(bytes.len(), 128);
        let decoded = GptPartition::from_bytes(&bytes, 128).expect("decode");
        assert_eq!(decoded, partition);
    }

    #[test]
    fn entry_name_round_trips_non_ascii() {
        let partition = sample_partition(10, 20, "データ볼륨");
        let bytes = partition.to_bytes(128).expect("encode");
        let decoded = GptPartition::from_bytes(&bytes, 128).expect("decode");
        assert_eq!(decoded.name, "データ볼륨");
    }

    #[test]
    fn entry_rejects_inverted_lba_range() {
        let partition = sample_partition(4096, 2048, "bad");
        assert!(partition.to_bytes(128).is_err());

        let mut bytes = sample_partition(2048, 4096, "ok").to_bytes(128).unwrap();
        bytes[32..40].copy_from_slice(&9999_u64.to_le_bytes());
        bytes[40..48].copy_from_slice(&1_u64.to_le_bytes());
        assert!(GptPartition::from_bytes(&bytes, 128).is_err());
    }

    #[test]
    fn entry_rejects_oversized_name() {
        let partition = sample_partition(1, 2, &"x".repeat(GPT_NAME_UNITS + 1));
        assert!(partition.to_bytes(128).is_err());
    }

    #[test]
    fn unused_entry_round_trips_as_zeroes() {
        let bytes = GptPartition::unused().to_bytes(128).expect("encode");
        assert!(bytes.iter().all(|b| *b == 0));
        let decoded = GptPartition::from_bytes(&bytes, 128).expect("decode");
        assert!(decoded.is_unused());
        assert_eq!(decoded.sector_count(), 0);
    }

    #[test]
    fn write_then_read_round_trips_with_valid_crcs() {
        let backend = MemBackend::new(64 << 20);
        let mut table = sample_table();
        table.write(&backend, backend.size()).expect("write");

        let read_back = GptTable::read(&backend, 512, 512).expect("read");
        assert_eq!(read_back, table);
        assert_eq!(read_back.repaired(), None);

        // Protective MBR sits at LBA 0 with a 0xEE partition from LBA 1.
        let contents = backend.contents();
        let protective = MbrTable::from_sector(&contents[..512], 512, 512).expect("pmbr");
        assert_eq!(protective.partitions[0].part_type, TYPE_GPT_PROTECTIVE);
        assert_eq!(protective.partitions[0].start, 1);
    }

    #[test]
    fn corrupt_primary_header_falls_back_and_records_repair() {
        let backend = MemBackend::new(64 << 20);
        let mut table = sample_table();
        table.write(&backend, backend.size()).expect("write");

        // Flip a bit inside the primary header's CRC field.
        let mut contents = backend.contents();
        contents[512 + HDR_HEADER_CRC] ^= 0xFF;
        let damaged = MemBackend::from_vec(contents);

        let read_back = GptTable::read(&damaged, 512, 512).expect("read via alternate");
        assert_eq!(read_back.repaired(), Some(RepairIntent::PrimaryHeader));
        assert_eq!(read_back.partitions[0], table.partitions[0]);

        // Re-writing restores both headers; a fresh read sees no damage.
        let mut repaired = read_back;
        repaired.write(&damaged, damaged.size()).expect("rewrite");
        let clean = GptTable::read(&damaged, 512, 512).expect("read");
        assert_eq!(clean.repaired(), None);
    }

    #[test]
    fn corrupt_secondary_header_uses_primary() {
        let backend = MemBackend::new(64 << 20);
        let mut table = sample_table();
        table.write(&backend, backend.size()).expect("write");

        let mut contents = backend.contents();
        let last = contents.len() - 512;
        contents[last + HDR_HEADER_CRC] ^= 0xFF;
        let damaged = MemBackend::from_vec(contents);

        let read_back = GptTable::read(&damaged, 512, 512).expect("read via primary");
        assert_eq!(read_back.repaired(), Some(RepairIntent::SecondaryHeader));
    }

    #[test]
    fn both_headers_corrupt_is_an_error() {
        let backend = MemBackend::new(64 << 20);
        let mut table = sample_table();
        table.write(&backend, backend.size()).expect("write");

        let mut contents = backend.contents();
        contents[512 + HDR_HEADER_CRC] ^= 0xFF;
        let last = contents.len() - 512;
        contents[last + HDR_HEADER_CRC] ^= 0xFF;
        let damaged = MemBackend::from_vec(contents);

        assert!(matches!(
            GptTable::read(&damaged, 512, 512).unwrap_err(),
            DiskError::ChecksumMismatch { .. }
        ));
    }

    #[test]
    fn corrupt_entry_array_is_a_checksum_mismatch() {
        let backend = MemBackend::new(64 << 20);
        let mut table = sample_table();
        table.write(&backend, backend.size()).expect("write");

        let mut contents = backend.contents();
        contents[2 * 512] ^= 0xFF; // first byte of the entry array
        let damaged = MemBackend::from_vec(contents);

        assert!(matches!(
            GptTable::read(&damaged, 512, 512).unwrap_err(),
            DiskError::ChecksumMismatch {
                location: "gpt-entry-array",
                ..
            }
        ));
    }

    #[test]
    fn guid_on_disk_layout_is_mixed_endian() {
        let partition = GptPartition {
            type_guid: GUID_EFI_SYSTEM,
            ..sample_partition(1, 2, "esp")
        };
        let bytes = partition.to_bytes(128).expect("encode");
        // C12A7328-F81F-11D2-... serializes with the first three groups
        // little-endian.
        let head = ensure_slice(&bytes, 0, 8).unwrap();
        assert_eq!(head, &[0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11]);
    }
}
