#![forbid(unsafe_code)]
//! Partition table layer.
//!
//! Probes a backing store for a GPT or MBR, exposes a tagged-union table
//! with index-preserving 1-based partition access, dispatches partition
//! content I/O, and verifies table geometry.

mod contents;
pub mod gpt;
pub mod mbr;

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::debug;
use vdisk_backend::Backend;
use vdisk_error::{DiskError, Result};
use vdisk_types::{ByteOffset, GPT_SIGNATURE, MBR_SIGNATURE, read_le_u64};

pub use gpt::{GptPartition, GptTable, RepairIntent};
pub use mbr::{MbrPartition, MbrTable};

/// A partition table found on (or destined for) a backing store.
///
/// The two variants share no useful field layout; they share operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionTable {
    Mbr(MbrTable),
    Gpt(GptTable),
}

/// One row of the index-preserving partition enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSummary {
    /// Public partition number (1-based; empty slots keep their number).
    pub index: usize,
    /// Whether the slot holds a usable partition.
    pub occupied: bool,
    pub start_lba: u64,
    pub sector_count: u64,
    /// GPT partition name; empty for MBR entries.
    pub name: String,
}

/// A finding from `PartitionTable::verify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Diagnostic {
    /// Two used entries cover overlapping sector ranges (1-based indexes).
    Overlap { first: usize, second: usize },
    /// A used entry with no sectors.
    ZeroLength { index: usize },
    /// A used entry starting inside the table's own sectors.
    StartsTooLow { index: usize, start: u64 },
    /// A used entry running past the end of the device.
    EndsPastDevice {
        index: usize,
        end: u64,
        device_sectors: u64,
    },
    /// The alternate GPT header could not be validated.
    MissingAlternateHeader,
    /// One header copy was damaged and read fell back to the survivor.
    Repaired { which: &'static str },
}

impl PartitionTable {
    /// Probe a backing store for a partition table.
    ///
    /// A GPT signature at LBA 1 wins over the protective MBR in sector 0;
    /// a 0x55AA signature alone yields an MBR; anything else is `None`.
    pub fn read(
        backend: &dyn Backend,
        logical_sector_size: u32,
        physical_sector_size: u32,
    ) -> Result<Option<Self>> {
        let mut sig = [0_u8; 8];
        let gpt_offset = u64::from(logical_sector_size);
        if backend.size() >= gpt_offset + 8 {
            backend.read_exact_at(&mut sig, ByteOffset(gpt_offset))?;
            if read_le_u64(&sig, 0)? == GPT_SIGNATURE {
                debug!(target: "vdisk::partition", "found GPT signature at LBA 1");
                return GptTable::read(backend, logical_sector_size, physical_sector_size)
                    .map(|t| Some(Self::Gpt(t)));
            }
        }

        if backend.size() < 512 {
            return Ok(None);
        }
        let mut sector = vec![0_u8; 512];
        backend.read_exact_at(&mut sector, ByteOffset::ZERO)?;
        if sector[510..512] == MBR_SIGNATURE {
            debug!(target: "vdisk::partition", "found MBR signature in sector 0");
            let table =
                MbrTable::from_sector(&sector, logical_sector_size, physical_sector_size)?;
            return Ok(Some(Self::Mbr(table)));
        }

        debug!(target: "vdisk::partition", "no partition table signature found");
        Ok(None)
    }

    /// Serialize the table to the backing store.
    pub fn write(&mut self, backend: &dyn Backend, disk_size: u64) -> Result<()> {
        match self {
            Self::Mbr(table) => table.write(backend, disk_size),
            Self::Gpt(table) => table.write(backend, disk_size),
        }
    }

    #[must_use]
    pub fn logical_sector_size(&self) -> u32 {
        match self {
            Self::Mbr(table) => table.logical_sector_size,
            Self::Gpt(table) => table.logical_sector_size,
        }
    }

    #[must_use]
    pub fn physical_sector_size(&self) -> u32 {
        match self {
            Self::Mbr(table) => table.physical_sector_size,
            Self::Gpt(table) => table.physical_sector_size,
        }
    }

    /// Number of slots in the table, empty ones included.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        match self {
            Self::Mbr(table) => table.partition_count(),
            Self::Gpt(table) => table.partition_count(),
        }
    }

    /// Index-preserving enumeration of every slot.
    #[must_use]
    pub fn partitions(&self) -> Vec<PartitionSummary> {
        match self {
            Self::Mbr(table) => table
                .partitions
                .iter()
                .enumerate()
                .map(|(i, p)| PartitionSummary {
                    index: i + 1,
                    occupied: !p.is_empty(),
                    start_lba: u64::from(p.start),
                    sector_count: u64::from(p.size),
                    name: String::new(),
                })
                .collect(),
            Self::Gpt(table) => table
                .partitions
                .iter()
                .enumerate()
                .map(|(i, p)| PartitionSummary {
                    index: i + 1,
                    occupied: !p.is_unused(),
                    start_lba: p.first_lba,
                    sector_count: p.sector_count(),
                    name: p.name.clone(),
                })
                .collect(),
        }
    }

    /// Map a public 1-based partition number to the internal slot index.
    fn slot(&self, index: usize) -> Result<usize> {
        let have = self.partition_count();
        if index == 0 || index > have {
            return Err(DiskError::PartitionIndexOutOfRange {
                asked: index,
                have,
            });
        }
        Ok(index - 1)
    }

    /// First byte of partition `index` (1-based) on the backing store.
    pub fn partition_start_bytes(&self, index: usize) -> Result<u64> {
        let slot = self.slot(index)?;
        Ok(match self {
            Self::Mbr(table) => table.partitions[slot].start_bytes(table.logical_sector_size),
            Self::Gpt(table) => table.partitions[slot].start_bytes(table.logical_sector_size),
        })
    }

    /// Length in bytes of partition `index` (1-based).
    pub fn partition_size_bytes(&self, index: usize) -> Result<u64> {
        let slot = self.slot(index)?;
        Ok(match self {
            Self::Mbr(table) => table.partitions[slot].size_bytes(table.logical_sector_size),
            Self::Gpt(table) => table.partitions[slot].size_bytes(table.logical_sector_size),
        })
    }

    /// Stream the contents of partition `index` (1-based) into `writer`.
    pub fn read_partition_contents(
        &self,
        index: usize,
        backend: &dyn Backend,
        writer: &mut dyn Write,
    ) -> Result<u64> {
        let slot = self.slot(index)?;
        match self {
            Self::Mbr(table) => table.partitions[slot].read_contents(
                backend,
                writer,
                table.logical_sector_size,
                table.physical_sector_size,
            ),
            Self::Gpt(table) => table.partitions[slot].read_contents(
                backend,
                writer,
                table.logical_sector_size,
                table.physical_sector_size,
            ),
        }
    }

    /// Fill partition `index` (1-based) from `reader`.
    pub fn write_partition_contents(
        &self,
        index: usize,
        backend: &dyn Backend,
        reader: &mut dyn Read,
    ) -> Result<u64> {
        let slot = self.slot(index)?;
        match self {
            Self::Mbr(table) => table.partitions[slot].write_contents(
                backend,
                reader,
                table.logical_sector_size,
                table.physical_sector_size,
            ),
            Self::Gpt(table) => table.partitions[slot].write_contents(
                backend,
                reader,
                table.logical_sector_size,
                table.physical_sector_size,
            ),
        }
    }

    /// Pure geometry check of the in-memory table against a device size.
    #[must_use]
    pub fn verify(&self, disk_size: u64) -> Vec<Diagnostic> {
        let device_sectors = disk_size / u64::from(self.logical_sector_size());
        let mut findings = Vec::new();

        // (1-based index, first, last) for every used slot.
        let mut used: Vec<(usize, u64, u64)> = Vec::new();
        match self {
            Self::Mbr(table) => {
                for (i, p) in table.partitions.iter().enumerate() {
                    let index = i + 1;
                    if p.part_type == mbr::TYPE_EMPTY {
                        continue;
                    }
                    if p.size == 0 {
                        findings.push(Diagnostic::ZeroLength { index });
                        continue;
                    }
                    used.push((
                        index,
                        u64::from(p.start),
                        u64::from(p.start) + u64::from(p.size) - 1,
                    ));
                }
            }
            Self::Gpt(table) => {
                for (i, p) in table.partitions.iter().enumerate() {
                    let index = i + 1;
                    if p.is_unused() {
                        continue;
                    }
                    if p.first_lba == 0 && p.last_lba == 0 {
                        findings.push(Diagnostic::ZeroLength { index });
                        continue;
                    }
                    used.push((index, p.first_lba, p.last_lba));
                }
                if let Some(repair) = table.repaired() {
                    if repair == RepairIntent::SecondaryHeader {
                        findings.push(Diagnostic::MissingAlternateHeader);
                    }
                    findings.push(Diagnostic::Repaired {
                        which: repair.as_str(),
                    });
                }
            }
        }

        for &(index, first, last) in &used {
            if first < 2 {
                findings.push(Diagnostic::StartsTooLow {
                    index,
                    start: first,
                });
            }
            if last >= device_sectors {
                findings.push(Diagnostic::EndsPastDevice {
                    index,
                    end: last,
                    device_sectors,
                });
            }
        }

        for (a, &(index_a, first_a, last_a)) in used.iter().enumerate() {
            for &(index_b, first_b, last_b) in &used[a + 1..] {
                if first_a <= last_b && first_b <= last_a {
                    findings.push(Diagnostic::Overlap {
                        first: index_a,
                        second: index_b,
                    });
                }
            }
        }

        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use vdisk_backend::MemBackend;

    fn mbr_with_partition(start: u32, size: u32) -> MbrTable {
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
            start,
            size,
        };
        table
    }

    fn gpt_with_partition(first: u64, last: u64) -> GptTable {
        let mut table = GptTable::new(512, 512);
        table.partitions[0] = GptPartition {
            type_guid: gpt::GUID_LINUX_FILESYSTEM,
            unique_guid: Uuid::new_v4(),
            first_lba: first,
            last_lba: last,
            attributes: 0,
            name: "root".to_owned(),
        };
        table
    }

    #[test]
    fn probe_blank_device_finds_nothing() {
        let backend = MemBackend::new(1 << 20);
        assert!(
            PartitionTable::read(&backend, 512, 512)
                .expect("probe")
                .is_none()
        );
    }

    #[test]
    fn probe_finds_mbr() {
        let backend = MemBackend::new(1 << 20);
        let mut table = PartitionTable::Mbr(mbr_with_partition(64, 128));
        table.write(&backend, backend.size()).expect("write");

        let found = PartitionTable::read(&backend, 512, 512)
            .expect("probe")
            .expect("table");
        assert_eq!(found, table);
    }

    #[test]
    fn probe_prefers_gpt_over_protective_mbr() {
        let backend = MemBackend::new(64 << 20);
        let mut table = PartitionTable::Gpt(gpt_with_partition(2048, 4095));
        table.write(&backend, backend.size()).expect("write");

        let found = PartitionTable::read(&backend, 512, 512)
            .expect("probe")
            .expect("table");
        assert!(matches!(found, PartitionTable::Gpt(_)));
        assert_eq!(found, table);
    }

    #[test]
    fn partition_index_is_one_based_and_stable() {
        let mut mbr = MbrTable::new(512, 512);
        // Slot 1 empty, slot 2 occupied: partition(2) must still mean slot 2.
        mbr.partitions[1] = mbr_with_partition(2048, 2048).partitions[0].clone();
        let table = PartitionTable::Mbr(mbr);

        let summaries = table.partitions();
        assert_eq!(summaries.len(), 4);
        assert!(!summaries[0].occupied);
        assert!(summaries[1].occupied);
        assert_eq!(summaries[1].index, 2);

        assert_eq!(table.partition_start_bytes(2).expect("slot 2"), 2048 * 512);
        assert_eq!(table.partition_size_bytes(2).expect("slot 2"), 2048 * 512);

        let err = table.partition_start_bytes(0).unwrap_err();
        assert!(matches!(
            err,
            DiskError::PartitionIndexOutOfRange { asked: 0, have: 4 }
        ));
        let err = table.partition_start_bytes(5).unwrap_err();
        assert!(matches!(
            err,
            DiskError::PartitionIndexOutOfRange { asked: 5, have: 4 }
        ));
    }

    #[test]
    fn gpt_unused_entries_are_counted() {
        let table = PartitionTable::Gpt(gpt_with_partition(2048, 4095));
        let summaries = table.partitions();
        assert_eq!(summaries.len(), 128);
        assert!(summaries[0].occupied);
        assert!(!summaries[1].occupied);
    }

    #[test]
    fn verify_flags_overlap_and_bounds() {
        let mut mbr = mbr_with_partition(1, 100);
        mbr.partitions[1] = MbrPartition {
            start: 50,
            size: 100,
            ..mbr.partitions[0].clone()
        };
        mbr.partitions[2] = MbrPartition {
            start: 10_000,
            size: 10_000,
            ..mbr.partitions[0].clone()
        };
        let table = PartitionTable::Mbr(mbr);

        // Device of 1 MiB = 2048 sectors: slot 3 runs past the end.
        let findings = table.verify(1 << 20);
        assert!(findings.contains(&Diagnostic::StartsTooLow { index: 1, start: 1 }));
        assert!(findings.contains(&Diagnostic::Overlap {
            first: 1,
            second: 2
        }));
        assert!(findings.iter().any(|d| matches!(
            d,
            Diagnostic::EndsPastDevice { index: 3, .. }
        )));
    }

    #[test]
    fn verify_flags_zero_length_used_entry() {
        let mut mbr = MbrTable::new(512, 512);
        mbr.partitions[0] = MbrPartition {
            size: 0,
            ..mbr_with_partition(2048, 2048).partitions[0].clone()
        };
        let table = PartitionTable::Mbr(mbr);
        assert!(
            table
                .verify(1 << 20)
                .contains(&Diagnostic::ZeroLength { index: 1 })
        );
    }

    #[test]
    fn verify_surfaces_repaired_primary_header() {
        let backend = MemBackend::new(64 << 20);
        let mut table = PartitionTable::Gpt(gpt_with_partition(2048, 4095));
        table.write(&backend, backend.size()).expect("write");

        let mut contents = backend.contents();
        contents[512 + 16] ^= 0xFF; // primary header CRC field
        let damaged = MemBackend::from_vec(contents);

        let found = PartitionTable::read(&damaged, 512, 512)
            .expect("probe")
            .expect("table");
        let findings = found.verify(damaged.size());
        assert!(findings.contains(&Diagnostic::Repaired {
            which: "primary-header"
        }));
    }
}
