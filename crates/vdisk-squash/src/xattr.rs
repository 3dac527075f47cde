//! Extended attribute table.
//!
//! Three stacked regions: the xattr metadata (name/value streams packed
//! into metadata blocks), an id index of (ref, count, size) records also
//! packed into metadata blocks, and a flat u64 first-level index locating
//! the id-index blocks. Inode bodies point into the id index.

use crate::metadata::MetaStore;
use crate::superblock::Superblock;
use std::collections::{BTreeMap, HashMap};
use vdisk_error::{DiskError, Result};
use vdisk_types::{SQUASH_METADATA_BLOCK_SIZE, read_le_u16, read_le_u32, read_le_u64};

/// On-disk size of the xattr table header.
pub const XATTR_HEADER_SIZE: usize = 16;
/// On-disk size of one id-index record.
pub const XATTR_ID_ENTRY_SIZE: usize = 16;
/// Name-type bit marking an out-of-line value reference.
const XATTR_OOL_FLAG: u16 = 0x0100;

/// One id-index record: where an inode's attribute run starts and how many
/// attributes it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct XattrId {
    /// Resolved offset of the run within the concatenated metadata stream.
    pos: u32,
    count: u32,
}

/// The loaded xattr table.
#[derive(Debug)]
pub struct XattrTable {
    ids: Vec<XattrId>,
    /// Concatenated decompressed xattr metadata.
    data: Vec<u8>,
    /// Compressed-region offset → offset in `data`; needed to chase
    /// out-of-line value references.
    offset_map: HashMap<u32, u32>,
}

impl XattrTable {
    /// Number of id-index records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Resolve the attribute map for one id-index position.
    pub fn find(&self, index: u32) -> Result<BTreeMap<String, String>> {
        let Some(entry) = self.ids.get(index as usize) else {
            return Err(DiskError::Format(format!(
                "xattr index {index} outside id table of {}",
                self.ids.len()
            )));
        };

        let mut attrs = BTreeMap::new();
        let mut pos = entry.pos as usize;
        for _ in 0..entry.count {
            let name_type = read_le_u16(&self.data, pos)?;
            let name_size = usize::from(read_le_u16(&self.data, pos + 2)?);
            let name_bytes =
                vdisk_types::ensure_slice(&self.data, pos + 4, name_size)?.to_vec();
            pos += 4 + name_size;

            let value_size = read_le_u32(&self.data, pos)? as usize;
            let value_bytes = vdisk_types::ensure_slice(&self.data, pos + 4, value_size)?.to_vec();
            pos += 4 + value_size;

            let value_bytes = if name_type & XATTR_OOL_FLAG != 0 {
                self.resolve_out_of_line(&value_bytes)?
            } else {
                value_bytes
            };

            let prefix = match name_type & 0xFF {
                0 => "user.",
                1 => "trusted.",
                2 => "security.",
                other => {
                    return Err(DiskError::Format(format!(
                        "unknown xattr namespace {other}"
                    )));
                }
            };
            let name = format!("{prefix}{}", String::from_utf8_lossy(&name_bytes));
            attrs.insert(name, String::from_utf8_lossy(&value_bytes).into_owned());
        }
        Ok(attrs)
    }

    fn resolve_out_of_line(&self, reference: &[u8]) -> Result<Vec<u8>> {
        if reference.len() != 8 {
            return Err(DiskError::Format(format!(
                "out-of-line xattr reference was {} bytes instead of 8",
                reference.len()
            )));
        }
        let raw = read_le_u64(reference, 0)?;
        #[allow(clippy::cast_possible_truncation)] // masked to their widths
        let (block, offset) = (((raw >> 16) & 0xFFFF_FFFF) as u32, (raw & 0xFFFF) as u32);
        let Some(base) = self.offset_map.get(&block) else {
            return Err(DiskError::Format(format!(
                "out-of-line xattr reference to unknown block {block}"
            )));
        };
        let pos = (*base + offset) as usize;
        let size = read_le_u32(&self.data, pos)? as usize;
        Ok(vdisk_types::ensure_slice(&self.data, pos + 4, size)?.to_vec())
    }
}

/// Load the xattr table, `None` when the superblock declares none.
pub(crate) fn read_xattr_table(
    superblock: &Superblock,
    meta: &MetaStore,
) -> Result<Option<XattrTable>> {
    if superblock.no_xattrs() {
        return Ok(None);
    }

    let mut header = [0_u8; XATTR_HEADER_SIZE];
    meta.read_at(&mut header, superblock.xattr_table_start)?;
    let metadata_start = read_le_u64(&header, 0)?;
    let id_count = read_le_u32(&header, 8)?;
    if id_count == 0 {
        return Ok(None);
    }

    // First-level index: one u64 per id-index metadata block.
    let id_bytes = id_count as u64 * XATTR_ID_ENTRY_SIZE as u64;
    let id_blocks = id_bytes.div_ceil(SQUASH_METADATA_BLOCK_SIZE as u64);
    let mut index = vec![0_u8; vdisk_types::u64_to_usize(id_blocks * 8, "xattr_index")?];
    meta.read_at(
        &mut index,
        superblock.xattr_table_start + XATTR_HEADER_SIZE as u64,
    )?;

    let mut id_raw = Vec::new();
    for i in 0..id_blocks as usize {
        let pos = read_le_u64(&index, 8 * i)?;
        let block = meta.read_meta_block(pos)?;
        id_raw.extend_from_slice(&block.data);
    }

    // The metadata region runs from `metadata_start` to the first id-index
    // block.
    let metadata_end = read_le_u64(&index, 0)?;
    let mut data = Vec::new();
    let mut offset_map = HashMap::new();
    let mut pos = metadata_start;
    while pos < metadata_end {
        #[allow(clippy::cast_possible_truncation)] // region is far below 4 GiB
        offset_map.insert((pos - metadata_start) as u32, data.len() as u32);
        let block = meta.read_meta_block(pos)?;
        data.extend_from_slice(&block.data);
        pos += 2 + u64::from(block.ondisk_len);
    }

    // Resolve each id record's (block, offset) reference into the stream.
    let mut ids = Vec::with_capacity(id_count as usize);
    for i in 0..id_count as usize {
        let record = vdisk_types::ensure_slice(&id_raw, i * XATTR_ID_ENTRY_SIZE, XATTR_ID_ENTRY_SIZE)?;
        let raw_ref = read_le_u64(record, 0)?;
        let count = read_le_u32(record, 8)?;
        #[allow(clippy::cast_possible_truncation)] // masked to their widths
        let (block, offset) = (((raw_ref >> 16) & 0xFFFF_FFFF) as u32, (raw_ref & 0xFFFF) as u32);
        let Some(base) = offset_map.get(&block) else {
            return Err(DiskError::Format(format!(
                "xattr id {i} references unknown metadata block {block}"
            )));
        };
        ids.push(XattrId {
            pos: base + offset,
            count,
        });
    }

    Ok(Some(XattrTable {
        ids,
        data,
        offset_map,
    }))
}

/// Serialize a name/value run for synthetic images. Returns the bytes of
/// the metadata payload.
#[must_use]
pub fn build_xattr_run(attrs: &[(u16, &str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (namespace, name, value) in attrs {
        out.extend_from_slice(&namespace.to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_run(run: Vec<u8>, count: u32) -> XattrTable {
        let mut offset_map = HashMap::new();
        offset_map.insert(0, 0);
        XattrTable {
            ids: vec![XattrId { pos: 0, count }],
            data: run,
            offset_map,
        }
    }

    #[test]
    fn find_resolves_namespaced_names() {
        let run = build_xattr_run(&[
            (0, "origin", b"image-builder"),
            (2, "selinux", b"system_u:object_r:bin_t"),
        ]);
        let table = table_with_run(run, 2);

        let attrs = table.find(0).expect("find");
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs["user.origin"], "image-builder");
        assert_eq!(attrs["security.selinux"], "system_u:object_r:bin_t");
    }

    #[test]
    fn find_out_of_range_index() {
        let table = table_with_run(Vec::new(), 0);
        assert!(table.find(5).is_err());
    }

    #[test]
    fn unknown_namespace_is_an_error() {
        let run = build_xattr_run(&[(9, "weird", b"v")]);
        let table = table_with_run(run, 1);
        assert!(table.find(0).is_err());
    }

    #[test]
    fn out_of_line_value_is_chased() {
        // Stream: a run whose value is an 8-byte reference, then the real
        // u32-size + payload at offset 20.
        let run = build_xattr_run(&[(0x0100, "big", &20_u64.to_le_bytes())]);
        let mut data = run;
        assert_eq!(data.len(), 19); // type+size+name (7) + valsize+ref (12)
        data.push(0); // pad to offset 20
        data.extend_from_slice(&5_u32.to_le_bytes());
        data.extend_from_slice(b"hello");

        let mut offset_map = HashMap::new();
        offset_map.insert(0_u32, 0_u32);
        let table = XattrTable {
            ids: vec![XattrId { pos: 0, count: 1 }],
            data,
            offset_map,
        };

        let attrs = table.find(0).expect("find");
        assert_eq!(attrs["user.big"], "hello");
    }
}
