//! uid/gid table.
//!
//! Inode headers store 16-bit indexes into a flat array of 32-bit ids.
//! The ids are packed into metadata blocks; a flat array of u64 offsets
//! at `id_table_start` indexes those blocks.

use crate::metadata::MetaStore;
use crate::superblock::Superblock;
use vdisk_error::{DiskError, Result};
use vdisk_types::{SQUASH_METADATA_BLOCK_SIZE, read_le_u32, read_le_u64};

/// Bytes per id entry.
pub const ID_ENTRY_SIZE: u32 = 4;

/// Load the whole id table through its first-level index.
pub(crate) fn read_id_table(superblock: &Superblock, meta: &MetaStore) -> Result<Vec<u32>> {
    let id_count = u32::from(superblock.id_count);
    if id_count == 0 {
        return Ok(Vec::new());
    }

    let id_bytes = id_count * ID_ENTRY_SIZE;
    let block_count = id_bytes.div_ceil(SQUASH_METADATA_BLOCK_SIZE as u32);
    let mut index = vec![0_u8; block_count as usize * 8];
    meta.read_at(&mut index, superblock.id_table_start)?;

    let mut ids = Vec::with_capacity(id_count as usize);
    for i in 0..block_count as usize {
        let pos = read_le_u64(&index, 8 * i)?;
        let block = meta.read_meta_block(pos)?;
        for chunk in block.data.chunks_exact(ID_ENTRY_SIZE as usize) {
            if ids.len() == id_count as usize {
                break;
            }
            ids.push(read_le_u32(chunk, 0)?);
        }
    }

    if ids.len() != id_count as usize {
        return Err(DiskError::Format(format!(
            "id table holds {} entries, superblock promises {id_count}",
            ids.len()
        )));
    }
    Ok(ids)
}

/// Map an inode header's id index into the table.
pub(crate) fn lookup_id(ids: &[u32], index: u16, which: &'static str) -> Result<u32> {
    ids.get(usize::from(index))
        .copied()
        .ok_or_else(|| DiskError::Format(format!("{which} index {index} outside id table of {}", ids.len())))
}
