//! Streaming file reads.
//!
//! A regular file is a run of data blocks at `blocks_start` (sizes from
//! the inode's block list, bit 24 marking stored-uncompressed, zero
//! marking a sparse block) plus an optional tail in a shared fragment
//! block. Data blocks are read uncached; fragment blocks go through the
//! LRU shared with the metadata reader.

use crate::Inner;
use crate::inode::DATA_BLOCK_UNCOMPRESSED_FLAG;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use vdisk_error::DiskError;

/// The resolved data geometry of one regular file.
#[derive(Debug, Clone)]
pub(crate) struct FilePlan {
    pub blocks_start: u64,
    pub block_sizes: Vec<u32>,
    /// `(fragment index, offset within the fragment block)` for the tail.
    pub fragment: Option<(u32, u32)>,
    pub file_size: u64,
}

/// A read-only streaming handle over one file's bytes.
pub struct SquashFile {
    inner: Arc<Inner>,
    plan: FilePlan,
    /// Absolute position of each data block, derived from the size list.
    block_offsets: Vec<u64>,
    pos: u64,
}

impl SquashFile {
    pub(crate) fn new(inner: Arc<Inner>, plan: FilePlan) -> Self {
        let mut block_offsets = Vec::with_capacity(plan.block_sizes.len());
        let mut offset = plan.blocks_start;
        for size in &plan.block_sizes {
            block_offsets.push(offset);
            offset += u64::from(size & !DATA_BLOCK_UNCOMPRESSED_FLAG);
        }
        Self {
            inner,
            plan,
            block_offsets,
            pos: 0,
        }
    }

    /// Total file size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.plan.file_size
    }

    /// Decompressed bytes of data block `index`, bounded to the file size.
    fn block_bytes(&self, index: usize) -> io::Result<Vec<u8>> {
        let block_size = u64::from(self.inner.superblock.block_size.get());
        let logical_len = (self.plan.file_size - index as u64 * block_size).min(block_size);
        let logical_len = usize::try_from(logical_len)
            .map_err(|_| io::Error::other("block length overflows usize"))?;

        let size_word = self.plan.block_sizes[index];
        let ondisk = size_word & !DATA_BLOCK_UNCOMPRESSED_FLAG;

        // A zero size word is a sparse block: all zeros, no I/O.
        if ondisk == 0 {
            return Ok(vec![0_u8; logical_len]);
        }

        let mut payload = vec![0_u8; ondisk as usize];
        self.inner
            .meta
            .read_at(&mut payload, self.block_offsets[index])
            .map_err(DiskError::into_io)?;

        let data = if size_word & DATA_BLOCK_UNCOMPRESSED_FLAG != 0 {
            payload
        } else {
            self.inner
                .meta
                .compressor()
                .decompress(&payload, self.inner.superblock.block_size.get() as usize)
                .map_err(DiskError::into_io)?
        };

        if data.len() < logical_len {
            return Err(io::Error::other(format!(
                "data block {index} decompressed to {} bytes, expected {logical_len}",
                data.len()
            )));
        }
        Ok(data)
    }

    /// The fragment-tail bytes for positions past the last full block.
    fn fragment_bytes(&self) -> io::Result<Vec<u8>> {
        let Some((index, offset)) = self.plan.fragment else {
            return Err(io::Error::other("file has no fragment tail"));
        };
        let block_size = u64::from(self.inner.superblock.block_size.get());
        let tail_len = self.plan.file_size - self.block_offsets.len() as u64 * block_size;
        self.inner
            .read_fragment(index, offset, tail_len)
            .map_err(DiskError::into_io)
    }
}

impl Read for SquashFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.plan.file_size {
            return Ok(0);
        }
        let block_size = u64::from(self.inner.superblock.block_size.get());
        let block_index = (self.pos / block_size) as usize;
        let in_block = (self.pos % block_size) as usize;

        let chunk = if block_index < self.block_offsets.len() {
            self.block_bytes(block_index)?
        } else {
            // Tail bytes live in the fragment block; index past the full
            // blocks always lands at in-fragment offset pos - blocks*bs.
            let frag = self.fragment_bytes()?;
            let skip = (self.pos - self.block_offsets.len() as u64 * block_size) as usize;
            let n = buf.len().min(frag.len().saturating_sub(skip));
            buf[..n].copy_from_slice(&frag[skip..skip + n]);
            self.pos += n as u64;
            return Ok(n);
        };

        let remaining_in_file = (self.plan.file_size - self.pos) as usize;
        let n = buf
            .len()
            .min(chunk.len().saturating_sub(in_block))
            .min(remaining_in_file);
        buf[..n].copy_from_slice(&chunk[in_block..in_block + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SquashFile {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let next = match target {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::End(delta) => i128::from(self.plan.file_size) + i128::from(delta),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
        };
        if next < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.pos = u64::try_from(next)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "seek overflows u64"))?;
        Ok(self.pos)
    }
}

impl Write for SquashFile {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(DiskError::ReadOnly.into_io())
    }

    fn flush(&mut self) -> io::Result<()> {
        Err(DiskError::ReadOnly.into_io())
    }
}
