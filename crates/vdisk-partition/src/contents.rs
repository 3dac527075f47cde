//! Sector-span content streaming shared by both table flavors.

use std::io::{Read, Write};
use vdisk_backend::Backend;
use vdisk_error::{DiskError, Result};
use vdisk_types::ByteOffset;

/// Transfer chunk size: the backend's preferred I/O size, never less than
/// one logical sector.
pub(crate) fn chunk_size(logical_sector_size: u32, physical_sector_size: u32) -> usize {
    physical_sector_size.max(logical_sector_size).max(1) as usize
}

/// Stream `len` bytes starting at `start` into `writer`.
///
/// Stops at the end of the span or on the first sink error. Returns the
/// number of bytes delivered.
pub(crate) fn read_span(
    backend: &dyn Backend,
    writer: &mut dyn Write,
    start: u64,
    len: u64,
    chunk: usize,
) -> Result<u64> {
    let mut buf = vec![0_u8; chunk];
    let mut done = 0_u64;
    while done < len {
        let want = usize::try_from((len - done).min(chunk as u64))
            .map_err(|_| DiskError::Format("chunk size overflows usize".to_owned()))?;
        backend.read_exact_at(&mut buf[..want], ByteOffset(start + done))?;
        writer.write_all(&buf[..want])?;
        done += want as u64;
    }
    Ok(done)
}

/// Fill the span `[start, start + capacity)` from `reader`, one chunk at a
/// time.
///
/// Fails with `PartitionTooSmall` once the producer has more bytes than the
/// span can hold; the error carries the count already written.
pub(crate) fn write_span(
    backend: &dyn Backend,
    reader: &mut dyn Read,
    start: u64,
    capacity: u64,
    chunk: usize,
) -> Result<u64> {
    let mut buf = vec![0_u8; chunk];
    let mut written = 0_u64;
    loop {
        let n = fill_chunk(reader, &mut buf)?;
        if n == 0 {
            return Ok(written);
        }
        if written + n as u64 > capacity {
            return Err(DiskError::PartitionTooSmall { written, capacity });
        }
        backend.write_all_at(&buf[..n], ByteOffset(start + written))?;
        written += n as u64;
    }
}

/// Read from `reader` until `buf` is full or the stream ends.
fn fill_chunk(reader: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut done = 0_usize;
    while done < buf.len() {
        let n = reader.read(&mut buf[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}
