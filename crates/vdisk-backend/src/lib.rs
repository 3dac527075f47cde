#![forbid(unsafe_code)]
//! Backing-store layer.
//!
//! Provides the `Backend` trait for positioned byte I/O over a disk image
//! or block device, a file implementation using `pread`/`pwrite` style
//! I/O, and an in-memory implementation for tests and synthetic images.

use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use vdisk_error::{DiskError, Result};
use vdisk_types::ByteOffset;

/// Byte-addressed backing store for fixed-offset I/O (pread/pwrite semantics).
///
/// Every operation on a closed backend fails with `BackendClosed`. A partial
/// `read_at` (fewer bytes than requested) only happens at end-of-data.
pub trait Backend: Send + Sync {
    /// Total length in bytes.
    fn size(&self) -> u64;

    /// Read up to `buf.len()` bytes from `offset`, returning the count read.
    fn read_at(&self, buf: &mut [u8], offset: ByteOffset) -> Result<usize>;

    /// Write up to `buf.len()` bytes at `offset`, returning the count written.
    fn write_at(&self, buf: &[u8], offset: ByteOffset) -> Result<usize>;

    /// Whether this backend accepts writes.
    fn writable(&self) -> bool;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Close the backend. Further operations fail with `BackendClosed`.
    fn close(&self);

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, buf: &mut [u8], offset: ByteOffset) -> Result<()> {
        let mut done = 0_usize;
        while done < buf.len() {
            let n = self.read_at(&mut buf[done..], offset.checked_add(done as u64).ok_or_else(
                || DiskError::Format("read range overflows u64".to_owned()),
            )?)?;
            if n == 0 {
                return Err(DiskError::Format(format!(
                    "short read: wanted {} bytes at offset {offset}, got {done}",
                    buf.len()
                )));
            }
            done += n;
        }
        Ok(())
    }

    /// Write all bytes in `buf` at `offset`.
    fn write_all_at(&self, buf: &[u8], offset: ByteOffset) -> Result<()> {
        let mut done = 0_usize;
        while done < buf.len() {
            let n = self.write_at(&buf[done..], offset.checked_add(done as u64).ok_or_else(
                || DiskError::Format("write range overflows u64".to_owned()),
            )?)?;
            if n == 0 {
                return Err(DiskError::Format(format!(
                    "short write: wanted {} bytes at offset {offset}, wrote {done}",
                    buf.len()
                )));
            }
            done += n;
        }
        Ok(())
    }
}

/// File-backed store using Linux `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position. Opens read-write, falling back to
/// read-only when the image does not permit writes.
#[derive(Debug, Clone)]
pub struct FileBackend {
    file: Arc<File>,
    len: u64,
    writable: bool,
    closed: Arc<AtomicBool>,
}

impl FileBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Open read-only regardless of file permissions.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: false,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DiskError::BackendClosed);
        }
        Ok(())
    }
}

impl Backend for FileBackend {
    fn size(&self) -> u64 {
        self.len
    }

    fn read_at(&self, buf: &mut [u8], offset: ByteOffset) -> Result<usize> {
        self.check_open()?;
        if offset.0 >= self.len {
            return Ok(0);
        }
        let avail = self.len - offset.0;
        let want = buf.len().min(usize::try_from(avail).unwrap_or(usize::MAX));
        let n = self.file.read_at(&mut buf[..want], offset.0)?;
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: ByteOffset) -> Result<usize> {
        self.check_open()?;
        if !self.writable {
            return Err(DiskError::ReadOnly);
        }
        let end = offset
            .0
            .checked_add(buf.len() as u64)
            .ok_or_else(|| DiskError::Format("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(DiskError::Format(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        let n = self.file.write_at(buf, offset.0)?;
        Ok(n)
    }

    fn writable(&self) -> bool {
        self.writable && !self.closed.load(Ordering::Acquire)
    }

    fn sync(&self) -> Result<()> {
        self.check_open()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// In-memory backing store.
///
/// Fixed length, zero-filled at creation. Used by tests and for building
/// synthetic images without touching the filesystem.
#[derive(Debug)]
pub struct MemBackend {
    data: RwLock<Vec<u8>>,
    writable: bool,
    closed: AtomicBool,
}

impl MemBackend {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            data: RwLock::new(vec![0_u8; len]),
            writable: true,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            writable: true,
            closed: AtomicBool::new(false),
        }
    }

    /// Same contents, but rejecting writes with `ReadOnly`.
    #[must_use]
    pub fn read_only(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            writable: false,
            closed: AtomicBool::new(false),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DiskError::BackendClosed);
        }
        Ok(())
    }
}

impl Backend for MemBackend {
    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn read_at(&self, buf: &mut [u8], offset: ByteOffset) -> Result<usize> {
        self.check_open()?;
        let data = self.data.read();
        let Ok(start) = usize::try_from(offset.0) else {
            return Ok(0);
        };
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: ByteOffset) -> Result<usize> {
        self.check_open()?;
        if !self.writable {
            return Err(DiskError::ReadOnly);
        }
        let mut data = self.data.write();
        let start = usize::try_from(offset.0)
            .map_err(|_| DiskError::Format("write offset overflows usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| DiskError::Format("write range overflows usize".to_owned()))?;
        if end > data.len() {
            return Err(DiskError::Format(format!(
                "write out of bounds: offset={offset} len={} image_len={}",
                buf.len(),
                data.len()
            )));
        }
        data[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn writable(&self) -> bool {
        self.writable && !self.closed.load(Ordering::Acquire)
    }

    fn sync(&self) -> Result<()> {
        self.check_open()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_backend_round_trip() {
        let backend = MemBackend::new(1024);
        assert_eq!(backend.size(), 1024);

        backend
            .write_all_at(b"hello", ByteOffset(100))
            .expect("write");
        let mut buf = [0_u8; 5];
        backend
            .read_exact_at(&mut buf, ByteOffset(100))
            .expect("read");
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn mem_backend_partial_read_at_end() {
        let backend = MemBackend::from_vec(vec![7_u8; 10]);
        let mut buf = [0_u8; 8];
        let n = backend.read_at(&mut buf, ByteOffset(6)).expect("read");
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], &[7, 7, 7, 7]);

        let n = backend.read_at(&mut buf, ByteOffset(10)).expect("read");
        assert_eq!(n, 0);
    }

    #[test]
    fn mem_backend_read_only_rejects_writes() {
        let backend = MemBackend::read_only(vec![0_u8; 16]);
        assert!(!backend.writable());
        let err = backend.write_at(b"x", ByteOffset(0)).unwrap_err();
        assert!(matches!(err, DiskError::ReadOnly));
    }

    #[test]
    fn mem_backend_write_out_of_bounds() {
        let backend = MemBackend::new(8);
        let err = backend.write_all_at(&[0_u8; 16], ByteOffset(0)).unwrap_err();
        assert!(matches!(err, DiskError::Format(_)));
    }

    #[test]
    fn closed_backend_fails_everything() {
        let backend = MemBackend::new(64);
        backend.close();

        let mut buf = [0_u8; 4];
        assert!(matches!(
            backend.read_at(&mut buf, ByteOffset(0)).unwrap_err(),
            DiskError::BackendClosed
        ));
        assert!(matches!(
            backend.write_at(&buf, ByteOffset(0)).unwrap_err(),
            DiskError::BackendClosed
        ));
        assert!(matches!(backend.sync().unwrap_err(), DiskError::BackendClosed));
        assert!(!backend.writable());
    }

    #[test]
    fn file_backend_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image.img");
        std::fs::write(&path, vec![0_u8; 4096]).expect("seed file");

        let backend = FileBackend::open(&path).expect("open");
        assert_eq!(backend.size(), 4096);
        assert!(backend.writable());

        backend
            .write_all_at(b"vdisk", ByteOffset(2048))
            .expect("write");
        backend.sync().expect("sync");

        let mut buf = [0_u8; 5];
        backend
            .read_exact_at(&mut buf, ByteOffset(2048))
            .expect("read");
        assert_eq!(&buf, b"vdisk");

        backend.close();
        assert!(matches!(
            backend.read_at(&mut buf, ByteOffset(0)).unwrap_err(),
            DiskError::BackendClosed
        ));
    }

    #[test]
    fn file_backend_read_only_fallback() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image.img");
        std::fs::write(&path, vec![1_u8; 512]).expect("seed file");

        let backend = FileBackend::open_read_only(&path).expect("open");
        assert!(!backend.writable());
        assert!(matches!(
            backend.write_at(b"x", ByteOffset(0)).unwrap_err(),
            DiskError::ReadOnly
        ));
    }
}
