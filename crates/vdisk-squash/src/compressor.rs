//! Compressor registry.
//!
//! The superblock names one algorithm for the whole image; it is resolved
//! to a concrete decompressor once at open time. Decompression is pure and
//! takes no shared mutable state, so one handle serves any number of
//! readers.

use std::io::Read;
use vdisk_error::{DiskError, Result};

pub const COMPRESSION_GZIP: u16 = 1;
pub const COMPRESSION_LZMA: u16 = 2;
pub const COMPRESSION_LZO: u16 = 3;
pub const COMPRESSION_XZ: u16 = 4;
pub const COMPRESSION_LZ4: u16 = 5;
pub const COMPRESSION_ZSTD: u16 = 6;

/// A resolved decompressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    /// gzip id: zlib-framed deflate streams.
    Gzip,
    Xz,
    Lz4,
    Zstd,
}

impl Compressor {
    /// Resolve a superblock compression id.
    ///
    /// lzma and lzo images exist in the wild but have no decompressor here;
    /// they fail the same way as ids this format has never assigned.
    pub fn new(id: u16) -> Result<Self> {
        match id {
            COMPRESSION_GZIP => Ok(Self::Gzip),
            COMPRESSION_XZ => Ok(Self::Xz),
            COMPRESSION_LZ4 => Ok(Self::Lz4),
            COMPRESSION_ZSTD => Ok(Self::Zstd),
            other => Err(DiskError::UnsupportedCompression { id: other }),
        }
    }

    /// Decompress one block payload.
    ///
    /// `max_out` bounds the decompressed size (8 KiB for metadata blocks,
    /// the filesystem block size for data and fragment blocks).
    pub fn decompress(self, data: &[u8], max_out: usize) -> Result<Vec<u8>> {
        let out = match self {
            Self::Gzip => {
                let mut out = Vec::with_capacity(max_out.min(1 << 16));
                flate2::read::ZlibDecoder::new(data)
                    .take(max_out as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|err| DiskError::Format(format!("zlib decompress: {err}")))?;
                out
            }
            Self::Xz => {
                let mut out = Vec::with_capacity(max_out.min(1 << 16));
                xz2::read::XzDecoder::new(data)
                    .take(max_out as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|err| DiskError::Format(format!("xz decompress: {err}")))?;
                out
            }
            Self::Lz4 => lz4_flex::block::decompress(data, max_out)
                .map_err(|err| DiskError::Format(format!("lz4 decompress: {err}")))?,
            Self::Zstd => zstd::bulk::decompress(data, max_out)
                .map_err(|err| DiskError::Format(format!("zstd decompress: {err}")))?,
        };

        if out.len() > max_out {
            return Err(DiskError::Format(format!(
                "decompressed block is {} bytes, limit is {max_out}",
                out.len()
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolves_known_ids() {
        assert_eq!(Compressor::new(COMPRESSION_GZIP).unwrap(), Compressor::Gzip);
        assert_eq!(Compressor::new(COMPRESSION_XZ).unwrap(), Compressor::Xz);
        assert_eq!(Compressor::new(COMPRESSION_LZ4).unwrap(), Compressor::Lz4);
        assert_eq!(Compressor::new(COMPRESSION_ZSTD).unwrap(), Compressor::Zstd);
    }

    #[test]
    fn rejects_unsupported_ids() {
        for id in [0, COMPRESSION_LZMA, COMPRESSION_LZO, 7, 99] {
            match Compressor::new(id).unwrap_err() {
                DiskError::UnsupportedCompression { id: got } => assert_eq!(got, id),
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn zlib_round_trip() {
        let payload = b"metadata blocks compress well well well well well well".repeat(8);
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&payload).unwrap();
        let compressed = encoder.finish().unwrap();

        let out = Compressor::Gzip
            .decompress(&compressed, 8192)
            .expect("decompress");
        assert_eq!(out, payload);
    }

    #[test]
    fn zlib_rejects_oversized_output() {
        let payload = vec![0_u8; 4096];
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&payload).unwrap();
        let compressed = encoder.finish().unwrap();

        assert!(Compressor::Gzip.decompress(&compressed, 100).is_err());
    }

    #[test]
    fn garbage_input_is_an_error() {
        assert!(Compressor::Gzip.decompress(b"not zlib", 8192).is_err());
        assert!(Compressor::Zstd.decompress(b"not zstd", 8192).is_err());
    }
}
