//! Metadata blocks and the decompressed-block cache.
//!
//! A metadata block is a 16-bit length word followed by a payload of at
//! most 8 KiB decompressed; the word's top bit marks the payload as stored
//! uncompressed. Blocks are addressed by their absolute position within
//! the filesystem and chained to satisfy reads that straddle boundaries.
//!
//! The cache is an intrusive doubly linked list over a slab of nodes plus
//! a position map, giving O(1) touch and eviction. Capacity is counted in
//! slots; capacity zero disables caching entirely.

use crate::compressor::Compressor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;
use vdisk_backend::Backend;
use vdisk_error::{DiskError, Result};
use vdisk_types::{ByteOffset, SQUASH_METADATA_BLOCK_SIZE};

/// Length-word bit marking an uncompressed metadata payload.
pub const METADATA_UNCOMPRESSED_FLAG: u16 = 0x8000;

/// A decompressed block plus its on-disk payload length, so callers can
/// compute the next block's position (`pos + 2 + ondisk_len`).
#[derive(Debug, Clone)]
pub struct CachedBlock {
    pub data: Arc<[u8]>,
    pub ondisk_len: u16,
}

/// Point-in-time counters for the block cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resident: usize,
    pub capacity: usize,
}

struct Node {
    pos: u64,
    block: CachedBlock,
    prev: Option<usize>,
    next: Option<usize>,
}

struct CacheState {
    capacity: usize,
    map: HashMap<u64, usize>,
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[idx].prev = None;
        self.nodes[idx].next = None;
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = None;
        self.nodes[idx].next = self.head;
        if let Some(old) = self.head {
            self.nodes[old].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn evict_lru(&mut self) {
        if let Some(victim) = self.tail {
            let pos = self.nodes[victim].pos;
            self.unlink(victim);
            self.map.remove(&pos);
            self.free.push(victim);
            self.evictions += 1;
            trace!(target: "vdisk::squash::cache", event = "evict", pos);
        }
    }

    fn insert(&mut self, pos: u64, block: CachedBlock) {
        if self.map.len() >= self.capacity {
            self.evict_lru();
        }
        let node = Node {
            pos,
            block,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.map.insert(pos, idx);
        self.push_front(idx);
    }
}

/// LRU cache over decompressed blocks, keyed by absolute position.
///
/// Metadata blocks and fragment blocks share this namespace.
pub struct BlockCache {
    state: Mutex<CacheState>,
}

impl BlockCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                capacity,
                map: HashMap::new(),
                nodes: Vec::new(),
                free: Vec::new(),
                head: None,
                tail: None,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    /// Fetch the block at `pos`, loading it at most once on a miss.
    ///
    /// With capacity zero every access is a miss and nothing is inserted.
    /// A loader failure inserts nothing.
    pub fn get(
        &self,
        pos: u64,
        loader: impl FnOnce() -> Result<CachedBlock>,
    ) -> Result<CachedBlock> {
        let mut state = self.state.lock();
        if state.capacity == 0 {
            state.misses += 1;
            drop(state);
            return loader();
        }

        if let Some(&idx) = state.map.get(&pos) {
            debug_assert_eq!(state.nodes[idx].pos, pos);
            state.hits += 1;
            state.unlink(idx);
            state.push_front(idx);
            trace!(target: "vdisk::squash::cache", event = "hit", pos);
            return Ok(state.nodes[idx].block.clone());
        }

        state.misses += 1;
        trace!(target: "vdisk::squash::cache", event = "miss", pos);
        let block = loader()?;
        state.insert(pos, block.clone());
        Ok(block)
    }

    /// Change the slot capacity, evicting down to the new limit.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.state.lock();
        state.capacity = capacity;
        while state.map.len() > capacity {
            state.evict_lru();
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Cached positions in most-recently-used order.
    #[must_use]
    pub fn cached_positions(&self) -> Vec<u64> {
        let state = self.state.lock();
        let mut out = Vec::with_capacity(state.map.len());
        let mut cursor = state.head;
        while let Some(idx) = cursor {
            out.push(state.nodes[idx].pos);
            cursor = state.nodes[idx].next;
        }
        out
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let state = self.state.lock();
        CacheMetrics {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            resident: state.map.len(),
            capacity: state.capacity,
        }
    }

    /// Drop every cached block.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.map.clear();
        state.nodes.clear();
        state.free.clear();
        state.head = None;
        state.tail = None;
    }
}

/// Raw I/O plus decompression for one filesystem: the backend view, the
/// resolved compressor, and the shared block cache.
pub(crate) struct MetaStore {
    backend: Arc<dyn Backend>,
    /// Byte offset of the filesystem within the backend.
    start: u64,
    compressor: Compressor,
    pub(crate) cache: BlockCache,
}

impl MetaStore {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        start: u64,
        compressor: Compressor,
        cache_slots: usize,
    ) -> Self {
        Self {
            backend,
            start,
            compressor,
            cache: BlockCache::new(cache_slots),
        }
    }

    pub(crate) fn compressor(&self) -> Compressor {
        self.compressor
    }

    /// Read raw bytes at a filesystem-relative position.
    pub(crate) fn read_at(&self, buf: &mut [u8], pos: u64) -> Result<()> {
        let offset = self
            .start
            .checked_add(pos)
            .ok_or_else(|| DiskError::Format("filesystem offset overflows u64".to_owned()))?;
        self.backend.read_exact_at(buf, ByteOffset(offset))
    }

    /// Decode the metadata block at filesystem-relative position `pos`,
    /// bypassing the cache.
    pub(crate) fn read_meta_block(&self, pos: u64) -> Result<CachedBlock> {
        let mut word = [0_u8; 2];
        self.read_at(&mut word, pos)?;
        let word = u16::from_le_bytes(word);
        let ondisk_len = word & !METADATA_UNCOMPRESSED_FLAG;
        let stored_uncompressed = word & METADATA_UNCOMPRESSED_FLAG != 0;

        if ondisk_len == 0 || usize::from(ondisk_len) > SQUASH_METADATA_BLOCK_SIZE {
            return Err(DiskError::Format(format!(
                "metadata block at {pos} has implausible on-disk size {ondisk_len}"
            )));
        }

        let mut payload = vec![0_u8; usize::from(ondisk_len)];
        self.read_at(&mut payload, pos + 2)?;

        let data = if stored_uncompressed {
            payload
        } else {
            self.compressor
                .decompress(&payload, SQUASH_METADATA_BLOCK_SIZE)?
        };

        Ok(CachedBlock {
            data: data.into(),
            ondisk_len,
        })
    }

    /// Cached fetch of the metadata block at `pos`.
    pub(crate) fn meta_block(&self, pos: u64) -> Result<CachedBlock> {
        self.cache.get(pos, || self.read_meta_block(pos))
    }

    /// Return at least `want` decompressed bytes starting at the metadata
    /// address (`table_start + block`, `offset`), chaining consecutive
    /// blocks as needed.
    pub(crate) fn read_metadata(
        &self,
        table_start: u64,
        block: u32,
        offset: u16,
        want: usize,
    ) -> Result<Vec<u8>> {
        let mut pos = table_start
            .checked_add(u64::from(block))
            .ok_or_else(|| DiskError::Format("metadata position overflows u64".to_owned()))?;
        let mut skip = usize::from(offset);
        let mut out = Vec::with_capacity(want);

        while out.len() < want {
            let cached = self.meta_block(pos)?;
            if skip > cached.data.len() {
                return Err(DiskError::Format(format!(
                    "metadata offset {skip} beyond block of {} bytes at {pos}",
                    cached.data.len()
                )));
            }
            out.extend_from_slice(&cached.data[skip..]);
            skip = 0;
            pos += 2 + u64::from(cached.ondisk_len);
        }
        Ok(out)
    }

    /// Cached fetch of a fragment block (no length word; location and size
    /// come from the fragment table).
    pub(crate) fn fragment_block(
        &self,
        pos: u64,
        ondisk_size: u32,
        compressed: bool,
        block_size: usize,
    ) -> Result<CachedBlock> {
        self.cache.get(pos, || {
            let mut payload =
                vec![0_u8; vdisk_types::u64_to_usize(u64::from(ondisk_size), "fragment_size")?];
            self.read_at(&mut payload, pos)?;
            let data = if compressed {
                self.compressor.decompress(&payload, block_size)?
            } else {
                payload
            };
            Ok(CachedBlock {
                data: data.into(),
                ondisk_len: 0,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vdisk_backend::MemBackend;

    fn block(byte: u8) -> CachedBlock {
        CachedBlock {
            data: vec![byte; 4].into(),
            ondisk_len: 4,
        }
    }

    #[test]
    fn lru_keeps_most_recent_keys() {
        let cache = BlockCache::new(3);
        // Accesses a, b, c, a, d with capacity 3 leave {a, c, d},
        // MRU order d, a, c.
        for pos in [1_u64, 2, 3, 1, 4] {
            cache.get(pos, || Ok(block(pos as u8))).expect("load");
        }
        assert_eq!(cache.cached_positions(), vec![4, 1, 3]);

        let metrics = cache.metrics();
        assert_eq!(metrics.resident, 3);
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 4);
        assert_eq!(metrics.evictions, 1);
    }

    #[test]
    fn lru_retains_exactly_capacity_distinct_keys() {
        let cache = BlockCache::new(4);
        for pos in 0..10_u64 {
            cache.get(pos, || Ok(block(pos as u8))).expect("load");
        }
        let kept = cache.cached_positions();
        assert_eq!(kept, vec![9, 8, 7, 6]);
    }

    #[test]
    fn hit_skips_the_loader() {
        let cache = BlockCache::new(2);
        cache.get(7, || Ok(block(7))).expect("load");
        let got = cache
            .get(7, || panic!("loader must not run on a hit"))
            .expect("hit");
        assert_eq!(got.data.as_ref(), &[7, 7, 7, 7]);
    }

    #[test]
    fn capacity_zero_disables_caching() {
        let cache = BlockCache::new(0);
        let mut loads = 0;
        for _ in 0..3 {
            cache
                .get(1, || {
                    loads += 1;
                    Ok(block(1))
                })
                .expect("load");
        }
        assert_eq!(loads, 3);
        assert!(cache.cached_positions().is_empty());
    }

    #[test]
    fn loader_failure_inserts_nothing() {
        let cache = BlockCache::new(2);
        let err = cache
            .get(9, || Err(DiskError::Format("boom".to_owned())))
            .unwrap_err();
        assert!(matches!(err, DiskError::Format(_)));
        assert!(cache.cached_positions().is_empty());

        // The next access runs the loader again.
        cache.get(9, || Ok(block(9))).expect("load");
        assert_eq!(cache.cached_positions(), vec![9]);
    }

    #[test]
    fn set_capacity_evicts_down() {
        let cache = BlockCache::new(4);
        for pos in 0..4_u64 {
            cache.get(pos, || Ok(block(pos as u8))).expect("load");
        }
        cache.set_capacity(2);
        assert_eq!(cache.cached_positions(), vec![3, 2]);
    }

    /// Build an image of consecutive metadata blocks at offset 0.
    fn meta_image(payloads: &[&[u8]], compress: bool) -> Vec<u8> {
        let mut image = Vec::new();
        for payload in payloads {
            let stored: Vec<u8> = if compress {
                let mut enc =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                enc.write_all(payload).unwrap();
                enc.finish().unwrap()
            } else {
                payload.to_vec()
            };
            #[allow(clippy::cast_possible_truncation)] // test payloads are tiny
            let word = if compress {
                stored.len() as u16
            } else {
                stored.len() as u16 | METADATA_UNCOMPRESSED_FLAG
            };
            image.extend_from_slice(&word.to_le_bytes());
            image.extend_from_slice(&stored);
        }
        image.resize(image.len() + 64, 0);
        image
    }

    fn store_for(image: Vec<u8>, slots: usize) -> MetaStore {
        MetaStore::new(
            Arc::new(MemBackend::from_vec(image)),
            0,
            Compressor::Gzip,
            slots,
        )
    }

    #[test]
    fn read_meta_block_uncompressed() {
        let store = store_for(meta_image(&[b"hello metadata"], false), 8);
        let block = store.read_meta_block(0).expect("read");
        assert_eq!(block.data.as_ref(), b"hello metadata");
        assert_eq!(block.ondisk_len, 14);
    }

    #[test]
    fn read_meta_block_compressed() {
        let payload = b"compressible compressible compressible".repeat(4);
        let store = store_for(meta_image(&[&payload], true), 8);
        let block = store.read_meta_block(0).expect("read");
        assert_eq!(block.data.as_ref(), payload.as_slice());
    }

    #[test]
    fn read_metadata_chains_blocks() {
        let first = vec![0xAA_u8; 100];
        let second = vec![0xBB_u8; 100];
        let third = vec![0xCC_u8; 100];
        let store = store_for(meta_image(&[&first, &second, &third], false), 8);

        // Spanning read: from offset 90 in block 0, take 150 bytes.
        let out = store.read_metadata(0, 0, 90, 150).expect("read");
        assert!(out.len() >= 150);
        assert_eq!(&out[..10], &[0xAA; 10]);
        assert_eq!(&out[10..110], &[0xBB; 100]);
        assert_eq!(&out[110..150], &[0xCC; 40]);

        // The exact-concatenation property for a few straddling sizes.
        for want in [1_usize, 100, 101, 250] {
            let full = store.read_metadata(0, 0, 0, want).expect("read");
            let mut expected = Vec::new();
            expected.extend_from_slice(&first);
            expected.extend_from_slice(&second);
            expected.extend_from_slice(&third);
            assert_eq!(&full[..want], &expected[..want]);
        }
    }

    #[test]
    fn read_metadata_uses_the_cache() {
        let store = store_for(meta_image(&[&[1_u8; 64], &[2_u8; 64]], false), 8);
        store.read_metadata(0, 0, 0, 128).expect("first");
        let misses_after_first = store.cache.metrics().misses;
        store.read_metadata(0, 0, 0, 128).expect("second");
        let metrics = store.cache.metrics();
        assert_eq!(metrics.misses, misses_after_first);
        assert!(metrics.hits >= 2);
    }

    #[test]
    fn fragment_block_shares_the_cache_namespace() {
        let image = vec![0x5A_u8; 256];
        let store = store_for(image, 8);
        let first = store
            .fragment_block(16, 32, false, 131_072)
            .expect("fragment");
        assert_eq!(first.data.len(), 32);
        assert_eq!(store.cache.cached_positions(), vec![16]);

        store
            .fragment_block(16, 32, false, 131_072)
            .expect("cached fragment");
        assert_eq!(store.cache.metrics().hits, 1);
    }

    #[test]
    fn zero_length_metadata_block_is_corrupt() {
        let image = vec![0_u8; 64];
        let store = store_for(image, 8);
        assert!(store.read_meta_block(0).is_err());
    }
}
