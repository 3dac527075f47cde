//! Synthetic image construction for the test suites.
//!
//! Builds a small but complete image in memory: superblock, data and
//! fragment blocks, inode and directory tables, fragment/id/xattr index
//! tables. Both storage modes are supported so the same tree exercises
//! the uncompressed-flag paths and the zlib paths. This is fixture
//! tooling, not an image serializer.

use crate::directory::build_directory;
use crate::fragment::{FRAGMENT_ENTRY_SIZE, FragmentEntry, fragment_entry_bytes};
use crate::inode::{DATA_BLOCK_UNCOMPRESSED_FLAG, InodeType, NO_FRAGMENT, NO_XATTR};
use crate::metadata::METADATA_UNCOMPRESSED_FLAG;
use crate::superblock::InodeRef;
use crate::xattr::build_xattr_run;
use std::io::Write as _;
use vdisk_types::{SQUASH_MAGIC, SQUASH_SUPERBLOCK_SIZE};

/// A built image plus the ground truth the tests assert against.
pub struct SynthImage {
    pub bytes: Vec<u8>,
    pub block_size: u32,
    /// Contents of `/hello.txt` (fragment-only extended file with xattrs).
    pub hello: Vec<u8>,
    /// Contents of `/data.bin` (one full block plus a 17-byte fragment tail).
    pub data: Vec<u8>,
    /// Contents of `/sparse.bin` (a single all-zero sparse block).
    pub sparse: Vec<u8>,
    /// Contents of `/sub/nested.txt`.
    pub nested: Vec<u8>,
    /// Target of `/link`.
    pub link_target: Vec<u8>,
}

fn zlib(payload: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(payload).expect("zlib write");
    encoder.finish().expect("zlib finish")
}

/// Length-word-prefixed metadata block.
fn meta_block(payload: &[u8], compress: bool) -> Vec<u8> {
    let (stored, word) = if compress {
        let stored = zlib(payload);
        let word = u16::try_from(stored.len()).expect("metadata block fits u16");
        (stored, word)
    } else {
        let word = u16::try_from(payload.len()).expect("metadata block fits u16")
            | METADATA_UNCOMPRESSED_FLAG;
        (payload.to_vec(), word)
    };
    let mut out = Vec::with_capacity(2 + stored.len());
    out.extend_from_slice(&word.to_le_bytes());
    out.extend_from_slice(&stored);
    out
}

/// A raw data block and its inode size word.
fn data_block(payload: &[u8], compress: bool) -> (Vec<u8>, u32) {
    if compress {
        let stored = zlib(payload);
        let word = u32::try_from(stored.len()).expect("data block fits u32");
        (stored, word)
    } else {
        let word =
            u32::try_from(payload.len()).expect("data block fits u32") | DATA_BLOCK_UNCOMPRESSED_FLAG;
        (payload.to_vec(), word)
    }
}

fn inode_header(out: &mut Vec<u8>, itype: InodeType, mode: u16, uid_idx: u16, gid_idx: u16, number: u32) {
    out.extend_from_slice(&itype.to_u16().to_le_bytes());
    out.extend_from_slice(&mode.to_le_bytes());
    out.extend_from_slice(&uid_idx.to_le_bytes());
    out.extend_from_slice(&gid_idx.to_le_bytes());
    out.extend_from_slice(&1_700_000_000_u32.to_le_bytes());
    out.extend_from_slice(&number.to_le_bytes());
}

/// Build the canonical test tree:
///
/// ```text
/// /
/// ├── data.bin     one full block + 17-byte fragment tail
/// ├── hello.txt    extended file, fragment-only, user.greeting xattr
/// ├── link         symlink -> hello.txt
/// ├── sparse.bin   one sparse (all-zero) block
/// └── sub/
///     └── nested.txt
/// ```
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn build_basic_image(compress: bool) -> SynthImage {
    let block_size: u32 = 4096;

    let hello = b"Hello, World!".to_vec();
    let data_full: Vec<u8> = (0..block_size).map(|i| (i % 251) as u8).collect();
    let data_tail: Vec<u8> = (0..17_u8).map(|i| 0xA0 ^ i).collect();
    let mut data = data_full.clone();
    data.extend_from_slice(&data_tail);
    let sparse = vec![0_u8; block_size as usize];
    let nested = b"deep".to_vec();
    let link_target = b"hello.txt".to_vec();

    // ── Fragment block: hello tail + data tail + nested tail ──────────
    let mut frag_payload = Vec::new();
    let hello_frag_offset = frag_payload.len() as u32;
    frag_payload.extend_from_slice(&hello);
    let data_frag_offset = frag_payload.len() as u32;
    frag_payload.extend_from_slice(&data_tail);
    let nested_frag_offset = frag_payload.len() as u32;
    frag_payload.extend_from_slice(&nested);

    // ── Image layout ──────────────────────────────────────────────────
    let mut image = vec![0_u8; SQUASH_SUPERBLOCK_SIZE];

    let data_block_start = image.len() as u64;
    let (data_stored, data_size_word) = data_block(&data_full, compress);
    image.extend_from_slice(&data_stored);

    let frag_block_start = image.len() as u64;
    let (frag_stored, frag_size_word) = data_block(&frag_payload, compress);
    image.extend_from_slice(&frag_stored);

    // ── Inode table: one metadata block, offsets recorded per inode ──
    let mut inodes = Vec::new();

    let hello_ref = InodeRef { block: 0, offset: inodes.len() as u16 };
    inode_header(&mut inodes, InodeType::ExtendedFile, 0o644, 1, 0, 1);
    inodes.extend_from_slice(&0_u64.to_le_bytes()); // blocks_start (no blocks)
    inodes.extend_from_slice(&(hello.len() as u64).to_le_bytes());
    inodes.extend_from_slice(&0_u64.to_le_bytes()); // sparse
    inodes.extend_from_slice(&1_u32.to_le_bytes()); // nlink
    inodes.extend_from_slice(&0_u32.to_le_bytes()); // frag index 0
    inodes.extend_from_slice(&hello_frag_offset.to_le_bytes());
    inodes.extend_from_slice(&0_u32.to_le_bytes()); // xattr id 0

    let data_ref = InodeRef { block: 0, offset: inodes.len() as u16 };
    inode_header(&mut inodes, InodeType::BasicFile, 0o600, 0, 0, 2);
    inodes.extend_from_slice(
        &u32::try_from(data_block_start)
            .expect("data block start fits u32")
            .to_le_bytes(),
    );
    inodes.extend_from_slice(&0_u32.to_le_bytes()); // frag index 0
    inodes.extend_from_slice(&data_frag_offset.to_le_bytes());
    inodes.extend_from_slice(&(data.len() as u32).to_le_bytes());
    inodes.extend_from_slice(&data_size_word.to_le_bytes());

    let sparse_ref = InodeRef { block: 0, offset: inodes.len() as u16 };
    inode_header(&mut inodes, InodeType::BasicFile, 0o644, 0, 0, 3);
    inodes.extend_from_slice(
        &u32::try_from(frag_block_start)
            .expect("fragment block start fits u32")
            .to_le_bytes(),
    );
    inodes.extend_from_slice(&NO_FRAGMENT.to_le_bytes());
    inodes.extend_from_slice(&0_u32.to_le_bytes());
    inodes.extend_from_slice(&(sparse.len() as u32).to_le_bytes());
    inodes.extend_from_slice(&0_u32.to_le_bytes()); // sparse block

    let nested_ref = InodeRef { block: 0, offset: inodes.len() as u16 };
    inode_header(&mut inodes, InodeType::BasicFile, 0o640, 0, 0, 4);
    inodes.extend_from_slice(&0_u32.to_le_bytes());
    inodes.extend_from_slice(&0_u32.to_le_bytes()); // frag index 0
    inodes.extend_from_slice(&nested_frag_offset.to_le_bytes());
    inodes.extend_from_slice(&(nested.len() as u32).to_le_bytes());

    let link_ref = InodeRef { block: 0, offset: inodes.len() as u16 };
    inode_header(&mut inodes, InodeType::BasicSymlink, 0o777, 0, 0, 5);
    inodes.extend_from_slice(&1_u32.to_le_bytes());
    inodes.extend_from_slice(&(link_target.len() as u32).to_le_bytes());
    inodes.extend_from_slice(&link_target);

    // ── Directory table payloads ──────────────────────────────────────
    let sub_listing = build_directory(
        0,
        4,
        &[(nested_ref.offset, 4, InodeType::BasicFile, b"nested.txt")],
    );

    let sub_ref = InodeRef { block: 0, offset: inodes.len() as u16 };
    inode_header(&mut inodes, InodeType::BasicDirectory, 0o755, 0, 0, 6);
    inodes.extend_from_slice(&0_u32.to_le_bytes()); // dir-table block 0
    inodes.extend_from_slice(&2_u32.to_le_bytes()); // nlink
    inodes.extend_from_slice(&(sub_listing.len() as u16 + 3).to_le_bytes());
    inodes.extend_from_slice(&0_u16.to_le_bytes()); // listing offset 0
    inodes.extend_from_slice(&7_u32.to_le_bytes()); // parent = root

    let root_listing_offset = sub_listing.len() as u16;
    let root_listing = build_directory(
        0,
        1,
        &[
            (data_ref.offset, 2, InodeType::BasicFile, b"data.bin"),
            (hello_ref.offset, 1, InodeType::BasicFile, b"hello.txt"),
            (link_ref.offset, 5, InodeType::BasicSymlink, b"link"),
            (sparse_ref.offset, 3, InodeType::BasicFile, b"sparse.bin"),
            (sub_ref.offset, 6, InodeType::BasicDirectory, b"sub"),
        ],
    );

    let root_ref = InodeRef { block: 0, offset: inodes.len() as u16 };
    inode_header(&mut inodes, InodeType::ExtendedDirectory, 0o755, 0, 0, 7);
    inodes.extend_from_slice(&3_u32.to_le_bytes()); // nlink
    inodes.extend_from_slice(&(root_listing.len() as u32 + 3).to_le_bytes());
    inodes.extend_from_slice(&0_u32.to_le_bytes()); // dir-table block 0
    inodes.extend_from_slice(&7_u32.to_le_bytes()); // parent = self
    inodes.extend_from_slice(&0_u16.to_le_bytes()); // index_count
    inodes.extend_from_slice(&root_listing_offset.to_le_bytes());
    inodes.extend_from_slice(&NO_XATTR.to_le_bytes());

    let inode_table_start = image.len() as u64;
    image.extend_from_slice(&meta_block(&inodes, compress));

    let directory_table_start = image.len() as u64;
    let mut directory_payload = sub_listing;
    directory_payload.extend_from_slice(&root_listing);
    image.extend_from_slice(&meta_block(&directory_payload, compress));

    // ── Fragment table: entry metablock + first-level index ──────────
    let frag_entry = FragmentEntry {
        start: frag_block_start,
        size: frag_size_word & !DATA_BLOCK_UNCOMPRESSED_FLAG,
        compressed: compress,
    };
    let mut frag_entries = Vec::with_capacity(FRAGMENT_ENTRY_SIZE);
    frag_entries.extend_from_slice(&fragment_entry_bytes(frag_entry));
    let frag_block_pos = image.len() as u64;
    image.extend_from_slice(&meta_block(&frag_entries, compress));
    let fragment_table_start = image.len() as u64;
    image.extend_from_slice(&frag_block_pos.to_le_bytes());

    // ── Id table: [0, 1000] ───────────────────────────────────────────
    let mut id_payload = Vec::new();
    id_payload.extend_from_slice(&0_u32.to_le_bytes());
    id_payload.extend_from_slice(&1000_u32.to_le_bytes());
    let id_block_pos = image.len() as u64;
    image.extend_from_slice(&meta_block(&id_payload, compress));
    let id_table_start = image.len() as u64;
    image.extend_from_slice(&id_block_pos.to_le_bytes());

    // ── Xattr table: metadata run, id records, header + index ────────
    let xattr_run = build_xattr_run(&[(0, "greeting", b"hi")]);
    let xattr_metadata_start = image.len() as u64;
    image.extend_from_slice(&meta_block(&xattr_run, compress));

    let mut xattr_ids = Vec::new();
    xattr_ids.extend_from_slice(&0_u64.to_le_bytes()); // ref: block 0, offset 0
    xattr_ids.extend_from_slice(&1_u32.to_le_bytes()); // one attribute
    xattr_ids.extend_from_slice(&(xattr_run.len() as u32).to_le_bytes());
    let xattr_id_block_pos = image.len() as u64;
    image.extend_from_slice(&meta_block(&xattr_ids, compress));

    let xattr_table_start = image.len() as u64;
    image.extend_from_slice(&xattr_metadata_start.to_le_bytes());
    image.extend_from_slice(&1_u32.to_le_bytes()); // id count
    image.extend_from_slice(&0_u32.to_le_bytes()); // unused
    image.extend_from_slice(&xattr_id_block_pos.to_le_bytes());

    // ── Superblock ────────────────────────────────────────────────────
    let bytes_used = image.len() as u64;
    let sb = &mut image[..SQUASH_SUPERBLOCK_SIZE];
    sb[0x00..0x04].copy_from_slice(&SQUASH_MAGIC.to_le_bytes());
    sb[0x04..0x08].copy_from_slice(&7_u32.to_le_bytes()); // inode count
    sb[0x08..0x0C].copy_from_slice(&1_700_000_000_u32.to_le_bytes());
    sb[0x0C..0x10].copy_from_slice(&block_size.to_le_bytes());
    sb[0x10..0x14].copy_from_slice(&1_u32.to_le_bytes()); // fragment count
    sb[0x14..0x16].copy_from_slice(&1_u16.to_le_bytes()); // gzip
    sb[0x16..0x18].copy_from_slice(&(block_size.trailing_zeros() as u16).to_le_bytes());
    sb[0x18..0x1A].copy_from_slice(&0_u16.to_le_bytes()); // flags
    sb[0x1A..0x1C].copy_from_slice(&2_u16.to_le_bytes()); // id count
    sb[0x1C..0x1E].copy_from_slice(&4_u16.to_le_bytes());
    sb[0x1E..0x20].copy_from_slice(&0_u16.to_le_bytes());
    sb[0x20..0x28].copy_from_slice(&root_ref.to_raw().to_le_bytes());
    sb[0x28..0x30].copy_from_slice(&bytes_used.to_le_bytes());
    sb[0x30..0x38].copy_from_slice(&id_table_start.to_le_bytes());
    sb[0x38..0x40].copy_from_slice(&xattr_table_start.to_le_bytes());
    sb[0x40..0x48].copy_from_slice(&inode_table_start.to_le_bytes());
    sb[0x48..0x50].copy_from_slice(&directory_table_start.to_le_bytes());
    sb[0x50..0x58].copy_from_slice(&fragment_table_start.to_le_bytes());
    sb[0x58..0x60].copy_from_slice(&crate::superblock::NO_TABLE.to_le_bytes());

    SynthImage {
        bytes: image,
        block_size,
        hello,
        data,
        sparse,
        nested,
        link_target,
    }
}
