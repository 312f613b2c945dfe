//! Salted multi-level Merkle tree over fixed-size data blocks.
//!
//! Level 0 hashes the data blocks, every further level hashes the blocks of
//! the level below, and the last level is a single block whose digest is the
//! root hash. Levels are stored back to back, level 0 first, each padded with
//! zeroes to whole hash blocks.

use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashTreeError {
    #[error("unsupported digest algorithm `{0}`")]
    InvalidAlgorithm(String),
    #[error("invalid tree parameters: {0}")]
    InvalidParameters(String),
    #[error("short transfer at offset {offset}: wanted {expected} bytes, got {actual}")]
    Truncated {
        offset: u64,
        expected: usize,
        actual: usize,
    },
    #[error("hash tree offsets overflow")]
    Overflow,
    #[error("hash block {block} of level {level} does not match the data")]
    Mismatch { level: usize, block: u64 },
    #[error("root hash does not match")]
    RootMismatch,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha256" => Some(DigestAlgorithm::Sha256),
            "sha512" => Some(DigestAlgorithm::Sha512),
            _ => None,
        }
    }

    pub fn parse(name: &str) -> Result<Self, HashTreeError> {
        Self::from_name(name).ok_or_else(|| HashTreeError::InvalidAlgorithm(name.to_string()))
    }

    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn size(self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    /// `digest(salt || block)`
    pub fn digest(self, salt: &[u8], block: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha256 => Sha256::new()
                .chain_update(salt)
                .chain_update(block)
                .finalize()
                .to_vec(),
            DigestAlgorithm::Sha512 => Sha512::new()
                .chain_update(salt)
                .chain_update(block)
                .finalize()
                .to_vec(),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Positioned block reads.
pub trait BlockRead {
    fn read_block_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), HashTreeError>;
}

/// Positioned block writes.
pub trait BlockWrite {
    fn write_block_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), HashTreeError>;
}

impl<T: Read + Seek + ?Sized> BlockRead for T {
    fn read_block_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), HashTreeError> {
        self.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(HashTreeError::Truncated {
                        offset,
                        expected: buf.len(),
                        actual: filled,
                    })
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

impl<T: Write + Seek + ?Sized> BlockWrite for T {
    fn write_block_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), HashTreeError> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(buf).map_err(|err| match err.kind() {
            io::ErrorKind::WriteZero => HashTreeError::Truncated {
                offset,
                expected: buf.len(),
                actual: 0,
            },
            _ => HashTreeError::Io(err),
        })
    }
}

/// Shape of a tree: digest, block sizes, and the salt mixed into every hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeParams {
    pub algorithm: DigestAlgorithm,
    pub n_data_blocks: u64,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub salt: Vec<u8>,
}

/// Per-level block counts derived from [`TreeParams`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeGeometry {
    levels: Vec<u64>,
    hash_block_size: u64,
}

impl TreeGeometry {
    pub fn new(params: &TreeParams) -> Result<Self, HashTreeError> {
        let digest_size = params.algorithm.size() as u64;
        let hash_block_size = u64::from(params.hash_block_size);

        if params.data_block_size == 0 || hash_block_size == 0 {
            return Err(HashTreeError::InvalidParameters(
                "block sizes must be positive".into(),
            ));
        }
        if hash_block_size % digest_size != 0 {
            return Err(HashTreeError::InvalidParameters(format!(
                "{}-byte digests do not divide {hash_block_size}-byte hash blocks",
                digest_size
            )));
        }
        let hashes_per_block = hash_block_size / digest_size;
        if hashes_per_block < 2 || !hashes_per_block.is_power_of_two() {
            return Err(HashTreeError::InvalidParameters(format!(
                "{hashes_per_block} hashes per block is not a power of two above one"
            )));
        }
        if params.n_data_blocks <= 2 {
            return Err(HashTreeError::InvalidParameters(format!(
                "{} data blocks are too few for a tree",
                params.n_data_blocks
            )));
        }

        let mut levels = Vec::new();
        let mut blocks = params.n_data_blocks;
        loop {
            blocks = blocks.div_ceil(hashes_per_block);
            levels.push(blocks);
            if blocks == 1 {
                break;
            }
        }

        let geometry = Self {
            levels,
            hash_block_size,
        };
        geometry.total_bytes()?;
        Ok(geometry)
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Hash blocks in `level`.
    pub fn level_blocks(&self, level: usize) -> Option<u64> {
        self.levels.get(level).copied()
    }

    /// Byte offset of `level` relative to the start of the tree.
    pub fn level_offset(&self, level: usize) -> Result<u64, HashTreeError> {
        self.levels[..level.min(self.levels.len())]
            .iter()
            .try_fold(0u64, |acc, blocks| {
                blocks
                    .checked_mul(self.hash_block_size)
                    .and_then(|bytes| acc.checked_add(bytes))
            })
            .ok_or(HashTreeError::Overflow)
    }

    pub fn total_bytes(&self) -> Result<u64, HashTreeError> {
        self.level_offset(self.levels.len())
    }
}

/// Smallest `N` with `(n_data_blocks - 1) >> (N * log2(hashes_per_block)) == 0`.
pub fn level_count(n_data_blocks: u64, hashes_per_block: u64) -> usize {
    let bits = hashes_per_block.trailing_zeros();
    let mut remaining = n_data_blocks.saturating_sub(1);
    let mut levels = 1;
    while bits > 0 && bits < u64::BITS && (remaining >> bits) != 0 {
        remaining >>= bits;
        levels += 1;
    }
    levels
}

/// Result of [`build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltTree {
    pub root_hash: Vec<u8>,
    pub hash_bytes: u64,
    pub levels: usize,
}

/// Hash `params.n_data_blocks` blocks read from `data` at `data_offset` and
/// write the tree to `sink` at `hash_offset`.
pub fn build<R, W>(
    data: &mut R,
    data_offset: u64,
    sink: &mut W,
    hash_offset: u64,
    params: &TreeParams,
) -> Result<BuiltTree, HashTreeError>
where
    R: BlockRead + ?Sized,
    W: BlockWrite + ?Sized,
{
    let geometry = TreeGeometry::new(params)?;
    let root_hash = compute(data, data_offset, params, &geometry, |level, index, block| {
        let offset = block_offset(&geometry, hash_offset, level, index)?;
        sink.write_block_at(offset, block)
    })?;

    Ok(BuiltTree {
        root_hash,
        hash_bytes: geometry.total_bytes()?,
        levels: geometry.level_count(),
    })
}

/// Recompute the tree over `data` and require every stored hash block and the
/// root hash to match exactly.
pub fn verify<R, S>(
    data: &mut R,
    data_offset: u64,
    stored: &mut S,
    hash_offset: u64,
    params: &TreeParams,
    expected_root: &[u8],
) -> Result<(), HashTreeError>
where
    R: BlockRead + ?Sized,
    S: BlockRead + ?Sized,
{
    let geometry = TreeGeometry::new(params)?;
    let mut on_disk = vec![0u8; geometry.hash_block_size as usize];

    let root_hash = compute(data, data_offset, params, &geometry, |level, index, block| {
        let offset = block_offset(&geometry, hash_offset, level, index)?;
        stored.read_block_at(offset, &mut on_disk)?;
        if on_disk != block {
            return Err(HashTreeError::Mismatch {
                level,
                block: index,
            });
        }
        Ok(())
    })?;

    if root_hash != expected_root {
        return Err(HashTreeError::RootMismatch);
    }
    Ok(())
}

fn block_offset(
    geometry: &TreeGeometry,
    hash_offset: u64,
    level: usize,
    index: u64,
) -> Result<u64, HashTreeError> {
    index
        .checked_mul(geometry.hash_block_size)
        .and_then(|rel| rel.checked_add(geometry.level_offset(level).ok()?))
        .and_then(|rel| hash_offset.checked_add(rel))
        .ok_or(HashTreeError::Overflow)
}

/// Stream the data blocks through the tree, handing every finished hash block
/// to `emit` as soon as it fills. Only one block per level is held in memory.
fn compute<R, F>(
    data: &mut R,
    data_offset: u64,
    params: &TreeParams,
    geometry: &TreeGeometry,
    emit: F,
) -> Result<Vec<u8>, HashTreeError>
where
    R: BlockRead + ?Sized,
    F: FnMut(usize, u64, &[u8]) -> Result<(), HashTreeError>,
{
    let data_block_size = u64::from(params.data_block_size);
    let mut levels = LevelWriter::new(params, geometry.level_count(), emit);

    let mut block = vec![0u8; params.data_block_size as usize];
    for index in 0..params.n_data_blocks {
        let offset = index
            .checked_mul(data_block_size)
            .and_then(|rel| data_offset.checked_add(rel))
            .ok_or(HashTreeError::Overflow)?;
        data.read_block_at(offset, &mut block)?;
        let digest = params.algorithm.digest(&params.salt, &block);
        levels.push(0, &digest)?;
    }

    levels.finish()
}

struct PendingBlock {
    buf: Vec<u8>,
    filled: usize,
    index: u64,
}

struct LevelWriter<'a, F> {
    algorithm: DigestAlgorithm,
    salt: &'a [u8],
    pending: Vec<PendingBlock>,
    root: Option<Vec<u8>>,
    emit: F,
}

impl<'a, F> LevelWriter<'a, F>
where
    F: FnMut(usize, u64, &[u8]) -> Result<(), HashTreeError>,
{
    fn new(params: &'a TreeParams, level_count: usize, emit: F) -> Self {
        let block_size = params.hash_block_size as usize;
        Self {
            algorithm: params.algorithm,
            salt: &params.salt,
            pending: (0..level_count)
                .map(|_| PendingBlock {
                    buf: vec![0u8; block_size],
                    filled: 0,
                    index: 0,
                })
                .collect(),
            root: None,
            emit,
        }
    }

    fn push(&mut self, level: usize, digest: &[u8]) -> Result<(), HashTreeError> {
        let pending = &mut self.pending[level];
        pending.buf[pending.filled..pending.filled + digest.len()].copy_from_slice(digest);
        pending.filled += digest.len();
        if pending.filled + digest.len() > pending.buf.len() {
            self.complete(level)?;
        }
        Ok(())
    }

    /// Emit the block of `level` (zero padded) and feed its digest upward.
    fn complete(&mut self, level: usize) -> Result<(), HashTreeError> {
        let pending = &mut self.pending[level];
        (self.emit)(level, pending.index, &pending.buf)?;
        let digest = self.algorithm.digest(self.salt, &pending.buf);
        pending.index += 1;
        pending.filled = 0;
        pending.buf.fill(0);

        if level + 1 < self.pending.len() {
            return self.push(level + 1, &digest);
        }
        if self.root.replace(digest).is_some() {
            return Err(HashTreeError::InvalidParameters(
                "top level holds more than one block".into(),
            ));
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<u8>, HashTreeError> {
        for level in 0..self.pending.len() {
            if self.pending[level].filled > 0 {
                self.complete(level)?;
            }
        }
        self.root
            .ok_or_else(|| HashTreeError::InvalidParameters("tree has no root block".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn params(n_data_blocks: u64, hash_block_size: u32) -> TreeParams {
        TreeParams {
            algorithm: DigestAlgorithm::Sha256,
            n_data_blocks,
            data_block_size: 512,
            hash_block_size,
            salt: b"basalt-salt".to_vec(),
        }
    }

    fn data(blocks: u64) -> Vec<u8> {
        (0..blocks * 512).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn built(params: &TreeParams, data: &[u8]) -> (BuiltTree, Vec<u8>) {
        let mut sink = Cursor::new(Vec::new());
        let tree = build(&mut Cursor::new(data), 0, &mut sink, 0, params).unwrap();
        (tree, sink.into_inner())
    }

    #[test]
    fn level_count_matches_shift_formula() {
        let geometry = TreeGeometry::new(&TreeParams {
            algorithm: DigestAlgorithm::Sha256,
            n_data_blocks: 129,
            data_block_size: 4096,
            hash_block_size: 4096,
            salt: Vec::new(),
        })
        .unwrap();
        assert_eq!(geometry.level_count(), 2);
        assert_eq!(level_count(129, 128), 2);
        assert_eq!(level_count(128, 128), 1);
        assert_eq!(level_count(128 * 128 + 1, 128), 3);
        assert_eq!(geometry.level_blocks(0), Some(2));
        assert_eq!(geometry.level_blocks(1), Some(1));
        assert_eq!(geometry.total_bytes().unwrap(), 3 * 4096);
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(matches!(
            TreeGeometry::new(&params(2, 4096)),
            Err(HashTreeError::InvalidParameters(_))
        ));
        assert!(matches!(
            TreeGeometry::new(&params(10, 4000)),
            Err(HashTreeError::InvalidParameters(_))
        ));
        assert!(matches!(
            TreeGeometry::new(&params(10, 0)),
            Err(HashTreeError::InvalidParameters(_))
        ));
        assert!(matches!(
            DigestAlgorithm::parse("md5"),
            Err(HashTreeError::InvalidAlgorithm(name)) if name == "md5"
        ));
        assert_eq!(DigestAlgorithm::from_name("SHA512"), Some(DigestAlgorithm::Sha512));
    }

    #[test]
    fn offsets_are_overflow_checked() {
        assert!(matches!(
            TreeGeometry::new(&params(u64::MAX, 64)),
            Err(HashTreeError::Overflow)
        ));
        let geometry = TreeGeometry::new(&params(3, 64)).unwrap();
        assert_eq!(geometry.level_offset(1).unwrap(), 128);
    }

    #[test]
    fn build_lays_out_levels_and_root() {
        // 64-byte hash blocks hold two sha256 digests.
        let params = params(5, 64);
        let input = data(5);
        let (tree, bytes) = built(&params, &input);

        assert_eq!(tree.levels, 3);
        assert_eq!(tree.hash_bytes, (3 + 2 + 1) * 64);
        assert_eq!(bytes.len() as u64, tree.hash_bytes);

        let leaf = |i: usize| DigestAlgorithm::Sha256.digest(&params.salt, &input[i * 512..][..512]);
        assert_eq!(&bytes[..32], leaf(0).as_slice());
        assert_eq!(&bytes[32..64], leaf(1).as_slice());
        assert_eq!(&bytes[128..160], leaf(4).as_slice());
        assert!(bytes[160..192].iter().all(|b| *b == 0));

        let top = &bytes[5 * 64..];
        assert_eq!(
            tree.root_hash,
            DigestAlgorithm::Sha256.digest(&params.salt, top)
        );
    }

    #[test]
    fn short_data_is_truncated() {
        let params = params(5, 64);
        let mut sink = Cursor::new(Vec::new());
        let err = build(&mut Cursor::new(data(4)), 0, &mut sink, 0, &params).unwrap_err();
        assert!(matches!(
            err,
            HashTreeError::Truncated {
                offset: 2048,
                expected: 512,
                actual: 0
            }
        ));
    }

    #[test]
    fn verify_accepts_untouched_tree() {
        let params = params(9, 64);
        let input = data(9);
        let (tree, bytes) = built(&params, &input);
        verify(
            &mut Cursor::new(&input),
            0,
            &mut Cursor::new(&bytes),
            0,
            &params,
            &tree.root_hash,
        )
        .unwrap();
    }

    #[test]
    fn any_flipped_bit_fails_verification() {
        let params = params(9, 64);
        let input = data(9);
        let (tree, bytes) = built(&params, &input);

        let mut bad_data = input.clone();
        bad_data[6 * 512 + 100] ^= 0x04;
        let err = verify(
            &mut Cursor::new(&bad_data),
            0,
            &mut Cursor::new(&bytes),
            0,
            &params,
            &tree.root_hash,
        )
        .unwrap_err();
        assert!(matches!(err, HashTreeError::Mismatch { level: 0, block: 3 }));

        // Level 1 starts after five level-0 blocks.
        let mut bad_tree = bytes.clone();
        bad_tree[5 * 64 + 1] ^= 0x80;
        let err = verify(
            &mut Cursor::new(&input),
            0,
            &mut Cursor::new(&bad_tree),
            0,
            &params,
            &tree.root_hash,
        )
        .unwrap_err();
        assert!(matches!(err, HashTreeError::Mismatch { level: 1, block: 0 }));

        let mut bad_root = tree.root_hash.clone();
        bad_root[31] ^= 0x01;
        let err = verify(
            &mut Cursor::new(&input),
            0,
            &mut Cursor::new(&bytes),
            0,
            &params,
            &bad_root,
        )
        .unwrap_err();
        assert!(matches!(err, HashTreeError::RootMismatch));
    }

    #[derive(Default)]
    struct RecordingSink {
        writes: Vec<(u64, usize)>,
    }

    impl BlockWrite for RecordingSink {
        fn write_block_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), HashTreeError> {
            self.writes.push((offset, buf.len()));
            Ok(())
        }
    }

    #[test]
    fn upper_levels_are_written_while_level_zero_streams() {
        // 5 data blocks, two digests per 64-byte block: levels of 3, 2, 1 blocks.
        let params = params(5, 64);
        let mut sink = RecordingSink::default();
        let tree = build(&mut Cursor::new(data(5)), 0, &mut sink, 1000, &params).unwrap();

        assert_eq!(
            sink.writes,
            vec![
                (1000, 64),       // level 0, block 0
                (1064, 64),       // level 0, block 1
                (1000 + 192, 64), // level 1, block 0
                (1128, 64),       // level 0, block 2 (padded)
                (1000 + 256, 64), // level 1, block 1 (padded)
                (1000 + 320, 64), // level 2, root block
            ]
        );
        let (reference, _) = built(&params, &data(5));
        assert_eq!(tree, reference);
    }

    #[test]
    fn data_and_tree_can_share_one_file() {
        let params = params(4, 64);
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0xAA; 100]).unwrap();
        file.write_all(&data(4)).unwrap();

        let hash_offset = 100 + 4 * 512;
        let tree = {
            let (mut reader, mut writer) = (&file, &file);
            build(&mut reader, 100, &mut writer, hash_offset, &params).unwrap()
        };
        let (mut reader, mut stored) = (&file, &file);
        verify(
            &mut reader,
            100,
            &mut stored,
            hash_offset,
            &params,
            &tree.root_hash,
        )
        .unwrap();
    }
}
