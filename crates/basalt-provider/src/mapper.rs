//! Provider contract for device-mapper backed volumes.
//!
//! The image service resolves key and hash material, renders it into a target
//! description, and hands it to a `MapperProvider`. How the table reaches the
//! kernel (dmsetup, raw ioctls) is the provider's business.

use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const SECTOR_SIZE: u64 = 512;

/// Which device-mapper target backs a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    Verity,
    Crypt,
}

/// Descriptor for an active mapping returned by `setup`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingDescriptor {
    /// Logical mapping name (e.g. `basalt-0f1e...`).
    pub name: String,
    /// Kernel block device node, `/dev/dm-N`.
    pub device: PathBuf,
    pub kind: MappingKind,
    pub read_only: bool,
}

/// Loop device attachment options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopOptions {
    pub read_only: bool,
    /// Byte offset into the backing file.
    pub offset: u64,
    /// Maximum number of bytes exposed, starting at `offset`.
    pub size_limit: Option<u64>,
}

/// Discard strength requested by the formatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardMode {
    Secure,
    Plain,
}

/// Parameters of a `crypt` target.
pub struct CryptTarget {
    /// Length of the mapping in 512-byte sectors.
    pub sectors: u64,
    /// Kernel cipher specification, e.g. `aes-xts-plain64`.
    pub cipher_spec: String,
    pub key: Zeroizing<Vec<u8>>,
    pub device: PathBuf,
    /// Start of the encrypted payload on `device`, in sectors.
    pub offset_sectors: u64,
}

impl CryptTarget {
    /// Render the single-line table. Contains key material.
    pub fn table(&self) -> Zeroizing<String> {
        Zeroizing::new(format!(
            "0 {} crypt {} {} 0 {} {}",
            self.sectors,
            self.cipher_spec,
            hex::encode(&self.key[..]),
            self.device.display(),
            self.offset_sectors
        ))
    }
}

impl fmt::Debug for CryptTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptTarget")
            .field("sectors", &self.sectors)
            .field("cipher_spec", &self.cipher_spec)
            .field("key", &"<redacted>")
            .field("device", &self.device)
            .field("offset_sectors", &self.offset_sectors)
            .finish()
    }
}

/// Parameters of a `verity` target (format version 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityTarget {
    pub data_device: PathBuf,
    pub hash_device: PathBuf,
    pub data_block_size: u64,
    pub hash_block_size: u64,
    pub data_blocks: u64,
    /// First hash block on `hash_device`, in units of `hash_block_size`.
    pub hash_start_block: u64,
    pub algorithm: String,
    pub root_hash: Vec<u8>,
    pub salt: Vec<u8>,
}

impl VerityTarget {
    pub fn sectors(&self) -> u64 {
        self.data_blocks * self.data_block_size / SECTOR_SIZE
    }

    pub fn table(&self) -> String {
        let salt = if self.salt.is_empty() {
            "-".to_string()
        } else {
            hex::encode(&self.salt)
        };
        format!(
            "0 {} verity 1 {} {} {} {} {} {} {} {} {}",
            self.sectors(),
            self.data_device.display(),
            self.hash_device.display(),
            self.data_block_size,
            self.hash_block_size,
            self.data_blocks,
            self.hash_start_block,
            self.algorithm,
            hex::encode(&self.root_hash),
            salt
        )
    }
}

/// Abstraction over the block-device plumbing the image service needs.
pub trait MapperProvider {
    type Error: Error + Send + Sync + 'static;

    /// Attach `file` to a free loop device and return its node.
    fn attach_loop(&self, file: &Path, options: LoopOptions) -> Result<PathBuf, Self::Error>;

    /// Release a loop device obtained from `attach_loop`.
    fn detach_loop(&self, device: &Path) -> Result<(), Self::Error>;

    /// Create and activate a read-only verity mapping.
    fn create_verity(
        &self,
        name: &str,
        target: &VerityTarget,
    ) -> Result<MappingDescriptor, Self::Error>;

    /// Create and activate a read-write crypt mapping.
    fn create_crypt(&self, name: &str, target: &CryptTarget)
        -> Result<MappingDescriptor, Self::Error>;

    /// Discard every block of `device`.
    fn discard(&self, device: &Path, mode: DiscardMode) -> Result<(), Self::Error>;
}
