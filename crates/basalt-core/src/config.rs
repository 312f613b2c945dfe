//! Configuration model and helpers used by basalt services.

use crate::error::{BasaltError, BasaltResult};
use crate::image::hashtree::DigestAlgorithm;
use crate::image::header::MAX_KEY_SLOTS;
use log::warn;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/basalt.toml";
pub const CONFIG_PATH_ENV: &str = "BASALT_CONFIG";

pub(crate) const KNOWN_MODPROBE_PATHS: &[&str] = &[
    "/usr/sbin/modprobe",
    "/sbin/modprobe",
    "/usr/bin/modprobe",
    "/bin/modprobe",
];
pub(crate) const KNOWN_DMSETUP_PATHS: &[&str] = &[
    "/usr/sbin/dmsetup",
    "/sbin/dmsetup",
    "/usr/bin/dmsetup",
    "/bin/dmsetup",
];
pub(crate) const KNOWN_LOSETUP_PATHS: &[&str] = &[
    "/usr/sbin/losetup",
    "/sbin/losetup",
    "/usr/bin/losetup",
    "/bin/losetup",
];
pub(crate) const KNOWN_BLKDISCARD_PATHS: &[&str] = &[
    "/usr/sbin/blkdiscard",
    "/sbin/blkdiscard",
    "/usr/bin/blkdiscard",
    "/bin/blkdiscard",
];

/// Where the device daemon finds the kernel's view of the world.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DevicesCfg {
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: String,

    #[serde(default = "default_dev_root")]
    pub dev_root: String,

    #[serde(default)]
    pub modprobe_path: Option<String>,

    #[serde(default = "default_node_mode")]
    pub node_mode: u32,
}

fn default_sysfs_root() -> String {
    "/sys".to_string()
}

fn default_dev_root() -> String {
    "/dev".to_string()
}

fn default_node_mode() -> u32 {
    0o600
}

impl Default for DevicesCfg {
    fn default() -> Self {
        Self {
            sysfs_root: default_sysfs_root(),
            dev_root: default_dev_root(),
            modprobe_path: None,
            node_mode: default_node_mode(),
        }
    }
}

/// Geometry and algorithms used when formatting images and volumes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ImageCfg {
    #[serde(default = "default_block_size")]
    pub data_block_size: u64,

    #[serde(default = "default_block_size")]
    pub hash_block_size: u64,

    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: String,

    #[serde(default = "default_salt_size")]
    pub salt_size: usize,

    #[serde(default = "default_signature_size")]
    pub signature_size: u64,

    #[serde(default = "default_signature_type")]
    pub signature_type: String,

    #[serde(default = "default_cipher")]
    pub cipher: String,

    #[serde(default = "default_chain_mode")]
    pub chain_mode: String,

    #[serde(default = "default_iv_mode")]
    pub iv_mode: String,

    #[serde(default = "default_master_key_bits")]
    pub master_key_bits: u64,

    #[serde(default = "default_key_slots")]
    pub key_slots: u64,

    #[serde(default = "default_password_iterations")]
    pub password_iterations: u32,
}

fn default_block_size() -> u64 {
    4096
}

fn default_hash_algorithm() -> String {
    "sha256".to_string()
}

fn default_salt_size() -> usize {
    32
}

fn default_signature_size() -> u64 {
    4096
}

fn default_signature_type() -> String {
    "pkcs7".to_string()
}

fn default_cipher() -> String {
    "aes".to_string()
}

fn default_chain_mode() -> String {
    "xts".to_string()
}

fn default_iv_mode() -> String {
    "plain64".to_string()
}

fn default_master_key_bits() -> u64 {
    512
}

fn default_key_slots() -> u64 {
    8
}

fn default_password_iterations() -> u32 {
    250_000
}

impl Default for ImageCfg {
    fn default() -> Self {
        Self {
            data_block_size: default_block_size(),
            hash_block_size: default_block_size(),
            hash_algorithm: default_hash_algorithm(),
            salt_size: default_salt_size(),
            signature_size: default_signature_size(),
            signature_type: default_signature_type(),
            cipher: default_cipher(),
            chain_mode: default_chain_mode(),
            iv_mode: default_iv_mode(),
            master_key_bits: default_master_key_bits(),
            key_slots: default_key_slots(),
            password_iterations: default_password_iterations(),
        }
    }
}

/// Paths and timeouts for the block-device tooling.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MapperCfg {
    #[serde(default)]
    pub dmsetup_path: Option<String>,

    #[serde(default)]
    pub losetup_path: Option<String>,

    #[serde(default)]
    pub blkdiscard_path: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for MapperCfg {
    fn default() -> Self {
        Self {
            dmsetup_path: None,
            losetup_path: None,
            blkdiscard_path: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct BasaltConfig {
    #[serde(default)]
    pub devices: DevicesCfg,

    #[serde(default)]
    pub image: ImageCfg,

    #[serde(default)]
    pub mapper: MapperCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl ConfigFormat {
    /// `.toml` files are TOML; anything else is read as YAML.
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Yaml,
        }
    }
}

impl BasaltConfig {
    /// Resolve the configuration path: `BASALT_CONFIG` wins over the default.
    pub fn resolve_path() -> PathBuf {
        env::var_os(CONFIG_PATH_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load `path`, falling back to built-in defaults when it does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> BasaltResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        warn!(
            "configuration missing at {}; using built-in defaults",
            target.display()
        );
        Ok(Self {
            path: target.to_path_buf(),
            format: ConfigFormat::for_path(target),
            ..Self::default()
        })
    }

    /// Read a config file from disk, detect format, and validate basics.
    pub fn load<P: AsRef<Path>>(path: P) -> BasaltResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let format = ConfigFormat::for_path(path);
        let mut cfg = match format {
            ConfigFormat::Toml => toml::from_str::<Self>(&contents)?,
            ConfigFormat::Yaml => serde_yaml::from_str::<Self>(&contents)?,
        };
        cfg.path = path.to_path_buf();
        cfg.format = format;

        let issues = cfg.validate();
        if !issues.is_empty() {
            return Err(BasaltError::InvalidConfig(issues.join("; ")));
        }

        Ok(cfg)
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let image = &self.image;

        for (field, value) in [
            ("image.data_block_size", image.data_block_size),
            ("image.hash_block_size", image.hash_block_size),
        ] {
            if value < 512 || !value.is_power_of_two() {
                issues.push(format!(
                    "{field} must be a power of two of at least 512 (got {value})"
                ));
            }
        }

        match DigestAlgorithm::from_name(&image.hash_algorithm) {
            Some(algorithm) => {
                if image.hash_block_size % algorithm.size() as u64 != 0 {
                    issues.push(format!(
                        "image.hash_block_size {} is not a multiple of the {} digest size",
                        image.hash_block_size, image.hash_algorithm
                    ));
                }
            }
            None => issues.push(format!(
                "image.hash_algorithm `{}` is not supported",
                image.hash_algorithm
            )),
        }

        if image.salt_size == 0 || image.salt_size > 256 {
            issues.push("image.salt_size must be between 1 and 256".to_string());
        }
        if image.signature_size % 4096 != 0 {
            issues.push("image.signature_size must be a multiple of 4096".to_string());
        }
        // The wrapped key (bits / 8 + 8 bytes) must fit the 256-byte header field.
        if !(128..=1984).contains(&image.master_key_bits) || image.master_key_bits % 64 != 0 {
            issues.push(
                "image.master_key_bits must be a multiple of 64 between 128 and 1984".to_string(),
            );
        }
        if image.key_slots < 2 || image.key_slots > MAX_KEY_SLOTS {
            issues.push(format!(
                "image.key_slots must be between 2 and {MAX_KEY_SLOTS} (clear and recovery slots are required)"
            ));
        }
        if image.password_iterations == 0 {
            issues.push("image.password_iterations must be at least 1".to_string());
        }
        if self.mapper.timeout_secs == 0 {
            issues.push("mapper.timeout_secs must be greater than 0".to_string());
        }
        if self.devices.node_mode > 0o7777 {
            issues.push(format!(
                "devices.node_mode {:o} is not a valid permission mode",
                self.devices.node_mode
            ));
        }

        issues
    }

    pub fn sysfs_root(&self) -> PathBuf {
        PathBuf::from(&self.devices.sysfs_root)
    }

    pub fn dev_root(&self) -> PathBuf {
        PathBuf::from(&self.devices.dev_root)
    }

    /// Translate the stored timeout into a `Duration`.
    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.mapper.timeout_secs)
    }

    pub fn modprobe_binary(&self) -> Option<PathBuf> {
        resolve_binary(self.devices.modprobe_path.as_deref(), KNOWN_MODPROBE_PATHS, "modprobe")
    }

    pub fn dmsetup_binary(&self) -> Option<PathBuf> {
        resolve_binary(self.mapper.dmsetup_path.as_deref(), KNOWN_DMSETUP_PATHS, "dmsetup")
    }

    pub fn losetup_binary(&self) -> Option<PathBuf> {
        resolve_binary(self.mapper.losetup_path.as_deref(), KNOWN_LOSETUP_PATHS, "losetup")
    }

    pub fn blkdiscard_binary(&self) -> Option<PathBuf> {
        resolve_binary(
            self.mapper.blkdiscard_path.as_deref(),
            KNOWN_BLKDISCARD_PATHS,
            "blkdiscard",
        )
    }

    /// Persist the configuration back to its original on-disk format.
    pub fn save(&self) -> BasaltResult<()> {
        let payload = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
        };
        fs::write(&self.path, payload)?;
        Ok(())
    }
}

/// Configured override first, then well-known locations, then `PATH`.
fn resolve_binary(configured: Option<&str>, candidates: &[&str], name: &str) -> Option<PathBuf> {
    if let Some(path) = configured.map(str::trim).filter(|path| !path.is_empty()) {
        return Some(PathBuf::from(path));
    }

    candidates
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
        .or_else(|| find_in_path(name))
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.exists() {
            Some(candidate)
        } else {
            None
        }
    })
}
