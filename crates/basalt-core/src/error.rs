//! Error taxonomy shared by the basalt crates.

use crate::devtree::DeviceError;
use crate::image::hashtree::HashTreeError;
use crate::image::header::HeaderError;
use crate::image::keywrap::KeyWrapError;
use crate::uevent::UeventError;
use std::path::PathBuf;
use thiserror::Error;

pub type BasaltResult<T> = Result<T, BasaltError>;

#[derive(Debug, Error)]
pub enum BasaltError {
    /// Malformed uevent input; drop the datagram and keep going.
    #[error("uevent decode failed: {0}")]
    Decode(#[from] UeventError),

    /// Header did not match the expected format; try the next format.
    #[error("header validation failed: {0}")]
    Validation(#[from] HeaderError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("key wrap failed: {0}")]
    Crypto(#[from] KeyWrapError),

    #[error("hash tree: {0}")]
    HashTree(#[from] HashTreeError),

    #[error("cannot unlock volume: {0}")]
    Unlock(String),

    #[error("{path} is neither a signed image ({signed}) nor an encrypted volume ({encrypted})")]
    NotAnImage {
        path: PathBuf,
        signed: String,
        encrypted: String,
    },

    #[error("invalid hex key material in {path}: {reason}")]
    InvalidHexKey { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BasaltError {
    /// Protocol violations and resource exhaustion end the device daemon; a
    /// tree that missed an event is not trusted any further.
    pub fn is_fatal(&self) -> bool {
        match self {
            BasaltError::Device(err) => err.is_fatal(),
            _ => false,
        }
    }
}
