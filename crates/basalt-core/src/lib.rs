//! Core building blocks shared by the basalt binaries.
//!
//! Two engines live here: the device tree fed by kernel uevents, and the disk
//! image toolchain (hash trees, key wrapping, header codecs) behind `diskctl`.
//! Host integration is reached only through the `basalt-provider` traits.

pub mod config;
pub mod devtree;
pub mod error;
pub mod image;
pub mod keyfile;
pub mod logging;
pub mod uevent;

pub use config::{BasaltConfig, ConfigFormat, DevicesCfg, ImageCfg, MapperCfg};
pub use devtree::{
    ChangeKind, Device, DeviceError, DeviceId, DeviceTree, SysfdError, SysfdRequest, TreeChange,
};
pub use error::{BasaltError, BasaltResult};
pub use image::{DiskImageService, ImageInfo, UnlockMethod};
pub use uevent::{Action, Uevent, UeventError};
