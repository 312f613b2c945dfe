//! Disk image toolchain: hash trees, key wrapping, header codecs, and the
//! service that formats and activates images with them.

pub mod hashtree;
pub mod header;
pub mod info;
pub mod keywrap;
pub mod service;
pub mod slots;

#[cfg(test)]
mod tests;

pub use info::{ImageInfo, ImageKind};
pub use service::{mapping_name, DiskImageService};
pub use slots::UnlockMethod;
