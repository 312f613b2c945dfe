#![forbid(unsafe_code)]

//! System provider for device-mapper backed images.
//!
//! Integrates with the host via:
//! - `losetup` (attach/detach with offset and size limit)
//! - `dmsetup` (create verity and crypt mappings, resolve `/dev/dm-N`)
//! - `blkdiscard` (secure or plain discard before formatting)

mod command;
mod system;

pub use system::SystemMapper;
