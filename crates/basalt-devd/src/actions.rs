//! Host-side implementations of the device provider traits.

use basalt_provider::{DeviceNode, ModuleLoader, NodePermissions, SubsystemProbe};
use log::{debug, info, warn};
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tokio::runtime::Handle;

/// Checks `/sys/bus/<name>` and `/sys/class/<name>`.
#[derive(Debug, Clone)]
pub(crate) struct SysfsProbe {
    sysfs_root: PathBuf,
}

impl SysfsProbe {
    pub(crate) fn new(sysfs_root: PathBuf) -> Self {
        Self { sysfs_root }
    }
}

impl SubsystemProbe for SysfsProbe {
    fn subsystem_exists(&self, name: &str) -> io::Result<bool> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Ok(false);
        }
        for hierarchy in ["bus", "class"] {
            match fs::symlink_metadata(self.sysfs_root.join(hierarchy).join(name)) {
                Ok(_) => return Ok(true),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    }
}

/// Runs `modprobe -b -q <alias>` on the blocking pool without awaiting it.
#[derive(Debug, Clone)]
pub(crate) struct ModprobeLoader {
    binary: Option<PathBuf>,
    runtime: Handle,
}

impl ModprobeLoader {
    pub(crate) fn new(binary: Option<PathBuf>, runtime: Handle) -> Self {
        if binary.is_none() {
            warn!("modprobe not found; modalias loading disabled");
        }
        Self { binary, runtime }
    }
}

impl ModuleLoader for ModprobeLoader {
    fn spawn_load_detached(&self, alias: &str) {
        let Some(binary) = self.binary.clone() else {
            debug!("no modprobe; not loading {alias}");
            return;
        };
        let alias = alias.to_string();
        // Dropping the JoinHandle detaches the task.
        drop(self.runtime.spawn_blocking(move || {
            let status = Command::new(&binary)
                .args(["-b", "-q", "--", alias.as_str()])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match status {
                Ok(status) if status.success() => debug!("loaded module for {alias}"),
                Ok(status) => debug!("modprobe {alias} exited with {status}"),
                Err(err) => warn!("failed to run {}: {err}", binary.display()),
            }
        }));
    }
}

/// Applies a fixed mode to device nodes under the dev root.
#[derive(Debug, Clone)]
pub(crate) struct ModePermissions {
    dev_root: PathBuf,
    mode: u32,
}

impl ModePermissions {
    pub(crate) fn new(dev_root: PathBuf, mode: u32) -> Self {
        Self { dev_root, mode }
    }
}

impl NodePermissions for ModePermissions {
    type Error = io::Error;

    fn apply(&self, node: &DeviceNode) -> io::Result<()> {
        let path = node_path(&self.dev_root, &node.devname)?;
        let meta = fs::symlink_metadata(&path)?;
        let file_type = meta.file_type();
        if !file_type.is_block_device() && !file_type.is_char_device() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a device node", path.display()),
            ));
        }
        if let Some(expected) = node.dev {
            let actual = split_dev(meta.rdev());
            if actual != expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "{} is {}:{}, expected {}:{}",
                        path.display(),
                        actual.0,
                        actual.1,
                        expected.0,
                        expected.1
                    ),
                ));
            }
        }
        fs::set_permissions(&path, fs::Permissions::from_mode(self.mode))?;
        info!("{} mode {:o}", path.display(), self.mode);
        Ok(())
    }
}

fn node_path(dev_root: &Path, devname: &str) -> io::Result<PathBuf> {
    if devname.is_empty() || devname.split('/').any(|part| part == "..") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing device name `{devname}`"),
        ));
    }
    Ok(dev_root.join(devname.trim_start_matches('/')))
}

/// Read the `dev` attribute of the device directory behind `sysfd`.
pub(crate) fn read_dev_number(sysfd: BorrowedFd<'_>) -> io::Result<Option<(u32, u32)>> {
    let path = format!("/proc/self/fd/{}/dev", sysfd.as_raw_fd());
    match fs::read_to_string(path) {
        Ok(contents) => parse_dev(&contents).map(Some),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn parse_dev(contents: &str) -> io::Result<(u32, u32)> {
    let invalid = || {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed dev attribute `{}`", contents.trim()),
        )
    };
    let (major, minor) = contents.trim().split_once(':').ok_or_else(invalid)?;
    Ok((
        major.parse().map_err(|_| invalid())?,
        minor.parse().map_err(|_| invalid())?,
    ))
}

/// Split a Linux `dev_t` into major and minor numbers.
fn split_dev(dev: u64) -> (u32, u32) {
    let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff);
    let minor = (dev & 0xff) | ((dev >> 12) & !0xff);
    (major as u32, minor as u32)
}
