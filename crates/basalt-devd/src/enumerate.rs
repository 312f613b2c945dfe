//! Coldplug: synthesise ADD events for devices already present in `/sys`.

use basalt_core::uevent::{self, Uevent, UeventProperties};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Scan `/sys/bus/*/devices/*` and `/sys/class/*/*`.
///
/// Entries are deduplicated by canonical devpath and returned in devpath
/// order, which puts every parent before its children.
pub(crate) fn scan(sysfs_root: &Path) -> io::Result<Vec<Uevent>> {
    let root = fs::canonicalize(sysfs_root)?;
    let mut found: BTreeMap<String, Uevent> = BTreeMap::new();

    for bus in list_dir(&root.join("bus"))? {
        scan_dir(&root, &bus.join("devices"), bus_name(&bus), &mut found)?;
    }
    for class in list_dir(&root.join("class"))? {
        scan_dir(&root, &class, bus_name(&class), &mut found)?;
    }

    debug!("enumerated {} devices under {}", found.len(), root.display());
    Ok(found.into_values().collect())
}

fn bus_name(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn scan_dir(
    root: &Path,
    dir: &Path,
    fallback_subsystem: String,
    found: &mut BTreeMap<String, Uevent>,
) -> io::Result<()> {
    for entry in list_dir(dir)? {
        let canonical = match fs::canonicalize(&entry) {
            Ok(path) => path,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        let Some(devpath) = devpath_of(root, &canonical) else {
            debug!("skipping {}: outside the devices root", entry.display());
            continue;
        };
        if found.contains_key(&devpath) {
            continue;
        }

        let properties = match fs::read_to_string(canonical.join("uevent")) {
            Ok(contents) => match uevent::parse_uevent_file(&contents) {
                Ok(properties) => properties,
                Err(err) => {
                    warn!("ignoring malformed {}/uevent: {err}", canonical.display());
                    continue;
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => UeventProperties::default(),
            Err(err) => return Err(err),
        };
        let subsystem = subsystem_of(&canonical).unwrap_or_else(|| fallback_subsystem.clone());

        let event = Uevent::synthetic_add(&devpath, &subsystem, properties);
        found.insert(devpath, event);
    }
    Ok(())
}

fn devpath_of(root: &Path, canonical: &Path) -> Option<String> {
    let relative = canonical.strip_prefix(root).ok()?;
    let absolute = format!("/{}", relative.to_str()?);
    uevent::strip_devices_root(&absolute).ok()
}

/// The `subsystem` link names the authoritative subsystem.
fn subsystem_of(device_dir: &Path) -> Option<String> {
    let target = fs::read_link(device_dir.join("subsystem")).ok()?;
    target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

fn list_dir(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut paths = Vec::new();
    for entry in entries {
        paths.push(entry?.path());
    }
    paths.sort();
    Ok(paths)
}
