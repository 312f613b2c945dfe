//! In-memory device tree fed by uevents and `/sys` enumeration.
//!
//! Devices live in an arena keyed by [`DeviceId`]; subsystems own their
//! devtypes in ordered maps and every devtype owns the ordered list of its
//! devices, newest first. All mutation happens on the event loop thread.

mod sysfd;

#[cfg(test)]
mod tests;

pub use sysfd::{SysfdCallback, SysfdError, SysfdRequest};

use crate::uevent::{Action, Uevent};
use basalt_provider::SubsystemProbe;
use log::{debug, info, warn};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use sysfd::SysfdState;
use thiserror::Error;

/// Handle of a device in the tree. Never reused, so a stale handle simply
/// stops resolving once its device is removed or moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u64);

#[derive(Debug, Error)]
pub enum DeviceError {
    /// Event inconsistent with a settled tree; an event was missed upstream.
    #[error("unexpected {action} for {devpath}")]
    UnexpectedEvent {
        action: &'static str,
        devpath: String,
    },

    /// Event for a devpath the tree has not seen yet while still enumerating.
    #[error("{action} for unknown device {devpath} during enumeration")]
    DependencyUnavailable {
        action: &'static str,
        devpath: String,
    },

    #[error("resource exhausted while {context}: {source}")]
    ResourceExhausted {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot probe subsystem {subsystem}: {source}")]
    Probe {
        subsystem: String,
        #[source]
        source: io::Error,
    },

    #[error("move event for {devpath} carries no old devpath")]
    MissingOldDevpath { devpath: String },
}

impl DeviceError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeviceError::UnexpectedEvent { .. } | DeviceError::ResourceExhausted { .. }
        )
    }
}

/// Variants of CHANGE. ONLINE and OFFLINE carry no policy of their own yet
/// and are handled exactly like CHANGE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Change,
    Online,
    Offline,
}

impl ChangeKind {
    fn action(self) -> &'static str {
        match self {
            ChangeKind::Change => "change",
            ChangeKind::Online => "online",
            ChangeKind::Offline => "offline",
        }
    }
}

/// Outcome of applying one event, for the caller to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeChange {
    Added(DeviceId),
    Changed { id: DeviceId, kind: ChangeKind },
    Removed {
        devpath: String,
        devname: Option<String>,
    },
    Moved { id: DeviceId, devpath_old: String },
}

#[derive(Debug)]
pub struct Device {
    devpath: String,
    subsystem: String,
    devtype: Option<String>,
    devname: Option<String>,
    modalias: Option<String>,
    /// False when the subsystem failed validation: the device is tracked by
    /// devpath but hangs off no devtype.
    exposed: bool,
    sysfd: SysfdState,
}

impl Device {
    pub fn devpath(&self) -> &str {
        &self.devpath
    }

    /// Subsystem name, or `None` when the subsystem did not validate.
    pub fn subsystem(&self) -> Option<&str> {
        self.exposed.then_some(self.subsystem.as_str())
    }

    pub fn devtype(&self) -> Option<&str> {
        self.devtype.as_deref()
    }

    pub fn devname(&self) -> Option<&str> {
        self.devname.as_deref()
    }

    pub fn modalias(&self) -> Option<&str> {
        self.modalias.as_deref()
    }

    pub fn pending_subscribers(&self) -> usize {
        self.sysfd.waiter_count()
    }
}

#[derive(Debug, Default)]
struct Subsystem {
    devtypes: BTreeMap<Option<String>, Devtype>,
}

#[derive(Debug, Default)]
struct Devtype {
    devices: VecDeque<DeviceId>,
}

struct NewDevice<'a> {
    devpath: &'a str,
    subsystem: &'a str,
    devtype: Option<&'a str>,
    devname: Option<&'a str>,
    modalias: Option<&'a str>,
}

pub struct DeviceTree<P> {
    probe: P,
    settled: bool,
    next_id: u64,
    next_token: u64,
    devices: BTreeMap<DeviceId, Device>,
    by_devpath: BTreeMap<String, DeviceId>,
    subsystems: BTreeMap<String, Subsystem>,
    pending_sysfd: BTreeMap<u64, DeviceId>,
    requests: Vec<SysfdRequest>,
}

impl<P: SubsystemProbe> DeviceTree<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            settled: false,
            next_id: 0,
            next_token: 0,
            devices: BTreeMap::new(),
            by_devpath: BTreeMap::new(),
            subsystems: BTreeMap::new(),
            pending_sysfd: BTreeMap::new(),
            requests: Vec::new(),
        }
    }

    /// Initial enumeration is complete; from now on inconsistent events are
    /// protocol violations.
    pub fn settle(&mut self) {
        if !self.settled {
            info!("device tree settled with {} devices", self.devices.len());
        }
        self.settled = true;
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn lookup(&self, devpath: &str) -> Option<DeviceId> {
        self.by_devpath.get(devpath).copied()
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    /// Devices of one devtype, most recently added first.
    pub fn devices_of<'a>(
        &'a self,
        subsystem: &str,
        devtype: Option<&str>,
    ) -> impl Iterator<Item = &'a Device> + 'a {
        self.subsystems
            .get(subsystem)
            .and_then(|sub| sub.devtypes.get(&devtype.map(str::to_string)))
            .into_iter()
            .flat_map(|dt| dt.devices.iter())
            .filter_map(|id| self.devices.get(id))
    }

    /// Names of every subsystem that validated at least once.
    pub fn subsystems(&self) -> impl Iterator<Item = &str> {
        self.subsystems.keys().map(String::as_str)
    }

    /// Dispatch a decoded event to the matching operation.
    pub fn apply(&mut self, event: &Uevent) -> Result<Option<TreeChange>, DeviceError> {
        match event.action {
            Action::Add => self.device_add(event),
            Action::Change => self.device_change(&event.devpath, ChangeKind::Change),
            Action::Online => self.device_change(&event.devpath, ChangeKind::Online),
            Action::Offline => self.device_change(&event.devpath, ChangeKind::Offline),
            Action::Remove => self.device_remove(&event.devpath),
            Action::Move => match &event.devpath_old {
                Some(old) => self.device_move(&event.devpath, old),
                None => Err(DeviceError::MissingOldDevpath {
                    devpath: event.devpath.clone(),
                }),
            },
        }
    }

    pub fn device_add(&mut self, event: &Uevent) -> Result<Option<TreeChange>, DeviceError> {
        if self.by_devpath.contains_key(&event.devpath) {
            if self.settled {
                return Err(DeviceError::UnexpectedEvent {
                    action: "add",
                    devpath: event.devpath.clone(),
                });
            }
            debug!("{} already enumerated; treating add as change", event.devpath);
            return self.device_change(&event.devpath, ChangeKind::Change);
        }

        let id = self.insert(NewDevice {
            devpath: &event.devpath,
            subsystem: &event.subsystem,
            devtype: event.devtype.as_deref(),
            devname: event.devname.as_deref(),
            modalias: event.modalias.as_deref(),
        })?;
        Ok(Some(TreeChange::Added(id)))
    }

    /// CHANGE leaves the attributes fixed at ADD untouched.
    pub fn device_change(
        &mut self,
        devpath: &str,
        kind: ChangeKind,
    ) -> Result<Option<TreeChange>, DeviceError> {
        match self.by_devpath.get(devpath) {
            Some(&id) => Ok(Some(TreeChange::Changed { id, kind })),
            None if self.settled => Err(DeviceError::UnexpectedEvent {
                action: kind.action(),
                devpath: devpath.to_string(),
            }),
            None => Err(DeviceError::DependencyUnavailable {
                action: kind.action(),
                devpath: devpath.to_string(),
            }),
        }
    }

    pub fn device_remove(&mut self, devpath: &str) -> Result<Option<TreeChange>, DeviceError> {
        let Some(mut device) = self.detach(devpath, "remove")? else {
            return Ok(None);
        };
        sysfd::fail_all(device.sysfd.take_waiters(), SysfdError::Gone);
        Ok(Some(TreeChange::Removed {
            devpath: device.devpath,
            devname: device.devname,
        }))
    }

    /// Relocate the device at `devpath_old` to `devpath`, keeping its
    /// attributes and pending sysfd subscribers.
    pub fn device_move(
        &mut self,
        devpath: &str,
        devpath_old: &str,
    ) -> Result<Option<TreeChange>, DeviceError> {
        if self.by_devpath.contains_key(devpath) {
            if self.settled {
                return Err(DeviceError::UnexpectedEvent {
                    action: "move",
                    devpath: devpath.to_string(),
                });
            }
            // Enumeration already found the new path; drop the stale entry.
            debug!("{devpath} already enumerated; dropping {devpath_old}");
            self.device_remove(devpath_old)?;
            return self.device_change(devpath, ChangeKind::Change);
        }

        let Some(mut device) = self.detach(devpath_old, "move")? else {
            return Ok(None);
        };
        let waiters = device.sysfd.take_waiters();

        let inserted = self.insert(NewDevice {
            devpath,
            subsystem: &device.subsystem,
            devtype: device.devtype.as_deref(),
            devname: device.devname.as_deref(),
            modalias: device.modalias.as_deref(),
        });
        let id = match inserted {
            Ok(id) => id,
            Err(err) => {
                sysfd::fail_all(waiters, SysfdError::Gone);
                return Err(err);
            }
        };

        if !waiters.is_empty() {
            // Oldest subscriber goes back in first so the order survives.
            for waiter in waiters.into_iter().rev() {
                self.subscribe(id, waiter);
            }
        }

        Ok(Some(TreeChange::Moved {
            id,
            devpath_old: devpath_old.to_string(),
        }))
    }

    /// Run `callback` with the device's directory handle once it is open.
    ///
    /// The first subscriber queues a [`SysfdRequest`]; later ones join the
    /// pending list. A callback for a device that no longer exists fires
    /// immediately with [`SysfdError::Gone`].
    pub fn device_call_with_sysfd<F>(&mut self, id: DeviceId, callback: F)
    where
        F: FnOnce(Result<BorrowedFd<'_>, SysfdError>) + 'static,
    {
        self.subscribe(id, Box::new(callback));
    }

    /// Drain the directory opens queued since the last call.
    pub fn take_sysfd_requests(&mut self) -> Vec<SysfdRequest> {
        std::mem::take(&mut self.requests)
    }

    /// Deliver the outcome of a [`SysfdRequest`].
    ///
    /// Every pending subscriber fires once, most recent first, then the
    /// handle is closed. Tokens of removed or moved devices are ignored.
    /// Returns the number of callbacks fired.
    pub fn sysfd_ready(
        &mut self,
        token: u64,
        opened: io::Result<OwnedFd>,
    ) -> Result<usize, DeviceError> {
        let Some(id) = self.pending_sysfd.remove(&token) else {
            debug!("ignoring stale sysfd token {token}");
            return Ok(0);
        };
        let Some(device) = self.devices.get_mut(&id) else {
            return Ok(0);
        };
        if device.sysfd.token() != Some(token) {
            return Ok(0);
        }
        let devpath = device.devpath.clone();
        let waiters = device.sysfd.take_waiters();
        let fired = waiters.len();

        match opened {
            Ok(fd) => {
                for waiter in waiters {
                    waiter(Ok(fd.as_fd()));
                }
            }
            Err(err) => {
                warn!("cannot open /sys/devices/{devpath}: {err}");
                sysfd::fail_all(waiters, SysfdError::Open(err.to_string()));
                if sysfd::is_exhaustion(&err) {
                    return Err(DeviceError::ResourceExhausted {
                        context: format!("opening /sys/devices/{devpath}"),
                        source: err,
                    });
                }
            }
        }
        Ok(fired)
    }

    fn subscribe(&mut self, id: DeviceId, callback: SysfdCallback) {
        let Some(device) = self.devices.get_mut(&id) else {
            callback(Err(SysfdError::Gone));
            return;
        };
        if let SysfdState::Opening { waiters, .. } = &mut device.sysfd {
            waiters.push(callback);
            return;
        }

        let token = self.next_token;
        self.next_token += 1;
        device.sysfd = SysfdState::Opening {
            token,
            waiters: vec![callback],
        };
        self.pending_sysfd.insert(token, id);
        self.requests.push(SysfdRequest {
            token,
            devpath: device.devpath.clone(),
        });
    }

    fn insert(&mut self, new: NewDevice<'_>) -> Result<DeviceId, DeviceError> {
        let id = DeviceId(self.next_id);
        let exposed = self.link(id, new.subsystem, new.devtype)?;
        self.next_id += 1;

        self.by_devpath.insert(new.devpath.to_string(), id);
        self.devices.insert(
            id,
            Device {
                devpath: new.devpath.to_string(),
                subsystem: new.subsystem.to_string(),
                devtype: new.devtype.map(str::to_string),
                devname: new.devname.map(str::to_string),
                modalias: new.modalias.map(str::to_string),
                exposed,
                sysfd: SysfdState::Unopened,
            },
        );
        Ok(id)
    }

    /// Prepend `id` to its devtype list. Known subsystems are trusted;
    /// unknown ones are probed on every call, so a subsystem that was
    /// missing once is not remembered as missing.
    fn link(
        &mut self,
        id: DeviceId,
        subsystem: &str,
        devtype: Option<&str>,
    ) -> Result<bool, DeviceError> {
        if !self.subsystems.contains_key(subsystem) {
            let exists = self
                .probe
                .subsystem_exists(subsystem)
                .map_err(|source| {
                    if sysfd::is_exhaustion(&source) {
                        DeviceError::ResourceExhausted {
                            context: format!("probing subsystem {subsystem}"),
                            source,
                        }
                    } else {
                        DeviceError::Probe {
                            subsystem: subsystem.to_string(),
                            source,
                        }
                    }
                })?;
            if !exists {
                debug!("subsystem {subsystem} does not exist; device not exposed");
                return Ok(false);
            }
        }

        self.subsystems
            .entry(subsystem.to_string())
            .or_default()
            .devtypes
            .entry(devtype.map(str::to_string))
            .or_default()
            .devices
            .push_front(id);
        Ok(true)
    }

    fn detach(
        &mut self,
        devpath: &str,
        action: &'static str,
    ) -> Result<Option<Device>, DeviceError> {
        let Some(id) = self.by_devpath.remove(devpath) else {
            if self.settled {
                return Err(DeviceError::UnexpectedEvent {
                    action,
                    devpath: devpath.to_string(),
                });
            }
            debug!("{action} for unknown {devpath} during enumeration");
            return Ok(None);
        };
        let Some(device) = self.devices.remove(&id) else {
            return Ok(None);
        };
        if let Some(token) = device.sysfd.token() {
            self.pending_sysfd.remove(&token);
        }
        if device.exposed {
            self.unlink(id, &device);
        }
        Ok(Some(device))
    }

    /// Drop `id` from its devtype list, freeing the devtype once empty.
    fn unlink(&mut self, id: DeviceId, device: &Device) {
        let Some(subsystem) = self.subsystems.get_mut(&device.subsystem) else {
            return;
        };
        let Some(devtype) = subsystem.devtypes.get_mut(&device.devtype) else {
            return;
        };
        devtype.devices.retain(|member| *member != id);
        if devtype.devices.is_empty() {
            if let Some(freed) = subsystem.devtypes.remove(&device.devtype) {
                assert!(freed.devices.is_empty(), "freed a devtype with devices");
            }
        }
    }
}
