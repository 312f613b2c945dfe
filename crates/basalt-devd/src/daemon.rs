//! Event dispatch: uevents into the device tree, tree transitions into host
//! actions.

use crate::actions;
use crate::netlink::Datagram;
use basalt_core::uevent::{self, Uevent};
use basalt_core::{DeviceError, DeviceTree, TreeChange};
use basalt_provider::{DeviceNode, ModuleLoader, NodePermissions, SubsystemProbe};
use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::rc::Rc;

pub(crate) struct Daemon<P, L, N> {
    tree: DeviceTree<P>,
    loader: L,
    permissions: Rc<N>,
    sysfs_root: PathBuf,
    last_seqnum: Option<u64>,
}

impl<P, L, N> Daemon<P, L, N>
where
    P: SubsystemProbe,
    L: ModuleLoader,
    N: NodePermissions + 'static,
{
    pub(crate) fn new(probe: P, loader: L, permissions: N, sysfs_root: PathBuf) -> Self {
        Self {
            tree: DeviceTree::new(probe),
            loader,
            permissions: Rc::new(permissions),
            sysfs_root,
            last_seqnum: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn tree(&self) -> &DeviceTree<P> {
        &self.tree
    }

    #[cfg(test)]
    pub(crate) fn tree_mut(&mut self) -> &mut DeviceTree<P> {
        &mut self.tree
    }

    /// Apply the `/sys` scan, then switch the tree to settled.
    pub(crate) fn coldplug(&mut self, events: &[Uevent]) -> Result<(), DeviceError> {
        for event in events {
            self.handle_event(event)?;
        }
        self.tree.settle();
        info!("coldplug complete: {} devices", self.tree.len());
        Ok(())
    }

    /// Validate, decode and apply one netlink datagram. Undecodable or
    /// spoofed datagrams are dropped; only fatal tree errors are returned.
    pub(crate) fn handle_datagram(&mut self, datagram: &Datagram) -> Result<(), DeviceError> {
        if let Err(err) = uevent::validate_sender(
            datagram.port,
            datagram.groups,
            datagram.credentials.as_ref(),
        ) {
            warn!("dropping uevent datagram: {err}");
            return Ok(());
        }

        let event = match uevent::decode_kernel(&datagram.payload) {
            Ok(event) => event,
            Err(err) if err.is_skip() => {
                debug!("skipping uevent: {err}");
                return Ok(());
            }
            Err(err) => {
                warn!("dropping malformed uevent: {err}");
                return Ok(());
            }
        };

        if let Some(last) = self.last_seqnum {
            if event.seqnum > last + 1 {
                debug!("uevent seqnum jumped from {last} to {}", event.seqnum);
            }
        }
        self.last_seqnum = Some(event.seqnum);
        self.handle_event(&event)
    }

    pub(crate) fn handle_event(&mut self, event: &Uevent) -> Result<(), DeviceError> {
        match self.tree.apply(event) {
            Ok(Some(change)) => self.react(change),
            Ok(None) => debug!("{} {}: nothing to do", event.action, event.devpath),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => warn!("{err}"),
        }
        self.service_sysfd()
    }

    fn react(&mut self, change: TreeChange) {
        match change {
            TreeChange::Added(id) => {
                let Some(device) = self.tree.device(id) else {
                    return;
                };
                debug!("added {}", device.devpath());
                if let Some(alias) = device.modalias() {
                    self.loader.spawn_load_detached(alias);
                }
                let Some(devname) = device.devname() else {
                    return;
                };
                let node = DeviceNode {
                    devname: devname.to_string(),
                    subsystem: device.subsystem().map(str::to_string),
                    devtype: device.devtype().map(str::to_string),
                    dev: None,
                };
                let permissions = Rc::clone(&self.permissions);
                self.tree.device_call_with_sysfd(id, move |sysfd| {
                    let mut node = node;
                    match sysfd {
                        Ok(fd) => match actions::read_dev_number(fd) {
                            Ok(dev) => node.dev = dev,
                            Err(err) => {
                                warn!("cannot read dev of {}: {err}", node.devname);
                                return;
                            }
                        },
                        Err(err) => {
                            debug!("{} went away before its node was ready: {err}", node.devname);
                            return;
                        }
                    }
                    if let Err(err) = permissions.apply(&node) {
                        warn!("cannot apply permissions to {}: {err}", node.devname);
                    }
                });
            }
            TreeChange::Changed { id, kind } => {
                if let Some(device) = self.tree.device(id) {
                    debug!("{kind:?} on {}", device.devpath());
                }
            }
            TreeChange::Removed { devpath, devname } => match devname {
                Some(devname) => debug!("removed {devpath} ({devname})"),
                None => debug!("removed {devpath}"),
            },
            TreeChange::Moved { id, devpath_old } => {
                if let Some(device) = self.tree.device(id) {
                    debug!("moved {devpath_old} to {}", device.devpath());
                }
            }
        }
    }

    /// Open every directory handle the tree asked for and hand it back.
    ///
    /// `O_PATH` opens never block, so requests are completed right after the
    /// event that raised them instead of going through the socket loop. The
    /// tree still matches each token, so a request that a REMOVE or MOVE made
    /// stale is dropped there.
    fn service_sysfd(&mut self) -> Result<(), DeviceError> {
        for request in self.tree.take_sysfd_requests() {
            let path = self.sysfs_root.join("devices").join(&request.devpath);
            let opened = open_sysfd(&path);
            self.tree.sysfd_ready(request.token, opened)?;
        }
        Ok(())
    }
}

fn open_sysfd(path: &std::path::Path) -> io::Result<OwnedFd> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_PATH | libc::O_DIRECTORY | libc::O_NONBLOCK)
        .open(path)
        .map(|file: File| OwnedFd::from(file))
}
