//! Provider contracts consumed by the device tree and the device daemon.
//!
//! Module loading and node permissions stay thin: the tree decides
//! *when* they happen, the provider decides *how*.

use std::error::Error;
use std::io;

/// Answers "does this subsystem exist under the bus or class hierarchy".
///
/// Implementations must not cache negative answers; a subsystem may be
/// transiently missing while the kernel is still registering it.
pub trait SubsystemProbe {
    fn subsystem_exists(&self, name: &str) -> io::Result<bool>;
}

impl<F> SubsystemProbe for F
where
    F: Fn(&str) -> io::Result<bool>,
{
    fn subsystem_exists(&self, name: &str) -> io::Result<bool> {
        self(name)
    }
}

/// Loads kernel modules by modalias.
pub trait ModuleLoader {
    /// Queue a module load for `alias` and return immediately.
    ///
    /// The load runs detached from the caller. There is no ordering guarantee
    /// relative to later events for the same device: a REMOVE may be applied
    /// to the tree before the module matching its ADD has finished probing.
    fn spawn_load_detached(&self, alias: &str);
}

/// A device node that became ready and may need ownership/mode applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    /// Node name relative to the dev root (e.g. `sda1`, `input/event3`).
    pub devname: String,
    pub subsystem: Option<String>,
    pub devtype: Option<String>,
    /// `major:minor` as read from the device's `dev` attribute.
    pub dev: Option<(u32, u32)>,
}

/// Applies permissions to a device node.
pub trait NodePermissions {
    type Error: Error + Send + Sync + 'static;

    fn apply(&self, node: &DeviceNode) -> Result<(), Self::Error>;
}
