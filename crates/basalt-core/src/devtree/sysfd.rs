//! Lazily opened device directory handles.

use std::fmt;
use std::io;
use std::os::fd::BorrowedFd;
use thiserror::Error;

/// Why a subscriber did not receive a handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SysfdError {
    #[error("device was removed before its directory became ready")]
    Gone,
    #[error("cannot open device directory: {0}")]
    Open(String),
}

/// Subscriber invoked exactly once with the shared directory handle.
pub type SysfdCallback = Box<dyn FnOnce(Result<BorrowedFd<'_>, SysfdError>)>;

/// Directory open the event loop must perform on behalf of the tree.
///
/// The loop opens `<sysfs>/devices/<devpath>` path-only and non-blocking and
/// hands the outcome back through [`DeviceTree::sysfd_ready`] with the same
/// token.
///
/// [`DeviceTree::sysfd_ready`]: super::DeviceTree::sysfd_ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysfdRequest {
    pub token: u64,
    pub devpath: String,
}

pub(crate) enum SysfdState {
    Unopened,
    Opening {
        token: u64,
        waiters: Vec<SysfdCallback>,
    },
}

impl SysfdState {
    pub(crate) fn token(&self) -> Option<u64> {
        match self {
            SysfdState::Unopened => None,
            SysfdState::Opening { token, .. } => Some(*token),
        }
    }

    pub(crate) fn waiter_count(&self) -> usize {
        match self {
            SysfdState::Unopened => 0,
            SysfdState::Opening { waiters, .. } => waiters.len(),
        }
    }

    /// Reset to `Unopened`, returning waiters most recent first.
    pub(crate) fn take_waiters(&mut self) -> Vec<SysfdCallback> {
        match std::mem::replace(self, SysfdState::Unopened) {
            SysfdState::Unopened => Vec::new(),
            SysfdState::Opening { mut waiters, .. } => {
                waiters.reverse();
                waiters
            }
        }
    }
}

impl fmt::Debug for SysfdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SysfdState::Unopened => f.write_str("Unopened"),
            SysfdState::Opening { token, waiters } => f
                .debug_struct("Opening")
                .field("token", token)
                .field("waiters", &waiters.len())
                .finish(),
        }
    }
}

pub(crate) fn fail_all(waiters: Vec<SysfdCallback>, error: SysfdError) {
    for waiter in waiters {
        waiter(Err(error.clone()));
    }
}

/// Descriptor table exhaustion is fatal to the daemon.
pub(crate) fn is_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
        || err.kind() == io::ErrorKind::OutOfMemory
}
