//! Kernel uevent broadcast socket.

use basalt_core::uevent::{SenderCredentials, KERNEL_UEVENT_GROUP};
use log::debug;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use tokio::io::unix::AsyncFd;

/// Largest uevent the kernel emits is bounded by `UEVENT_BUFFER_SIZE` (2048);
/// leave headroom for the summary record.
const RECV_BUFFER: usize = 8192;
const RECV_QUEUE_BYTES: libc::c_int = 128 * 1024 * 1024;

/// One datagram plus the addressing the kernel attached to it.
#[derive(Debug, Clone)]
pub(crate) struct Datagram {
    pub(crate) payload: Vec<u8>,
    pub(crate) port: u32,
    pub(crate) groups: u32,
    pub(crate) credentials: Option<SenderCredentials>,
}

pub(crate) struct UeventSocket {
    fd: AsyncFd<OwnedFd>,
}

impl UeventSocket {
    /// Bind to the kernel uevent multicast group with `SO_PASSCRED` set.
    pub(crate) fn open() -> io::Result<Self> {
        // SAFETY: plain syscall; the result is checked before use.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a freshly created descriptor nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        set_int_option(fd.as_raw_fd(), libc::SO_PASSCRED, 1)?;
        if let Err(err) = set_int_option(fd.as_raw_fd(), libc::SO_RCVBUFFORCE, RECV_QUEUE_BYTES) {
            debug!("keeping default uevent receive queue: {err}");
        }

        // SAFETY: all-zero is a valid `sockaddr_nl`.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = KERNEL_UEVENT_GROUP;
        // SAFETY: `addr` outlives the call and the length matches its type.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    /// Wait for the next datagram.
    pub(crate) async fn recv(&self) -> io::Result<Datagram> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| recv_datagram(inner.as_raw_fd())) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn set_int_option(fd: RawFd, option: libc::c_int, value: libc::c_int) -> io::Result<()> {
    // SAFETY: `value` outlives the call and the length matches its type.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            ptr::addr_of!(value).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn recv_datagram(fd: RawFd) -> io::Result<Datagram> {
    let mut payload = vec![0u8; RECV_BUFFER];
    // u64 storage keeps the control buffer aligned for `cmsghdr`.
    let mut control = [0u64; 8];
    // SAFETY: all-zero is a valid `sockaddr_nl` and `msghdr`.
    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = ptr::addr_of_mut!(addr).cast();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = mem::size_of_val(&control) as _;

    // SAFETY: every pointer in `msg` refers to a live local buffer of the
    // advertised length.
    let received = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }
    if msg.msg_flags & libc::MSG_TRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "uevent datagram truncated",
        ));
    }
    payload.truncate(received as usize);

    let mut credentials = None;
    // SAFETY: `msg` was filled in by recvmsg; the CMSG_* helpers stay within
    // `msg_controllen`.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let header = &*cmsg;
            if header.cmsg_level == libc::SOL_SOCKET && header.cmsg_type == libc::SCM_CREDENTIALS {
                let cred = ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::ucred>());
                credentials = Some(SenderCredentials {
                    pid: cred.pid as u32,
                    uid: cred.uid,
                    gid: cred.gid,
                });
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(Datagram {
        payload,
        port: addr.nl_pid,
        groups: addr.nl_groups,
        credentials,
    })
}
