//! `unshare(2)` helpers for the chrootuid path.

use crate::error::{Error, Result};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::sethostname;
use std::mem::{size_of, zeroed};

/// Unshare one namespace, honoring the caller's share request.
///
/// `share` is the tri-state from the environment: `Some(true)` keeps the
/// caller's namespace, `Some(false)` demands isolation, `None` wants
/// isolation but tolerates a kernel without support.
fn do_unshare(flags: CloneFlags, clone_name: &str, share: Option<bool>, what: &str) -> Result<bool> {
    if share == Some(true) {
        return Ok(false);
    }

    match unshare(flags) {
        Ok(()) => Ok(true),
        Err(err @ (nix::Error::ENOSYS | nix::Error::EINVAL | nix::Error::EPERM)) => {
            hasher_log::error!("{} isolation is not supported by the kernel: {}", what, err);
            if share.is_none() {
                Ok(false)
            } else {
                Err(Error::os(clone_name.to_string(), err))
            }
        }
        Err(err) => Err(Error::os(clone_name.to_string(), err)),
    }
}

pub fn unshare_ipc(share: Option<bool>) -> Result<()> {
    do_unshare(CloneFlags::CLONE_NEWIPC, "CLONE_NEWIPC", share, "IPC namespace").map(|_| ())
}

/// Unshare the mount namespace; every mount after this stays invisible
/// outside.
pub fn unshare_mount() -> Result<()> {
    do_unshare(CloneFlags::CLONE_NEWNS, "CLONE_NEWNS", Some(false), "mount namespace")
        .map(|_| ())
}

pub fn unshare_uts(share: Option<bool>) -> Result<()> {
    let name = "localhost.localdomain";
    if do_unshare(CloneFlags::CLONE_NEWUTS, "CLONE_NEWUTS", share, "UTS namespace")? {
        sethostname(name).map_err(|err| Error::os(format!("sethostname: {}", name), err))?;
    }
    Ok(())
}

pub fn unshare_network(share: Option<bool>) -> Result<()> {
    if do_unshare(CloneFlags::CLONE_NEWNET, "CLONE_NEWNET", share, "network")? {
        setup_network()?;
    }
    Ok(())
}

#[repr(C)]
struct LinkRequest {
    header: libc::nlmsghdr,
    info: libc::ifinfomsg,
}

/// Bring the loopback interface up in the fresh network namespace via
/// one RTM_NEWLINK request.
fn setup_network() -> Result<()> {
    let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_DGRAM, libc::NETLINK_ROUTE) };
    if fd < 0 {
        return Err(Error::os("socket", nix::Error::last()));
    }
    let fd = crate::net::Fd::from(fd);

    let index = unsafe { libc::if_nametoindex(b"lo\0".as_ptr().cast()) };

    let mut req: LinkRequest = unsafe { zeroed() };
    req.header.nlmsg_len = size_of::<LinkRequest>() as u32;
    req.header.nlmsg_flags = libc::NLM_F_REQUEST as u16;
    req.header.nlmsg_type = libc::RTM_NEWLINK;
    req.info.ifi_family = libc::AF_UNSPEC as libc::c_uchar;
    req.info.ifi_index = index as libc::c_int;
    req.info.ifi_flags = libc::IFF_UP as libc::c_uint;
    req.info.ifi_change = libc::IFF_UP as libc::c_uint;

    let sent = unsafe {
        libc::send(
            std::os::unix::io::AsRawFd::as_raw_fd(&fd),
            (&req as *const LinkRequest).cast(),
            req.header.nlmsg_len as usize,
            0,
        )
    };
    if sent < 0 {
        return Err(Error::os("send", nix::Error::last()));
    }

    Ok(())
}
