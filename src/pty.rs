//! Pseudo-terminal allocation for the chrootuid child.
//!
//! A pty is opened outside the chroot first, because `/dev/ptmx` is
//! always present there; a second attempt inside the chroot is preferred
//! when it works, since it proves a correctly mounted devpts instance.

use crate::{
    caller::Caller,
    chdir::{safe_chdir, Validator},
    chid::FsCredGuard,
    error::{Error, Result},
    net::Fd,
};
use nix::{
    fcntl::{open, OFlag},
    sys::stat::{stat, Mode},
    unistd::chdir,
};
use std::os::unix::io::AsRawFd;

/// Where to look for the pty device pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyWhere {
    /// `/dev/ptmx` of the original filesystem.
    Unchrooted,
    /// `dev/ptmx` relative to the chroot root (the current directory).
    Chrooted,
}

fn ioctl_ptn(master: &Fd) -> Result<u32> {
    let mut num: libc::c_uint = 0;
    if unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCGPTN, &mut num) } < 0 {
        return Err(Error::os("ioctl TIOCGPTN", nix::Error::last()));
    }
    Ok(num)
}

fn ioctl_unlock(master: &Fd) -> Result<()> {
    let mut num: libc::c_int = 0;
    if unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSPTLCK, &mut num) } < 0 {
        return Err(Error::os("ioctl TIOCSPTLCK", nix::Error::last()));
    }
    Ok(())
}

/// Open a master/slave pty pair with the caller's filesystem
/// credentials.
///
/// For the chrooted flavor the current directory must be the chroot
/// root and devpts must have been mounted; the function returns with the
/// current directory at `/`.
pub fn open_pty(caller: &Caller, place: PtyWhere, dev_pts_mounted: bool) -> Result<(Fd, Fd)> {
    let guard = FsCredGuard::new(caller)?;

    let result = open_pty_creds(place, dev_pts_mounted);

    if place == PtyWhere::Chrooted {
        chdir("/").map_err(|err| Error::os("chdir: /", err))?;
    }
    drop(guard);
    result
}

fn open_pty_creds(place: PtyWhere, dev_pts_mounted: bool) -> Result<(Fd, Fd)> {
    let open_flags = OFlag::O_RDWR | OFlag::O_NOCTTY;

    let (ptmx_path, pts_prefix) = match place {
        PtyWhere::Unchrooted => ("/dev/ptmx".to_string(), "/dev/pts".to_string()),
        PtyWhere::Chrooted => {
            if !dev_pts_mounted {
                return Err(Error::config("devpts is not mounted"));
            }
            safe_chdir("dev", Validator::RootOk)?;

            // Require a usable pts/ptmx before touching it.
            let rwdev = libc::S_IFCHR | 0o666;
            let st = stat("pts/ptmx").map_err(|err| Error::os("stat: pts/ptmx", err))?;
            if st.st_mode & rwdev != rwdev {
                return Err(Error::config("pts/ptmx: not an accessible device"));
            }

            ("ptmx".to_string(), "pts".to_string())
        }
    };

    let master = open(ptmx_path.as_str(), open_flags, Mode::empty())
        .map_err(|err| Error::os(format!("open: {}", ptmx_path), err))?;
    let master = Fd::from(master);

    let num = ioctl_ptn(&master)?;
    ioctl_unlock(&master)?;

    let pts_path = format!("{}/{}", pts_prefix, num);
    let slave = open(pts_path.as_str(), open_flags, Mode::empty())
        .map_err(|err| Error::os(format!("open: {}", pts_path), err))?;

    Ok((master, Fd::from(slave)))
}
