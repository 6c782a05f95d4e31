//! Temporary credential switching for path validation.
//!
//! Privileged directory walks are performed with the caller's filesystem
//! credentials so that symlink games and permission tricks fail the same
//! way they would for the caller.  The switch is scoped: a guard saves
//! the prior identity on construction and restores it when dropped,
//! including the supplementary-group reset.

use crate::{
    caller::Caller,
    chdir::{check_prefix_list, safe_chdir, Validator},
    error::{Error, Result},
};
use nix::unistd::{fchdir, getcwd};
use std::{ffi::CString, os::unix::io::RawFd};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Change the filesystem uid, returning the previous one.
        ///
        /// setfsuid cannot report failure directly; calling it twice is the
        /// established way to learn whether the first call took effect.
        fn ch_uid(uid: libc::uid_t) -> Result<libc::uid_t> {
            let saved = unsafe { libc::setfsuid(uid) } as libc::uid_t;
            if unsafe { libc::setfsuid(uid) } as libc::uid_t != uid {
                return Err(Error::config(format!("failed to change fsuid to {}", uid)));
            }
            Ok(saved)
        }

        /// Change the filesystem gid, returning the previous one.
        fn ch_gid(gid: libc::gid_t) -> Result<libc::gid_t> {
            let saved = unsafe { libc::setfsgid(gid) } as libc::gid_t;
            if unsafe { libc::setfsgid(gid) } as libc::gid_t != gid {
                return Err(Error::config(format!("failed to change fsgid to {}", gid)));
            }
            Ok(saved)
        }
    } else {
        fn ch_uid(uid: libc::uid_t) -> Result<libc::uid_t> {
            use nix::unistd::Uid;
            let saved = nix::unistd::geteuid().as_raw();
            nix::unistd::setresuid(
                Uid::from_raw(libc::uid_t::MAX),
                Uid::from_raw(uid),
                Uid::from_raw(0),
            )
            .map_err(|err| Error::os(format!("failed to change euid to {}", uid), err))?;
            Ok(saved)
        }

        fn ch_gid(gid: libc::gid_t) -> Result<libc::gid_t> {
            use nix::unistd::Gid;
            let saved = nix::unistd::getegid().as_raw();
            nix::unistd::setresgid(
                Gid::from_raw(libc::gid_t::MAX),
                Gid::from_raw(gid),
                Gid::from_raw(0),
            )
            .map_err(|err| Error::os(format!("failed to change egid to {}", gid), err))?;
            Ok(saved)
        }
    }
}

/// Change the filesystem gid for device-node creation, returning the
/// previous value.  Paired manually where a full guard is overkill.
pub fn fs_gid(gid: libc::gid_t) -> Result<libc::gid_t> {
    ch_gid(gid)
}

/// Scoped filesystem-credential switch to the caller's identity.
pub struct FsCredGuard {
    saved_uid: libc::uid_t,
    saved_gid: libc::gid_t,
}

impl FsCredGuard {
    pub fn new(caller: &Caller) -> Result<Self> {
        let user = CString::new(caller.user.as_str())?;
        nix::unistd::initgroups(&user, caller.gid)
            .map_err(|err| Error::os(format!("initgroups({}, {})", caller.user, caller.gid), err))?;
        let saved_gid = ch_gid(caller.gid.as_raw())?;
        let saved_uid = ch_uid(caller.uid.as_raw())?;
        Ok(Self {
            saved_uid,
            saved_gid,
        })
    }
}

impl Drop for FsCredGuard {
    fn drop(&mut self) {
        // Privileged code must not continue on a failed restore.
        if ch_uid(self.saved_uid).is_err()
            || ch_gid(self.saved_gid).is_err()
            || nix::unistd::setgroups(&[]).is_err()
        {
            hasher_log::error!("failed to restore credentials");
            std::process::exit(1);
        }
    }
}

/// Change the current working directory to the given path with the
/// caller's filesystem credentials and per-component validation, then
/// check the result against the chroot prefix list.
pub fn chdiruid(path: &str, validator: Validator, caller: &Caller, prefixes: &[String],
                prefix_path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::config("invalid chroot path"));
    }

    let guard = FsCredGuard::new(caller)?;

    safe_chdir(path, validator)?;

    let cwd = getcwd().map_err(|err| Error::os("getcwd", err))?;
    check_prefix_list(&cwd.to_string_lossy(), prefixes, prefix_path)?;

    drop(guard);
    Ok(())
}

/// `chdiruid` for a directory descriptor: enter it with the caller's
/// filesystem credentials, validate what we ended up in, and check the
/// prefix list.
pub fn fchdiruid(fd: RawFd, validator: Validator, caller: &Caller, prefixes: &[String],
                 prefix_path: &str) -> Result<()> {
    let guard = FsCredGuard::new(caller)?;

    fchdir(fd).map_err(|err| Error::os("fchdir", err))?;

    let st = nix::sys::stat::lstat(".").map_err(|err| Error::os("lstat: .", err))?;
    validator.check(&st, ".")?;

    let cwd = getcwd().map_err(|err| Error::os("getcwd", err))?;
    check_prefix_list(&cwd.to_string_lossy(), prefixes, prefix_path)?;

    drop(guard);
    Ok(())
}
