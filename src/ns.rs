//! Namespace entry for chrootuid jobs.
//!
//! The job runs in the caller's namespaces where that is safe: every
//! namespace in which we differ from the caller is either entered via
//! `setns` (mnt, ipc, uts, net) or a fatal mismatch.

use crate::{
    cgroup::open_proc_dir,
    error::{Error, Result},
    net::Fd,
};
use nix::{
    fcntl::{open, openat, OFlag},
    sched::{setns, CloneFlags},
    sys::stat::{fstatat, Mode},
};
use nix::fcntl::AtFlags;
use nix::unistd::Uid;
use std::os::unix::io::AsRawFd;

/// Namespaces we may enter on the caller's behalf.
pub fn enterable_namespace(name: &str) -> Option<CloneFlags> {
    match name {
        "mnt" => Some(CloneFlags::CLONE_NEWNS),
        "ipc" => Some(CloneFlags::CLONE_NEWIPC),
        "uts" => Some(CloneFlags::CLONE_NEWUTS),
        "net" => Some(CloneFlags::CLONE_NEWNET),
        _ => None,
    }
}

/// Compare our namespaces against the caller's and enter the ones from
/// the allow-list that differ.  A differing namespace outside the
/// allow-list is fatal, before any mount is performed.
pub fn setup_ns(pid: libc::pid_t, uid: Uid) -> Result<()> {
    let proc_fd = open_proc_dir(pid, uid)?;
    let pid_ns_fd = openat(
        proc_fd.as_raw_fd(),
        "ns",
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|err| Error::os(format!("open: /proc/{}/ns", pid), err))?;
    let pid_ns_fd = Fd::from(pid_ns_fd);
    drop(proc_fd);

    const SELF_NS: &str = "/proc/self/ns";
    let self_ns_fd = open(
        SELF_NS,
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|err| Error::os(format!("open: {}", SELF_NS), err))?;
    let self_ns_fd = Fd::from(self_ns_fd);

    for entry in std::fs::read_dir(SELF_NS)? {
        let entry = entry?;
        if !entry.file_type()?.is_symlink() {
            continue;
        }
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        let name: &str = &name;

        let self_st = fstatat(self_ns_fd.as_raw_fd(), name, AtFlags::empty())
            .map_err(|err| Error::os(format!("fstatat: {}/{}", SELF_NS, name), err))?;
        let pid_st = fstatat(pid_ns_fd.as_raw_fd(), name, AtFlags::empty())
            .map_err(|err| Error::os(format!("fstatat: /proc/{}/ns/{}", pid, name), err))?;

        if self_st.st_dev == pid_st.st_dev && self_st.st_ino == pid_st.st_ino {
            continue;
        }

        let flag = enterable_namespace(name)
            .ok_or_else(|| Error::config(format!("{} namespace mismatch", name)))?;

        let ns_fd = openat(
            pid_ns_fd.as_raw_fd(),
            name,
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|err| Error::os(format!("open: /proc/{}/ns/{}", pid, name), err))?;
        let ns_fd = Fd::from(ns_fd);

        setns(ns_fd.as_raw_fd(), flag)
            .map_err(|err| Error::os(format!("setns: {}", name), err))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_list() {
        assert_eq!(enterable_namespace("mnt"), Some(CloneFlags::CLONE_NEWNS));
        assert_eq!(enterable_namespace("ipc"), Some(CloneFlags::CLONE_NEWIPC));
        assert_eq!(enterable_namespace("uts"), Some(CloneFlags::CLONE_NEWUTS));
        assert_eq!(enterable_namespace("net"), Some(CloneFlags::CLONE_NEWNET));
        assert_eq!(enterable_namespace("user"), None);
        assert_eq!(enterable_namespace("pid"), None);
        assert_eq!(enterable_namespace("time"), None);
        assert_eq!(enterable_namespace("cgroup"), None);
    }
}
