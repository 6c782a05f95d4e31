//! Joining the caller's cgroup.
//!
//! Chroot'ed processes inherit whatever resource regulation the caller is
//! already subject to by writing themselves into the caller's cgroup-v2
//! before any other setup.

use crate::{
    error::{Error, Result},
    net::Fd,
};
use nix::{
    fcntl::{open, openat, OFlag},
    sys::stat::{fstat, Mode},
    unistd::{getpid, Uid},
};
use std::os::unix::io::AsRawFd;

/// Open `/proc/<pid>` and verify it belongs to the expected uid.
pub fn open_proc_dir(pid: libc::pid_t, uid: Uid) -> Result<Fd> {
    let fname = format!("/proc/{}", pid);
    let fd = open(
        fname.as_str(),
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|err| Error::os(format!("open: {}", fname), err))?;
    let fd = Fd::from(fd);

    let st = fstat(fd.as_raw_fd()).map_err(|err| Error::os(format!("fstat: {}", fname), err))?;
    if st.st_uid != uid.as_raw() {
        return Err(Error::auth(format!(
            "{}: expected owner {}, found owner {}",
            fname, uid, st.st_uid
        )));
    }

    Ok(fd)
}

fn read_all(fd: &Fd) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match nix::unistd::read(fd.as_raw_fd(), &mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(nix::Error::EINTR) => continue,
            Err(err) => return Err(Error::os("read", err)),
        }
    }
    Ok(buf)
}

/// Extract the cgroup-v2 path from a `/proc/<pid>/cgroup` line.
pub fn parse_cgroup_v2(content: &str) -> Result<Option<&str>> {
    let line = content.trim_end_matches(['\n', '\0'].as_ref());
    if line.is_empty() {
        return Ok(None);
    }
    line.strip_prefix("0::")
        .map(Some)
        .ok_or_else(|| Error::config("cgroup: not version 2"))
}

fn join_cgroup(cgroup_path: &str) -> Result<()> {
    let fname = format!("/sys/fs/cgroup{}/cgroup.procs", cgroup_path);
    let fd = open(
        fname.as_str(),
        OFlag::O_WRONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|err| Error::os(format!("open: {}", fname), err))?;
    let fd = Fd::from(fd);

    hasher_log::debug!("joining {}", cgroup_path);

    let pid = format!("{}\n", getpid());
    nix::unistd::write(fd.as_raw_fd(), pid.as_bytes())
        .map_err(|err| Error::os(format!("write: {}", fname), err))?;
    Ok(())
}

/// Join the cgroup of the caller's process.
pub fn join_caller_cgroup(pid: libc::pid_t, uid: Uid) -> Result<()> {
    let proc_fd = open_proc_dir(pid, uid)?;

    let cgroup_fd = openat(
        proc_fd.as_raw_fd(),
        "cgroup",
        OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|err| Error::os("open: cgroup", err))?;
    let cgroup_fd = Fd::from(cgroup_fd);

    let content = read_all(&cgroup_fd)?;
    let content = String::from_utf8_lossy(&content);

    match parse_cgroup_v2(&content)? {
        Some(path) => join_cgroup(path),
        None => {
            hasher_log::debug!("cgroup file is empty");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cgroup_line() {
        assert_eq!(
            parse_cgroup_v2("0::/user.slice/session-1.scope\n").unwrap(),
            Some("/user.slice/session-1.scope")
        );
        assert_eq!(parse_cgroup_v2("").unwrap(), None);
        assert!(parse_cgroup_v2("12:cpu:/legacy\n").is_err());
    }
}
