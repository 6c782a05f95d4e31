//! Device setup under the chroot's freshly mounted `/dev`.

use crate::{
    caller::Caller,
    chdir::Validator,
    chid::{chdiruid, fchdiruid, fs_gid},
    comm::unix_listen,
    config::CallerConfig,
    error::{Error, Result},
    mount::RequestedMounts,
    net::Fd,
};
use nix::{
    sys::stat::{major, makedev, minor, mknod, stat, umask, Mode, SFlag},
    unistd::mkdir,
};
use std::os::unix::{fs::symlink, io::RawFd};

fn xmknod(name: &str, kind: SFlag, perm: libc::mode_t, dev_major: u64, dev_minor: u64) -> Result<()> {
    mknod(
        name,
        kind,
        Mode::from_bits_truncate(perm),
        makedev(dev_major, dev_minor),
    )
    .map_err(|err| Error::os(name.to_string(), err))
}

fn xmkdir(name: &str, perm: libc::mode_t) -> Result<()> {
    mkdir(name, Mode::from_bits_truncate(perm)).map_err(|err| Error::os(name.to_string(), err))
}

fn xsymlink(target: &str, linkpath: &str) -> Result<()> {
    symlink(target, linkpath).map_err(|err| {
        let errno = nix::Error::from_i32(err.raw_os_error().unwrap_or(libc::EIO));
        Error::os(linkpath.to_string(), errno)
    })
}

/// Derive the type and permission bits of a copied device node from its
/// source.
///
/// Group/other access is granted only where the source device already
/// grants it beyond its owner.
pub fn derive_device_mode(st_mode: libc::mode_t) -> Option<(SFlag, libc::mode_t)> {
    let kind = match st_mode & libc::S_IFMT {
        libc::S_IFCHR => SFlag::S_IFCHR,
        libc::S_IFBLK => SFlag::S_IFBLK,
        _ => return None,
    };

    let mut perm: libc::mode_t = 0;
    if st_mode & libc::S_IRUSR != 0 && st_mode & (libc::S_IRGRP | libc::S_IROTH) != 0 {
        perm |= libc::S_IRUSR | libc::S_IRGRP | libc::S_IROTH;
    }
    if st_mode & libc::S_IWUSR != 0 && st_mode & (libc::S_IWGRP | libc::S_IWOTH) != 0 {
        perm |= libc::S_IWUSR | libc::S_IWGRP | libc::S_IWOTH;
    }

    Some((kind, perm))
}

/// Split a device path into its `/dev/`-relative name.
pub fn device_rel_name(src: &str) -> Result<&str> {
    match src.strip_prefix("/dev/") {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(Error::config(format!("{}: invalid device name", src))),
    }
}

fn make_parent_directories(name: &str) -> Result<()> {
    let mut partial = String::with_capacity(name.len());
    for component in name.split('/') {
        if !partial.is_empty() {
            match mkdir(partial.as_str(), Mode::from_bits_truncate(0o755)) {
                Ok(()) | Err(nix::Error::EEXIST) => {}
                Err(err) => return Err(Error::os(partial.clone(), err)),
            }
            partial.push('/');
        }
        partial.push_str(component);
    }
    Ok(())
}

/// Copy one device from the host's `/dev` into the chroot's `dev/`
/// (the current directory), keeping its major/minor and a sanitized
/// permission set.
fn copy_dev(src: &str) -> Result<()> {
    let name = device_rel_name(src)?;

    let st = stat(src).map_err(|err| Error::os(format!("stat: {}", src), err))?;

    let (kind, perm) = derive_device_mode(st.st_mode)
        .ok_or_else(|| Error::config(format!("{}: not a device", src)))?;

    if name.contains('/') {
        make_parent_directories(name)?;
    }

    xmknod(name, kind, perm, major(st.st_rdev), minor(st.st_rdev))
}

/// Create the in-chroot `dev/log` listening socket, mode 0622.
fn log_listen() -> Result<Fd> {
    use std::os::unix::fs::PermissionsExt;
    let fd = unix_listen("log")?;
    std::fs::set_permissions("log", std::fs::Permissions::from_mode(0o622))?;
    Ok(fd)
}

/// Populate the chroot's `/dev`: standard symlinks and nodes, optional
/// console set, pts extras, the log socket, and the caller's device
/// copies.
///
/// Runs with root privileges; returns the log listening socket.
pub fn setup_devices(
    caller: &Caller,
    cfg: &CallerConfig,
    chroot_fd: RawFd,
    requested: &RequestedMounts,
) -> Result<Fd> {
    let caller_ok = Validator::CallerOk {
        caller_uid: caller.uid,
        change_gid1: cfg
            .target1
            .as_ref()
            .map(|t| t.gid)
            .ok_or_else(|| Error::config("undefined: user1"))?,
    };

    fchdiruid(chroot_fd, caller_ok, caller, &cfg.prefix_list, &cfg.prefix_path)?;
    chdiruid("dev", Validator::RootOk, caller, &cfg.prefix_list, &cfg.prefix_path)?;

    let saved_gid = fs_gid(0)?;
    let saved_umask = umask(Mode::empty());

    let result = (|| {
        xmkdir("pts", 0o755)?;
        xmkdir("shm", 0o755)?;

        xsymlink("../proc/self/fd", "fd")?;
        xsymlink("../proc/self/fd/0", "stdin")?;
        xsymlink("../proc/self/fd/1", "stdout")?;
        xsymlink("../proc/self/fd/2", "stderr")?;

        xmknod("null", SFlag::S_IFCHR, 0o666, 1, 3)?;
        xmknod("zero", SFlag::S_IFCHR, 0o666, 1, 5)?;
        xmknod("full", SFlag::S_IFCHR, 0o666, 1, 7)?;
        xmknod("urandom", SFlag::S_IFCHR, 0o644, 1, 9)?;
        // Pseudo random.
        xmknod("random", SFlag::S_IFCHR, 0o644, 1, 9)?;

        if cfg.makedev_console {
            xmknod("console", SFlag::S_IFCHR, 0o600, 5, 1)?;
            xmknod("tty0", SFlag::S_IFCHR, 0o600, 4, 0)?;
            xmknod("fb0", SFlag::S_IFCHR, 0o600, 29, 0)?;
        }

        if requested.dev_pts_mounted {
            xmknod("tty", SFlag::S_IFCHR, 0o666, 5, 0)?;
            xsymlink("pts/ptmx", "ptmx")?;
        }

        let log_fd = log_listen()?;

        for src in &requested.devices {
            copy_dev(src)?;
        }

        Ok(log_fd)
    })();

    umask(saved_umask);
    fs_gid(saved_gid)?;

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_mode_derivation() {
        // 0644 char device: owner read shared with group/other => 0444.
        let (kind, perm) = derive_device_mode(libc::S_IFCHR | 0o644).unwrap();
        assert_eq!(kind, SFlag::S_IFCHR);
        assert_eq!(perm, 0o444);

        // 0666: both read and write shared.
        let (_, perm) = derive_device_mode(libc::S_IFCHR | 0o666).unwrap();
        assert_eq!(perm, 0o666);

        // 0600: nothing shared beyond the owner.
        let (_, perm) = derive_device_mode(libc::S_IFBLK | 0o600).unwrap();
        assert_eq!(perm, 0);

        // Non-devices are rejected.
        assert!(derive_device_mode(libc::S_IFREG | 0o644).is_none());
        assert!(derive_device_mode(libc::S_IFDIR | 0o755).is_none());
    }

    #[test]
    fn test_device_rel_name() {
        assert_eq!(device_rel_name("/dev/kvm").unwrap(), "kvm");
        assert_eq!(device_rel_name("/dev/snd/timer").unwrap(), "snd/timer");
        assert!(device_rel_name("/dev/").is_err());
        assert!(device_rel_name("/tmp/kvm").is_err());
    }
}
