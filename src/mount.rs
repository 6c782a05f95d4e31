//! Mountpoint setup inside the new mount namespace.
//!
//! The caller requests mountpoints by absolute path; each must be listed
//! in exactly one of `allowed_devices` (copied as a device node) or
//! `allowed_mountpoints` (mounted from `/etc/hasher-priv/fstab`, falling
//! back to a built-in table).

use crate::{
    caller::Caller,
    chdir::{safe_chdir, Validator},
    chid::{chdiruid, fchdiruid},
    config::{load_config_file, CallerConfig},
    error::{Error, Result},
    makedev,
    net::Fd,
};
use nix::mount::{mount, MsFlags};
use nix::unistd::Group;
use std::os::unix::io::RawFd;

/// One fstab entry, from the admin fstab or the built-in table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MntEnt {
    pub fsname: String,
    pub dir: String,
    pub fstype: String,
    pub opts: String,
}

fn def_fstab() -> Vec<MntEnt> {
    let entry = |fsname: &str, dir: &str, fstype: &str, opts: &str| MntEnt {
        fsname: fsname.to_string(),
        dir: dir.to_string(),
        fstype: fstype.to_string(),
        opts: opts.to_string(),
    };
    vec![
        entry(
            "dev",
            "/dev",
            "tmpfs",
            "nosuid,noexec,gid=0,mode=755,nr_blocks=0,nr_inodes=256",
        ),
        entry("proc", "/proc", "proc", "ro,nosuid,nodev,noexec,gid=proc,hidepid=2"),
        entry(
            "devpts",
            "/dev/pts",
            "devpts",
            "ro,nosuid,noexec,gid=tty,mode=0620,ptmxmode=0666,newinstance",
        ),
        entry("sysfs", "/sys", "sysfs", "ro,nosuid,nodev,noexec"),
        entry(
            "shmfs",
            "/dev/shm",
            "tmpfs",
            "nosuid,nodev,noexec,gid=0,mode=1777,nr_blocks=4096,nr_inodes=4096",
        ),
        entry(
            "/sys/fs/cgroup",
            "/sys/fs/cgroup",
            "rbind",
            "ro,rbind,nosuid,nodev,noexec",
        ),
    ]
}

struct OptFlag {
    name: &'static str,
    invert: bool,
    value: MsFlags,
}

fn opt(name: &'static str, invert: bool, value: MsFlags) -> OptFlag {
    OptFlag {
        name,
        invert,
        value,
    }
}

fn opt_map() -> Vec<OptFlag> {
    vec![
        opt("defaults", false, MsFlags::empty()),
        opt("rw", true, MsFlags::MS_RDONLY),
        opt("ro", false, MsFlags::MS_RDONLY),
        opt("suid", true, MsFlags::MS_NOSUID),
        opt("nosuid", false, MsFlags::MS_NOSUID),
        opt("dev", true, MsFlags::MS_NODEV),
        opt("nodev", false, MsFlags::MS_NODEV),
        opt("exec", true, MsFlags::MS_NOEXEC),
        opt("noexec", false, MsFlags::MS_NOEXEC),
        opt("sync", false, MsFlags::MS_SYNCHRONOUS),
        opt("async", true, MsFlags::MS_SYNCHRONOUS),
        opt("mand", false, MsFlags::MS_MANDLOCK),
        opt("nomand", true, MsFlags::MS_MANDLOCK),
        opt("dirsync", false, MsFlags::MS_DIRSYNC),
        opt("dirasync", true, MsFlags::MS_DIRSYNC),
        opt("bind", false, MsFlags::MS_BIND),
        opt("rbind", false, MsFlags::MS_BIND | MsFlags::MS_REC),
        opt("atime", true, MsFlags::MS_NOATIME),
        opt("noatime", false, MsFlags::MS_NOATIME),
        opt("diratime", true, MsFlags::MS_NODIRATIME),
        opt("nodiratime", false, MsFlags::MS_NODIRATIME),
    ]
}

/// Parse a comma-separated option string into mount flags plus the
/// leftover data options.
///
/// A `gid=<name>` with a non-numeric name is resolved through the group
/// database by `resolve_gid`.
pub fn parse_mount_opts<F>(opts: &str, resolve_gid: F) -> (MsFlags, String)
where
    F: Fn(&str) -> Option<libc::gid_t>,
{
    let map = opt_map();
    let mut flags = MsFlags::MS_MGC_VAL | MsFlags::MS_NOSUID;
    let mut data = String::new();

    for item in opts.split(',').filter(|o| !o.is_empty()) {
        if let Some(known) = map.iter().find(|o| o.name == item) {
            if known.invert {
                flags.remove(known.value);
            } else {
                flags.insert(known.value);
            }
            continue;
        }

        let item = match item.strip_prefix("gid=") {
            Some(name) if !name.chars().next().map_or(false, |c| c.is_ascii_digit()) => {
                match resolve_gid(name) {
                    Some(gid) => format!("gid={}", gid),
                    None => item.to_string(),
                }
            }
            _ => item.to_string(),
        };

        if !data.is_empty() {
            data.push(',');
        }
        data.push_str(&item);
    }

    (flags, data)
}

/// Parse the classical fstab format: whitespace-separated
/// `fsname dir type opts` fields, `#` comments.
pub fn parse_fstab(content: &str) -> Vec<MntEnt> {
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_ascii_whitespace();
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some(fsname), Some(dir), Some(fstype), Some(opts)) => out.push(MntEnt {
                fsname: fsname.to_string(),
                dir: dir.to_string(),
                fstype: fstype.to_string(),
                opts: opts.to_string(),
            }),
            _ => continue,
        }
    }
    out
}

/// How the caller's requested mountpoints decompose.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RequestedMounts {
    pub devices: Vec<String>,
    pub mountpoints: Vec<String>,
    pub dev_pts_mounted: bool,
}

/// Classify requested mountpoints against the allowed lists.
///
/// `/dev` and `/dev/shm` are always mounted and skipped here as
/// duplicates.  An entry present in both lists is a configuration error;
/// an entry present in neither is denied.
pub fn classify_requested(
    requested: &[String],
    allowed_devices: &[String],
    allowed_mountpoints: &[String],
) -> Result<RequestedMounts> {
    let mut out = RequestedMounts::default();

    for item in requested {
        if item == "/dev" || item == "/dev/shm" {
            continue;
        }

        if !item.starts_with('/') || item.as_bytes().get(1) == Some(&b'/') {
            return Err(Error::config(format!(
                "{}: mount point is not supported",
                item
            )));
        }

        let allowed_dev = allowed_devices.iter().any(|a| a == item);
        let allowed_mpoint = allowed_mountpoints.iter().any(|a| a == item);

        if allowed_dev && allowed_mpoint {
            return Err(Error::config(format!(
                "{}: configured as device and mount point simultaneously",
                item
            )));
        }
        if allowed_dev {
            if !item.starts_with("/dev/") {
                return Err(Error::config(format!(
                    "{}: device name is not supported",
                    item
                )));
            }
            out.devices.push(item.clone());
        } else if allowed_mpoint {
            if item == "/dev/pts" {
                out.dev_pts_mounted = true;
            }
            out.mountpoints.push(item.clone());
        } else {
            return Err(Error::config(format!(
                "{}: mount point is not allowed",
                item
            )));
        }
    }

    Ok(out)
}

fn lookup_mount_entry<'a>(
    mpoint: &str,
    user_fstab: &'a [MntEnt],
    defaults: &'a [MntEnt],
) -> Result<&'a MntEnt> {
    user_fstab
        .iter()
        .find(|e| e.dir == mpoint)
        .or_else(|| defaults.iter().find(|e| e.dir == mpoint))
        .ok_or_else(|| Error::config(format!("{}: mount point is not supported", mpoint)))
}

fn resolve_group_gid(name: &str) -> Option<libc::gid_t> {
    Group::from_name(name).ok().flatten().map(|g| g.gid.as_raw())
}

/// Mount one entry at its place under the chroot.
fn xmount(
    entry: &MntEnt,
    caller: &Caller,
    cfg: &CallerConfig,
    chroot_fd: RawFd,
) -> Result<()> {
    if !entry.dir.starts_with('/') {
        return Err(Error::config(format!("{}: invalid mount point", entry.dir)));
    }

    let (flags, data) = parse_mount_opts(&entry.opts, resolve_group_gid);

    let caller_ok = Validator::CallerOk {
        caller_uid: caller.uid,
        change_gid1: cfg
            .target1
            .as_ref()
            .map(|t| t.gid)
            .ok_or_else(|| Error::config("undefined: user1"))?,
    };

    fchdiruid(chroot_fd, caller_ok, caller, &cfg.prefix_list, &cfg.prefix_path)?;

    let rel = &entry.dir[1..];
    let validator = if rel.starts_with("dev/") {
        Validator::RootOk
    } else {
        caller_ok
    };
    chdiruid(rel, validator, caller, &cfg.prefix_list, &cfg.prefix_path)?;

    let data = if data.is_empty() {
        None
    } else {
        Some(data.as_str())
    };
    mount(
        Some(entry.fsname.as_str()),
        ".",
        Some(entry.fstype.as_str()),
        flags,
        data,
    )
    .map_err(|err| Error::os(format!("mount: {}", entry.dir), err))
}

/// What `setup_mountpoints` leaves behind for the rest of the chrootuid
/// sequence.
pub struct MountOutcome {
    /// Listening socket behind the chroot's `/dev/log`.
    pub log_fd: Fd,
    pub dev_pts_mounted: bool,
}

/// Mount everything the job needs inside the fresh mount namespace and
/// populate `/dev`.
///
/// Runs with root privileges, after `unshare(CLONE_NEWNS)`, with the
/// current directory at the chroot root.
pub fn setup_mountpoints(
    caller: &Caller,
    cfg: &CallerConfig,
    chroot_fd: RawFd,
) -> Result<MountOutcome> {
    let requested = classify_requested(
        &cfg.requested_mountpoints,
        &cfg.allowed_devices,
        &cfg.allowed_mountpoints,
    )?;

    // Just in case some filesystem is mounted as shared, remount it as
    // slave in our namespace so that no further mounts show up outside.
    match mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    ) {
        Ok(()) | Err(nix::Error::EINVAL) => {}
        Err(err) => return Err(Error::os("mount MS_SLAVE: /", err)),
    }

    let user_fstab = load_fstab()?;
    let defaults = def_fstab();

    xmount(
        lookup_mount_entry("/dev", &user_fstab, &defaults)?,
        caller,
        cfg,
        chroot_fd,
    )?;

    let log_fd = makedev::setup_devices(caller, cfg, chroot_fd, &requested)?;

    xmount(
        lookup_mount_entry("/dev/shm", &user_fstab, &defaults)?,
        caller,
        cfg,
        chroot_fd,
    )?;

    for mpoint in &requested.mountpoints {
        xmount(
            lookup_mount_entry(mpoint, &user_fstab, &defaults)?,
            caller,
            cfg,
            chroot_fd,
        )?;
    }

    Ok(MountOutcome {
        log_fd,
        dev_pts_mounted: requested.dev_pts_mounted,
    })
}

fn load_fstab() -> Result<Vec<MntEnt>> {
    safe_chdir("/", Validator::RootOk)?;
    safe_chdir("etc/hasher-priv", Validator::RootOk)?;
    let content = load_config_file("fstab")?;
    safe_chdir("/", Validator::RootOk)?;
    Ok(parse_fstab(&content))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_groups(_: &str) -> Option<libc::gid_t> {
        None
    }

    #[test]
    fn test_opt_flags() {
        let (flags, data) = parse_mount_opts("ro,nosuid,nodev,noexec", no_groups);
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert!(flags.contains(MsFlags::MS_NOSUID));
        assert!(flags.contains(MsFlags::MS_NODEV));
        assert!(flags.contains(MsFlags::MS_NOEXEC));
        assert!(data.is_empty());
    }

    #[test]
    fn test_opt_invert() {
        // The implicit nosuid can be reverted by an explicit "suid".
        let (flags, _) = parse_mount_opts("suid", no_groups);
        assert!(!flags.contains(MsFlags::MS_NOSUID));

        let (flags, _) = parse_mount_opts("rbind", no_groups);
        assert!(flags.contains(MsFlags::MS_BIND));
        assert!(flags.contains(MsFlags::MS_REC));
    }

    #[test]
    fn test_opt_data_passthrough() {
        let (_, data) = parse_mount_opts("mode=0620,ptmxmode=0666,newinstance", no_groups);
        assert_eq!(data, "mode=0620,ptmxmode=0666,newinstance");
    }

    #[test]
    fn test_gid_resolution() {
        let resolver = |name: &str| if name == "tty" { Some(5) } else { None };
        let (_, data) = parse_mount_opts("gid=tty,mode=0620", resolver);
        assert_eq!(data, "gid=5,mode=0620");
        // Numeric gids pass through untouched.
        let (_, data) = parse_mount_opts("gid=42", resolver);
        assert_eq!(data, "gid=42");
        // Unknown names are forwarded for the kernel to reject.
        let (_, data) = parse_mount_opts("gid=nosuch", resolver);
        assert_eq!(data, "gid=nosuch");
    }

    #[test]
    fn test_fstab_parse() {
        let fstab = "# admin overrides\nproc /proc proc ro,nosuid 0 0\n\nshort line\n";
        let entries = parse_fstab(fstab);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].dir, "/proc");
        assert_eq!(entries[0].opts, "ro,nosuid");
    }

    #[test]
    fn test_classify() {
        let requested = vec![
            "/dev".to_string(),
            "/dev/shm".to_string(),
            "/dev/kvm".to_string(),
            "/proc".to_string(),
            "/dev/pts".to_string(),
        ];
        let devices = vec!["/dev/kvm".to_string()];
        let mountpoints = vec!["/proc".to_string(), "/dev/pts".to_string()];

        let out = classify_requested(&requested, &devices, &mountpoints).unwrap();
        assert_eq!(out.devices, vec!["/dev/kvm"]);
        assert_eq!(out.mountpoints, vec!["/proc", "/dev/pts"]);
        assert!(out.dev_pts_mounted);
    }

    #[test]
    fn test_classify_rejects() {
        // Not allowed anywhere.
        assert!(classify_requested(&["/proc".to_string()], &[], &[]).is_err());
        // Listed as both device and mountpoint.
        assert!(classify_requested(
            &["/dev/kvm".to_string()],
            &["/dev/kvm".to_string()],
            &["/dev/kvm".to_string()]
        )
        .is_err());
        // Devices must live under /dev/.
        assert!(classify_requested(
            &["/srv/kvm".to_string()],
            &["/srv/kvm".to_string()],
            &[]
        )
        .is_err());
        // Double slashes and relative paths are refused.
        assert!(classify_requested(&["//proc".to_string()], &[], &[]).is_err());
        assert!(classify_requested(&["proc".to_string()], &[], &[]).is_err());
    }

    #[test]
    fn test_lookup_prefers_user_fstab() {
        let user = vec![MntEnt {
            fsname: "proc".to_string(),
            dir: "/proc".to_string(),
            fstype: "proc".to_string(),
            opts: "rw".to_string(),
        }];
        let defaults = def_fstab();
        let found = lookup_mount_entry("/proc", &user, &defaults).unwrap();
        assert_eq!(found.opts, "rw");
        let found = lookup_mount_entry("/sys", &user, &defaults).unwrap();
        assert_eq!(found.fstype, "sysfs");
        assert!(lookup_mount_entry("/boot", &user, &defaults).is_err());
    }
}
