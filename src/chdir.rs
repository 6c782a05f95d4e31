//! Directory descent with validation.
//!
//! Privileged code never trusts a path it walks: each component is
//! lstat'ed, validated, entered, and lstat'ed again to detect a swap
//! during the descent.

use crate::error::{Error, Result};
use nix::{
    sys::stat::{lstat, FileStat},
    unistd::{chdir, Gid, Uid},
};

/// Ownership/permission policy applied to every directory entered.
#[derive(Debug, Clone, Copy)]
pub enum Validator {
    /// Owner root, no group or world write bits.
    RootOk,
    /// Owner is the caller, group is the first target's gid, no world
    /// write, group write only together with the sticky bit.
    CallerOk { caller_uid: Uid, change_gid1: Gid },
}

impl Validator {
    pub fn check(&self, st: &FileStat, name: &str) -> Result<()> {
        let perms = st.st_mode & 0o7777;
        match *self {
            Validator::RootOk => {
                if st.st_uid != 0 {
                    return Err(Error::config(format!("{}: bad owner: {}", name, st.st_uid)));
                }
                if st.st_mode & (libc::S_IWGRP | libc::S_IWOTH) != 0 {
                    return Err(Error::config(format!("{}: bad perms: {:o}", name, perms)));
                }
            }
            Validator::CallerOk {
                caller_uid,
                change_gid1,
            } => {
                if st.st_uid != caller_uid.as_raw() {
                    return Err(Error::config(format!(
                        "{}: expected owner {}, found owner {}",
                        name,
                        caller_uid,
                        st.st_uid
                    )));
                }
                if st.st_gid != change_gid1.as_raw() {
                    return Err(Error::config(format!(
                        "{}: expected group {}, found group {}",
                        name,
                        change_gid1,
                        st.st_gid
                    )));
                }
                if st.st_mode & libc::S_IWOTH != 0
                    || (st.st_mode & libc::S_IWGRP != 0 && st.st_mode & libc::S_ISVTX == 0)
                {
                    return Err(Error::config(format!("{}: bad perms: {:o}", name, perms)));
                }
            }
        }
        Ok(())
    }
}

/// What changed between two stats of supposedly the same directory.
pub fn is_changed(st1: &FileStat, st2: &FileStat) -> Option<&'static str> {
    if st1.st_dev != st2.st_dev {
        return Some("device number");
    }
    if st1.st_ino != st2.st_ino {
        return Some("inode number");
    }
    if st1.st_rdev != st2.st_rdev {
        return Some("device type");
    }
    if st1.st_mode != st2.st_mode {
        return Some("protection");
    }
    if st1.st_uid != st2.st_uid || st1.st_gid != st2.st_gid {
        return Some("ownership");
    }
    None
}

/// Change the current working directory using the
/// lstat+validate+chdir+lstat+compare technique.
fn safe_chdir_component(name: &str, validator: Validator) -> Result<()> {
    let st1 = lstat(name).map_err(|err| Error::os(format!("lstat: {}", name), err))?;

    if st1.st_mode & libc::S_IFMT != libc::S_IFDIR {
        return Err(Error::os(name.to_string(), nix::Error::ENOTDIR));
    }

    validator.check(&st1, name)?;

    chdir(name).map_err(|err| Error::os(format!("chdir: {}", name), err))?;

    let st2 = lstat(".").map_err(|err| Error::os(format!("lstat: {}", name), err))?;

    if let Some(what) = is_changed(&st1, &st2) {
        return Err(Error::config(format!(
            "{}: {} changed during execution",
            name, what
        )));
    }
    Ok(())
}

/// Change the current working directory with per-component validation.
///
/// An absolute path or a single component is entered in one step; a
/// relative path with slashes is walked one component at a time.
pub fn safe_chdir(path: &str, validator: Validator) -> Result<()> {
    if path.starts_with('/') || !path.contains('/') {
        safe_chdir_component(path, validator)
    } else {
        for elem in path.split('/').filter(|e| !e.is_empty()) {
            safe_chdir_component(elem, validator)?;
        }
        Ok(())
    }
}

/// Check whether file path `prefix` is a prefix of file path `sample`.
pub fn is_path_prefix(prefix: &str, sample: &str) -> bool {
    sample.starts_with(prefix)
        && matches!(sample.as_bytes().get(prefix.len()), None | Some(b'/'))
}

/// Check a working directory against the configured prefix list.
///
/// An empty list admits anything.
pub fn check_prefix_list(cwd: &str, prefixes: &[String], prefix_path: &str) -> Result<()> {
    if prefixes.is_empty() || prefixes.iter().any(|p| is_path_prefix(p, cwd)) {
        return Ok(());
    }
    Err(Error::config(format!(
        "{}: prefix mismatch, working directory should start with one of \
         directories listed in colon-separated prefix list ({})",
        cwd, prefix_path
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_prefix() {
        assert!(is_path_prefix("/home/user", "/home/user"));
        assert!(is_path_prefix("/home/user", "/home/user/chroot"));
        assert!(!is_path_prefix("/home/user", "/home/user2"));
        assert!(!is_path_prefix("/home/user", "/home"));
        // The empty prefix means "any absolute path".
        assert!(is_path_prefix("", "/srv/chr"));
    }

    #[test]
    fn test_prefix_list() {
        let prefixes = vec!["/home/alice".to_string(), "/srv".to_string()];
        assert!(check_prefix_list("/srv/chr", &prefixes, "/home/alice:/srv").is_ok());
        assert!(check_prefix_list("/tmp/x", &prefixes, "/home/alice:/srv").is_err());
        assert!(check_prefix_list("/anywhere", &[], "").is_ok());
    }

    #[test]
    fn test_is_changed_detects_each_field() {
        let st = nix::sys::stat::lstat("/").unwrap();
        assert_eq!(is_changed(&st, &st), None);
        let mut other = st;
        other.st_ino = st.st_ino.wrapping_add(1);
        assert_eq!(is_changed(&st, &other), Some("inode number"));
        let mut other = st;
        other.st_uid = st.st_uid.wrapping_add(1);
        assert_eq!(is_changed(&st, &other), Some("ownership"));
    }

    #[test]
    fn test_safe_chdir_rejects_world_writable() {
        // /tmp is sticky and world-writable, so RootOk must refuse it.
        let cwd = std::env::current_dir().unwrap();
        let result = safe_chdir("/tmp", Validator::RootOk);
        std::env::set_current_dir(&cwd).unwrap();
        assert!(result.is_err());
    }
}
