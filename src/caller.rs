//! Caller identity.
//!
//! The local-socket peer credentials are trusted for uid/gid/pid and then
//! cross-checked against the password database before any configuration
//! is loaded on the caller's behalf.

use crate::{
    error::{Error, Result},
    MIN_CHANGE_GID, MIN_CHANGE_UID,
};
use nix::unistd::{Gid, Uid, User};
use std::path::PathBuf;

/// The validated identity of the unprivileged user a session serves.
#[derive(Debug, Clone)]
pub struct Caller {
    pub uid: Uid,
    pub gid: Gid,
    pub user: String,
    pub home: PathBuf,
    /// Subconfig number from `OPEN_SESSION`.
    pub num: u32,
    /// Pid of the currently connected client; refreshed per connection.
    pub pid: libc::pid_t,
}

impl Caller {
    /// Resolve and validate the caller from peer credentials.
    pub fn from_creds(uid: libc::uid_t, gid: libc::gid_t, num: u32) -> Result<Self> {
        let uid = Uid::from_raw(uid);
        let gid = Gid::from_raw(gid);

        let pw = User::from_uid(uid)
            .map_err(|err| Error::os("caller lookup", err))?
            .ok_or_else(|| Error::auth("caller lookup failure"))?;

        if pw.uid != uid {
            return Err(Error::auth(format!("caller {}: uid mismatch", pw.name)));
        }
        if pw.gid != gid {
            return Err(Error::auth(format!("caller {}: gid mismatch", pw.name)));
        }

        if !pw.dir.is_absolute() {
            return Err(Error::auth(format!("caller {}: invalid home", pw.name)));
        }
        let home = std::fs::canonicalize(&pw.dir)
            .map_err(|_| Error::auth(format!("caller {}: invalid home", pw.name)))?;
        if !home.is_absolute() {
            return Err(Error::auth(format!("caller {}: invalid home", pw.name)));
        }

        Ok(Caller {
            uid,
            gid,
            user: pw.name,
            home,
            num,
            pid: 0,
        })
    }
}

/// A uid acceptable for the caller or a target user.
pub fn valid_uid(uid: libc::uid_t) -> bool {
    uid >= MIN_CHANGE_UID
}

/// A gid acceptable for the caller or a target user.
pub fn valid_gid(gid: libc::gid_t) -> bool {
    gid >= MIN_CHANGE_GID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_bounds() {
        assert!(!valid_uid(0));
        assert!(!valid_uid(MIN_CHANGE_UID - 1));
        assert!(valid_uid(MIN_CHANGE_UID));
        assert!(valid_gid(MIN_CHANGE_GID));
        assert!(!valid_gid(MIN_CHANGE_GID - 1));
    }
}
