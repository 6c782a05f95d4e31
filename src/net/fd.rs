//! Owned, droppable file descriptors.

use crate::error::{Error, Result};
use derive_more::{From, Into};
use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    unistd::{close, dup},
};
use std::{
    io, mem,
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
};

/// Wrapper for `RawFd` that closes the file descriptor when dropped.
///
/// Descriptors cross process and privilege boundaries constantly in this
/// daemon; each one has exactly one owner at any moment.  `into_raw_fd`
/// transfers ownership out (for `dup2` moves or passing to a child), the
/// `Drop` impl covers every error path.
#[derive(Debug, From, Into)]
pub struct Fd(RawFd);

impl Fd {
    /// Duplicate the file descriptor into an independent `Fd`.
    pub fn duplicate(&self) -> Result<Self> {
        dup(self.0).map(Self::from).map_err(Error::from)
    }

    /// Check if the file descriptor is valid.
    pub fn is_open(&self) -> Result<()> {
        fcntl(self.0, FcntlArg::F_GETFD)
            .map(|_| ())
            .map_err(|err| io::Error::new(io::ErrorKind::NotConnected, err).into())
    }

    /// Set or clear the close-on-exec flag.
    pub fn set_cloexec(&self, add: bool) -> Result<()> {
        let mut flags = FdFlag::from_bits_truncate(fcntl(self.0, FcntlArg::F_GETFD)?);
        flags.set(FdFlag::FD_CLOEXEC, add);
        fcntl(self.0, FcntlArg::F_SETFD(flags))?;
        Ok(())
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.0;
        mem::forget(self);
        fd
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::Fd;
    use nix::fcntl::{fcntl, FcntlArg};
    use std::os::unix::io::{AsRawFd, IntoRawFd};

    #[test]
    fn test_drop_closes() {
        let (a, b) = nix::unistd::pipe().unwrap();
        let _keep = Fd::from(b);
        let raw = {
            let fd = Fd::from(a);
            fd.is_open().unwrap();
            fd.as_raw_fd()
        };
        assert!(fcntl(raw, FcntlArg::F_GETFD).is_err());
    }

    #[test]
    fn test_into_raw_fd_leaks_ownership() {
        let (a, b) = nix::unistd::pipe().unwrap();
        let _keep = Fd::from(b);
        let raw = Fd::from(a).into_raw_fd();
        assert!(fcntl(raw, FcntlArg::F_GETFD).is_ok());
        nix::unistd::close(raw).unwrap();
    }
}
