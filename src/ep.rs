//! Helpers for the epoll API.

use crate::error::{Error, Result};
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use std::os::unix::io::{AsRawFd, RawFd};

/// An epoll instance watching descriptors registered for input or hangup.
#[derive(Debug)]
pub struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> Result<Self> {
        let fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|err| Error::os("epoll_create1", err))?;
        Ok(Self { fd })
    }

    /// Watch a descriptor for input.
    pub fn add_in(&self, fd: RawFd) -> Result<()> {
        let mut ev = EpollEvent::new(EpollFlags::EPOLLIN, fd as u64);
        epoll_ctl(self.fd, EpollOp::EpollCtlAdd, fd, &mut ev)
            .map_err(|err| Error::os("epoll_ctl", err))
    }

    /// Watch a descriptor for hangup only; HUP and ERR are implicit.
    pub fn add_hup(&self, fd: RawFd) -> Result<()> {
        let mut ev = EpollEvent::new(EpollFlags::empty(), fd as u64);
        epoll_ctl(self.fd, EpollOp::EpollCtlAdd, fd, &mut ev)
            .map_err(|err| Error::os("epoll_ctl", err))
    }

    /// Wait for events, retrying on EINTR.
    pub fn wait(&self, events: &mut [EpollEvent], timeout_ms: isize) -> Result<usize> {
        loop {
            match epoll_wait(self.fd, events, timeout_ms) {
                Ok(n) => return Ok(n),
                Err(nix::Error::EINTR) => continue,
                Err(err) => return Err(Error::os("epoll_wait", err)),
            }
        }
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::epoll::EpollEvent;
    use nix::unistd::{close, pipe, write};

    #[test]
    fn test_wait_reports_input() {
        let ep = Epoll::new().unwrap();
        let (rd, wr) = pipe().unwrap();
        ep.add_in(rd).unwrap();

        let mut events = [EpollEvent::empty(); 4];
        assert_eq!(ep.wait(&mut events, 0).unwrap(), 0);

        write(wr, b"x").unwrap();
        let n = ep.wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].data(), rd as u64);

        close(rd).unwrap();
        close(wr).unwrap();
    }
}
