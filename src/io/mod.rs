//! The chrootuid parent's I/O machinery: the multiplexer itself, the
//! in-chroot log stream readers, and the X11 relays.

pub mod log;
pub mod parent;
pub mod x11;

use crate::error::{Error, Result};
use std::os::unix::io::RawFd;

/// Byte counters charged against the work limits.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    /// Bytes read from the caller and delivered to the child.
    pub bytes_read: u64,
    /// Bytes written back to the caller.
    pub bytes_written: u64,
}

/// Read once, retrying on EINTR.
pub fn read_retry(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    loop {
        match nix::unistd::read(fd, buf) {
            Err(nix::Error::EINTR) => continue,
            other => return other,
        }
    }
}

/// Write the whole buffer, retrying on EINTR and short writes.
pub fn write_loop(fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
    let mut off = 0;
    while off < buf.len() {
        match nix::unistd::write(fd, &buf[off..]) {
            Ok(0) => break,
            Ok(n) => off += n,
            Err(nix::Error::EINTR) => continue,
            Err(err) => {
                if off > 0 {
                    return Ok(off);
                }
                return Err(err);
            }
        }
    }
    Ok(off)
}

/// Write everything to the caller, charging `bytes_written`.
pub fn xwrite_all(fd: RawFd, buf: &[u8], counters: &mut Counters) -> Result<()> {
    let n = write_loop(fd, buf).map_err(|err| Error::os("write", err))?;
    if n != buf.len() {
        return Err(Error::os("write", nix::Error::EIO));
    }
    counters.bytes_written += n as u64;
    Ok(())
}
