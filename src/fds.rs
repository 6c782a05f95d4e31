//! File descriptor sanitization.
//!
//! Runs at every privilege transition: the standard descriptors must be
//! open, descriptors that should survive are reordered to the lowest free
//! slots, and everything else is closed.  Just before `execve` in the
//! chrootuid path, every non-standard descriptor is marked close-on-exec
//! instead.

use crate::error::{Error, Result};
use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    sys::stat::{fstat, umask, Mode},
    unistd::dup2,
};
use std::os::unix::io::RawFd;

/// Check stdin/stdout/stderr, reorder the descriptors that should stay
/// open right above them, and close everything else.
///
/// `keep` holds the descriptors to preserve; each entry is rewritten with
/// its new position.
pub fn sanitize_fds(keep: &mut [&mut RawFd]) -> Result<()> {
    // Safe umask, just in case.
    umask(Mode::from_bits_truncate(0o077));

    for fd in 0..=2 {
        fstat(fd).map_err(|err| Error::os(format!("fstat: {}", fd), err))?;
    }

    let mut next: RawFd = 3;
    for target in keep.iter_mut() {
        if **target < 0 {
            continue;
        }
        if **target > next {
            dup2(**target, next).map_err(|err| Error::os("dup2", err))?;
            // The old descriptor is closed by the sweep below.
            **target = next;
        }
        next += 1;
    }

    unsafe { close_fds::close_open_fds(next, &[]) };
    Ok(())
}

/// Set the close-on-exec flag on every non-standard descriptor.
pub fn cloexec_fds() {
    close_fds::set_fds_cloexec(3, &[]);
}

/// Switch a descriptor to non-blocking mode.
pub fn unblock_fd(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|err| Error::os("fcntl F_GETFL", err))?;
    let newflags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    if flags != newflags.bits() {
        fcntl(fd, FcntlArg::F_SETFL(newflags)).map_err(|err| Error::os("fcntl F_SETFL", err))?;
    }
    Ok(())
}

/// Replace stdin with the read end of a pipe whose write end is closed.
///
/// A read from the result ends with EOF and a write is rejected with
/// EBADF, so the child never sees the caller's terminal.
pub fn nullify_stdin() -> Result<()> {
    let (read_end, write_end) = nix::unistd::pipe().map_err(|err| Error::os("pipe", err))?;
    nix::unistd::close(write_end).map_err(|err| Error::os("close", err))?;

    if read_end != 0 {
        dup2(read_end, 0).map_err(|err| Error::os("dup2", err))?;
        nix::unistd::close(read_end).map_err(|err| Error::os("close", err))?;
    }
    Ok(())
}

/// Move a descriptor onto a specific slot, closing the source.
pub fn move_fd(fd: RawFd, target: RawFd) -> Result<()> {
    if fd == target {
        return Ok(());
    }
    dup2(fd, target).map_err(|err| Error::os(format!("dup2({}, {})", fd, target), err))?;
    let _ = nix::unistd::close(fd);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{close, pipe, read, write};

    #[test]
    fn test_move_fd() {
        let (rd, wr) = pipe().unwrap();
        let (spare_rd, spare_wr) = pipe().unwrap();
        close(spare_wr).unwrap();

        // Move the write end onto the spare slot and check it still works.
        move_fd(wr, spare_rd).unwrap();
        write(spare_rd, b"y").unwrap();
        let mut buf = [0u8; 1];
        read(rd, &mut buf).unwrap();
        assert_eq!(&buf, b"y");

        close(rd).unwrap();
        close(spare_rd).unwrap();
    }

    #[test]
    fn test_unblock_fd() {
        let (rd, wr) = pipe().unwrap();
        unblock_fd(rd).unwrap();
        let flags = fcntl(rd, FcntlArg::F_GETFL).unwrap();
        assert!(OFlag::from_bits_truncate(flags).contains(OFlag::O_NONBLOCK));
        close(rd).unwrap();
        close(wr).unwrap();
    }
}
