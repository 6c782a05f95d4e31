//! Terminal handling for the chrootuid parent.

use crate::error::{Error, Result};
use nix::sys::termios::{
    cfmakeraw, tcgetattr, tcsetattr, InputFlags, SetArg, SpecialCharacterIndices, Termios,
};
use parking_lot::Mutex;
use std::os::unix::io::RawFd;

static SAVED_TTY: Mutex<Option<Termios>> = parking_lot::const_mutex(None);

/// Restore the terminal saved by [`init_tty`].  Idempotent; also
/// registered with `atexit` so the fatal paths cannot leave the caller's
/// terminal raw.
pub fn restore_tty() {
    if let Some(saved) = SAVED_TTY.lock().take() {
        let _ = tcsetattr(libc::STDIN_FILENO, SetArg::TCSAFLUSH, &saved);
    }
}

extern "C" fn restore_tty_at_exit() {
    restore_tty();
}

/// Put the caller's terminal into raw mode for pty forwarding.
///
/// Returns true when stdin is a terminal and raw mode was entered.  When
/// stdin is not a terminal there is nothing to do.
pub fn init_tty(use_pty: bool) -> Result<bool> {
    let orig = match tcgetattr(libc::STDIN_FILENO) {
        Ok(termios) => termios,
        // Not a tty.
        Err(_) => return Ok(false),
    };

    if !use_pty {
        return Ok(false);
    }

    *SAVED_TTY.lock() = Some(orig.clone());
    unsafe { libc::atexit(restore_tty_at_exit) };

    let mut raw = orig;
    cfmakeraw(&mut raw);
    raw.input_flags |= InputFlags::IXON;
    raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    tcsetattr(libc::STDIN_FILENO, SetArg::TCSAFLUSH, &raw)
        .map_err(|err| Error::os("tcsetattr", err))?;

    Ok(true)
}

/// Copy the terminal window size from one descriptor to another.
pub fn copy_winsize(from_fd: RawFd, to_fd: RawFd) -> Result<()> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    if unsafe { libc::ioctl(from_fd, libc::TIOCGWINSZ, &mut ws) } < 0 {
        return Err(Error::os("ioctl TIOCGWINSZ", nix::Error::last()));
    }
    if unsafe { libc::ioctl(to_fd, libc::TIOCSWINSZ, &ws) } < 0 {
        return Err(Error::os("ioctl TIOCSWINSZ", nix::Error::last()));
    }
    Ok(())
}

/// Whether a descriptor refers to a terminal.
pub fn is_tty(fd: RawFd) -> bool {
    nix::unistd::isatty(fd).unwrap_or(false)
}
