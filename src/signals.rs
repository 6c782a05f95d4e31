//! Signal handling for the daemon processes.
//!
//! The long-lived loops never install handlers for their lifecycle
//! signals; they block them and read a signalfd from epoll instead.

use crate::error::{Error, Result};
use nix::sys::{
    signal::{sigprocmask, SigHandler, SigSet, SigmaskHow, Signal},
    signalfd::{SfdFlags, SignalFd},
};

/// The five signals every daemon loop handles through its signalfd.
pub fn daemon_signal_set() -> SigSet {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGHUP);
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGQUIT);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGCHLD);
    mask
}

/// Create the daemon signalfd and block its signals for delivery through
/// it.
pub fn create_signal_fd() -> Result<SignalFd> {
    let mask = daemon_signal_set();
    let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .map_err(|err| Error::os("signalfd", err))?;
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&mask), None)
        .map_err(|err| Error::os("sigprocmask", err))?;
    Ok(fd)
}

/// Block or unblock a single signal.
pub fn block_signal(signal: Signal, how: SigmaskHow) -> Result<()> {
    let mut set = SigSet::empty();
    set.add(signal);
    sigprocmask(how, Some(&set), None).map_err(|err| Error::os("sigprocmask", err))
}

/// Unblock every signal, e.g. before handing control to job code.
pub fn unblock_all_signals() -> Result<()> {
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .map_err(|err| Error::os("sigprocmask", err))
}

/// Restore the default disposition of a signal and unblock it.
pub fn dfl_signal(signal: Signal) -> Result<()> {
    unsafe { nix::sys::signal::signal(signal, SigHandler::SigDfl) }
        .map_err(|err| Error::os("signal", err))?;
    block_signal(signal, SigmaskHow::SIG_UNBLOCK)
}

/// Ignore a signal.
pub fn ignore_signal(signal: Signal) -> Result<()> {
    unsafe { nix::sys::signal::signal(signal, SigHandler::SigIgn) }
        .map_err(|err| Error::os("signal", err))?;
    Ok(())
}
