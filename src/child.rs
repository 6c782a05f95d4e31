//! The chrootuid child: the process that becomes the requested program
//! inside the chroot.
//!
//! Runs with the target user's credentials, inside every namespace the
//! job set up.  Everything here happens between fork and execve; any
//! failure exits with a diagnostic.

use crate::{
    comm::Connection,
    error::{Error, Result},
    fds::nullify_stdin,
    net::Fd,
    signals::{block_signal, dfl_signal},
    tty::is_tty,
    x11::{bytes_to_hex, x11_listen},
};
use nix::{
    sched::{sched_getaffinity, sched_setaffinity, CpuSet},
    sys::signal::{SigmaskHow, Signal},
    sys::wait::{waitpid, WaitStatus},
    unistd::{dup2, execve, fork, getpid, setsid, ForkResult, Pid},
};
use std::{
    ffi::CString,
    os::unix::io::{AsRawFd, IntoRawFd},
};

/// Everything the child needs after the fork.
pub struct ChildParams {
    pub argv: Vec<CString>,
    pub env: Vec<CString>,
    pub pty_slave: Fd,
    pub pipe_out: Option<Fd>,
    pub pipe_err: Option<Fd>,
    pub ctl: Option<Connection>,
    pub x11_data_len: usize,
    pub use_pty: bool,
    pub nice: i32,
    pub nproc: usize,
    pub umask: libc::mode_t,
}

fn connect_fds(pty_slave: Fd, pipe_out: Option<Fd>, pipe_err: Option<Fd>, use_pty: bool) -> Result<()> {
    setsid().map_err(|err| Error::os("setsid", err))?;

    let pty_fd = pty_slave.into_raw_fd();
    if unsafe { libc::ioctl(pty_fd, libc::TIOCSCTTY, 0) } < 0 {
        return Err(Error::os("ioctl TIOCSCTTY", nix::Error::last()));
    }

    let out_fd = pipe_out.map(IntoRawFd::into_raw_fd);
    let err_fd = pipe_err.map(IntoRawFd::into_raw_fd);

    if use_pty {
        dup2(pty_fd, libc::STDIN_FILENO).map_err(|err| Error::os("dup2", err))?;
    } else if is_tty(libc::STDIN_FILENO) {
        // Without a pty the child must see EOF, not the terminal.
        nullify_stdin()?;
    }

    let stdout_src = if use_pty { pty_fd } else { out_fd.unwrap_or(pty_fd) };
    let stderr_src = if use_pty { pty_fd } else { err_fd.unwrap_or(pty_fd) };
    dup2(stdout_src, libc::STDOUT_FILENO).map_err(|err| Error::os("dup2", err))?;
    dup2(stderr_src, libc::STDERR_FILENO).map_err(|err| Error::os("dup2", err))?;

    for fd in [Some(pty_fd), out_fd, err_fd].iter().flatten() {
        if *fd > libc::STDERR_FILENO {
            let _ = nix::unistd::close(*fd);
        }
    }
    Ok(())
}

fn read_urandom(len: usize) -> Result<Vec<u8>> {
    use nix::fcntl::{open, OFlag};
    use nix::sys::stat::Mode;

    let fd = open("/dev/urandom", OFlag::O_RDONLY, Mode::empty())
        .map_err(|err| Error::os("open: /dev/urandom", err))?;
    let fd = Fd::from(fd);

    let mut data = vec![0u8; len];
    let mut off = 0;
    while off < len {
        match nix::unistd::read(fd.as_raw_fd(), &mut data[off..]) {
            Ok(0) => return Err(Error::os("read: /dev/urandom", nix::Error::EIO)),
            Ok(n) => off += n,
            Err(nix::Error::EINTR) => continue,
            Err(err) => return Err(Error::os("read: /dev/urandom", err)),
        }
    }
    Ok(data)
}

/// Register the fake cookie for display `:10` with xauth so programs
/// inside the chroot find a valid entry.
fn xauth_add_entry(env: &[CString], key_hex: &str) -> Result<()> {
    const PATHS: [&str; 2] = ["/usr/bin/xauth", "/usr/X11R6/bin/xauth"];

    match unsafe { fork() }.map_err(|err| Error::os("fork", err))? {
        ForkResult::Child => {
            let argv = [
                CString::new("xauth").unwrap(),
                CString::new("add").unwrap(),
                CString::new(":10.0").unwrap(),
                CString::new(".").unwrap(),
                CString::new(key_hex).unwrap(),
            ];
            for path in &PATHS {
                if let Ok(path) = CString::new(*path) {
                    let _ = execve(&path, &argv, env);
                }
            }
            unsafe { libc::_exit(1) };
        }
        ForkResult::Parent { child } => loop {
            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, 0)) => return Ok(()),
                Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => {
                    return Err(Error::config("xauth failed"));
                }
                Err(nix::Error::EINTR) => continue,
                Ok(_) => continue,
                Err(err) => return Err(Error::os("waitpid", err)),
            }
        },
    }
}

/// Restrict the CPU affinity to `nproc` CPUs picked from the current
/// mask by a pid-seeded shuffle.
fn set_affinity_nproc(nproc: usize) -> Result<()> {
    if nproc == 0 {
        return Ok(());
    }

    let current = sched_getaffinity(Pid::from_raw(0)).map_err(|err| Error::os("sched_getaffinity", err))?;

    let cpus: Vec<usize> = (0..CpuSet::count())
        .filter(|&i| current.is_set(i).unwrap_or(false))
        .collect();
    if cpus.len() <= nproc {
        return Ok(());
    }

    // Shuffle a nproc-wide selection across the available CPUs.
    let mut picked = vec![false; cpus.len()];
    for slot in picked.iter_mut().take(nproc) {
        *slot = true;
    }
    let mut seed = getpid().as_raw() as u64;
    for i in 0..nproc {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let j = ((seed >> 33) as usize) % cpus.len();
        picked.swap(i, j);
    }

    let mut restricted = CpuSet::new();
    for (slot, cpu) in picked.iter().zip(cpus.iter()) {
        if *slot {
            restricted
                .set(*cpu)
                .map_err(|err| Error::os("cpu set", err))?;
        }
    }

    sched_setaffinity(Pid::from_raw(0), &restricted)
        .map_err(|err| Error::os("sched_setaffinity", err))
}

/// Final setup and exec of the requested program.  Only returns on error.
pub fn handle_child(params: ChildParams) -> Error {
    let ChildParams {
        argv,
        env,
        pty_slave,
        pipe_out,
        pipe_err,
        ctl,
        x11_data_len,
        use_pty,
        nice,
        nproc,
        umask,
    } = params;

    if let Err(err) = connect_fds(pty_slave, pipe_out, pipe_err, use_pty) {
        return err;
    }

    for signal in [Signal::SIGHUP, Signal::SIGPIPE, Signal::SIGTERM] {
        if let Err(err) = dfl_signal(signal) {
            return err;
        }
    }

    // nice(2) may legitimately return a negative niceness; only a real
    // errno is a failure.
    unsafe { *libc::__errno_location() = 0 };
    if unsafe { libc::nice(nice) } < 0 {
        let errno = unsafe { *libc::__errno_location() };
        if errno != 0 {
            return Error::os(format!("nice: {}", nice), nix::Error::from_i32(errno));
        }
    }

    if let Err(err) = set_affinity_nproc(nproc) {
        return err;
    }

    if let Some(ctl) = ctl {
        match x11_listen() {
            Ok(x11_fd) => {
                let handshake = read_urandom(x11_data_len).and_then(|fake| {
                    let key_hex = bytes_to_hex(&fake);
                    xauth_add_entry(&env, &key_hex)?;
                    ctl.fd_send(&[x11_fd.as_raw_fd()], &fake)
                });
                if let Err(err) = handshake {
                    hasher_log::error!("X11 listen setup failed: {}", err);
                }
            }
            Err(err) => {
                hasher_log::error!("X11 listen failed: {}", err);
            }
        }
    }

    nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(umask));

    if let Err(err) = block_signal(Signal::SIGCHLD, SigmaskHow::SIG_UNBLOCK) {
        return err;
    }

    let program = argv[0].clone();
    match execve(&program, &argv, &env) {
        Ok(_) => unreachable!(),
        Err(err) => Error::os(format!("execve: {}", program.to_string_lossy()), err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affinity_noop_without_nproc() {
        set_affinity_nproc(0).unwrap();
    }
}
