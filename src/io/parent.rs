//! The chrootuid parent: multiplexes stdin/stdout/stderr, the in-chroot
//! log stream and forwarded X11 traffic between the sandboxed child and
//! the original caller, under the configured work limits.
//!
//! Runs with caller privileges; the child is on the other side of the
//! pty master or the stdout/stderr pipes.

use crate::{
    comm::Connection,
    config::{CallerConfig, WorkLimits},
    error::{Error, Result},
    fds::{nullify_stdin, unblock_fd},
    io::{log::LogReaders, read_retry, write_loop, x11::X11Relays, xwrite_all, Counters},
    net::Fd,
    signals::block_signal,
    tty::{copy_winsize, init_tty, is_tty, restore_tty},
    x11::{hex_to_bytes, x11_check_listen, X11Forward},
    BUF_SIZE,
};
use bytes::{Buf, BytesMut};
use nix::{
    sys::select::{pselect, FdSet},
    sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal},
    sys::time::TimeSpec,
    unistd::Pid,
};
use std::{
    os::unix::io::{AsRawFd, RawFd},
    sync::atomic::{AtomicBool, AtomicI32, Ordering},
};

static CHILD_PID: AtomicI32 = AtomicI32::new(0);
static CHILD_RC: AtomicI32 = AtomicI32::new(0);
static SIGALRM_ARRIVED: AtomicBool = AtomicBool::new(false);
static SIGWINCH_ARRIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn sigalrm_handler(_: libc::c_int) {
    SIGALRM_ARRIVED.store(true, Ordering::SeqCst);
}

extern "C" fn sigwinch_handler(_: libc::c_int) {
    SIGWINCH_ARRIVED.store(true, Ordering::SeqCst);
}

extern "C" fn sigchld_handler(_: libc::c_int) {
    // Handle only one child.
    let child = CHILD_PID.swap(0, Ordering::SeqCst);
    if child == 0 {
        return;
    }

    let mut status: libc::c_int = 0;
    loop {
        let pid = unsafe { libc::waitpid(child, &mut status, 0) };
        if pid == child {
            break;
        }
        if pid < 0 && nix::Error::last() == nix::Error::EINTR {
            continue;
        }
        return;
    }

    if libc::WIFEXITED(status) {
        CHILD_RC.store(libc::WEXITSTATUS(status), Ordering::SeqCst);
    } else if libc::WIFSIGNALED(status) {
        CHILD_RC.store(128 + libc::WTERMSIG(status), Ordering::SeqCst);
    } else {
        CHILD_RC.store(255, Ordering::SeqCst);
    }
}

fn setup_sigchld_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(sigchld_handler),
        SaFlags::SA_NOCLDSTOP | SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &action) }.map_err(|err| Error::os("sigaction", err))?;
    Ok(())
}

fn setup_timer(seconds: u64) -> Result<()> {
    block_signal(Signal::SIGALRM, SigmaskHow::SIG_BLOCK)?;
    let action = SigAction::new(
        SigHandler::Handler(sigalrm_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGALRM, &action) }.map_err(|err| Error::os("sigaction", err))?;
    nix::unistd::alarm::set(seconds as libc::c_uint);
    Ok(())
}

fn setup_sigwinch_handler() -> Result<()> {
    block_signal(Signal::SIGWINCH, SigmaskHow::SIG_BLOCK)?;
    let action = SigAction::new(
        SigHandler::Handler(sigwinch_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGWINCH, &action) }.map_err(|err| Error::os("sigaction", err))?;
    Ok(())
}

/// Caller-facing and child-facing descriptors of the standard streams.
struct IoStd {
    master_read: Option<RawFd>,
    master_write_out: RawFd,
    master_write_err: Option<RawFd>,
    slave_read_out: Option<RawFd>,
    slave_read_err: Option<RawFd>,
    slave_write: Option<RawFd>,
    /// Caller input waiting to be delivered to the child.
    pending_input: BytesMut,
}

/// Everything the multiplexer needs besides the job descriptors.
pub struct ParentParams {
    pub pty_master: Fd,
    pub pipe_out: Option<Fd>,
    pub pipe_err: Option<Fd>,
    pub ctl: Option<Connection>,
    pub log_listen: Fd,
    pub x11: Option<X11Params>,
}

/// X11 forwarding state the parent starts with.
pub struct X11Params {
    pub forward: X11Forward,
    pub dir_fd: Option<Fd>,
    /// The real cookie, still in hex.
    pub key_hex: String,
}

fn limit_exceeded(message: &str) -> ! {
    // The child is on its own now; it receives HUP when the pty closes.
    CHILD_PID.store(0, Ordering::SeqCst);
    restore_tty();
    eprintln!();
    hasher_log::error!("{}", message);
    std::process::exit(128 + libc::SIGTERM);
}

fn work_limits_ok(wlimits: &WorkLimits, counters: &Counters) {
    if SIGALRM_ARRIVED.load(Ordering::SeqCst) {
        limit_exceeded(&format!(
            "time elapsed limit ({} seconds) exceeded",
            wlimits.time_elapsed
        ));
    }
    if wlimits.bytes_read > 0 && counters.bytes_read >= wlimits.bytes_read {
        limit_exceeded(&format!(
            "bytes read limit ({} bytes) exceeded",
            wlimits.bytes_read
        ));
    }
    if wlimits.bytes_written > 0 && counters.bytes_written >= wlimits.bytes_written {
        limit_exceeded(&format!(
            "bytes written limit ({} bytes) exceeded",
            wlimits.bytes_written
        ));
    }
}

/// Receive the fake cookie and the in-chroot listener over the control
/// channel and validate both.
fn handle_x11_ctl(ctl: &Connection, key_hex: &str, data_len: usize) -> Result<(Fd, Vec<u8>, Vec<u8>)> {
    let saved = hex_to_bytes(key_hex)
        .ok_or_else(|| Error::config("invalid X11 authentication data"))?;

    let (mut fds, fake) = ctl.fd_recv(1, data_len)?;
    let listen_fd = fds.pop().ok_or_else(|| Error::protocol("no descriptor"))?;

    x11_check_listen(&listen_fd)?;

    if saved == fake {
        return Err(Error::config("invalid X11 fake authentication data"));
    }

    Ok((listen_fd, saved, fake))
}

/// Run the multiplexer until the child is gone and all streams are
/// drained; returns the child's recorded exit status.
pub fn handle_parent(child: Pid, params: ParentParams, cfg: &CallerConfig) -> Result<i32> {
    let use_pty = cfg.use_pty;
    let wlimits = cfg.wlimits;

    CHILD_RC.store(0, Ordering::SeqCst);
    CHILD_PID.store(child.as_raw(), Ordering::SeqCst);

    setup_sigchld_handler()?;

    let pty_fd = params.pty_master;
    let pipe_out = params.pipe_out;
    let pipe_err = params.pipe_err;
    let mut ctl = params.ctl;
    let log_listen = params.log_listen;
    let mut x11_params = params.x11;
    let mut x11_listen: Option<Fd> = None;

    let mut io = IoStd {
        master_read: if use_pty { Some(libc::STDIN_FILENO) } else { None },
        master_write_out: libc::STDOUT_FILENO,
        master_write_err: if use_pty { None } else { Some(libc::STDERR_FILENO) },
        slave_read_out: if use_pty {
            Some(pty_fd.as_raw_fd())
        } else {
            pipe_out.as_ref().map(|fd| fd.as_raw_fd())
        },
        slave_read_err: if use_pty {
            None
        } else {
            pipe_err.as_ref().map(|fd| fd.as_raw_fd())
        },
        slave_write: if use_pty { Some(pty_fd.as_raw_fd()) } else { None },
        pending_input: BytesMut::new(),
    };

    unblock_fd(pty_fd.as_raw_fd())?;
    if let Some(fd) = pipe_out.as_ref() {
        unblock_fd(fd.as_raw_fd())?;
    }
    if let Some(fd) = pipe_err.as_ref() {
        unblock_fd(fd.as_raw_fd())?;
    }

    // Raw mode on the caller's terminal, or EOF for the child's stdin.
    if is_tty(libc::STDIN_FILENO) {
        if init_tty(use_pty)? {
            if copy_winsize(libc::STDIN_FILENO, pty_fd.as_raw_fd()).is_ok() {
                setup_sigwinch_handler()?;
            }
        } else if !use_pty {
            nullify_stdin()?;
        }
    }

    if wlimits.time_elapsed > 0 {
        setup_timer(wlimits.time_elapsed)?;
    }

    let mut counters = Counters::default();
    let mut log_readers = LogReaders::default();
    let mut relays = X11Relays::default();

    loop {
        work_limits_ok(&wlimits, &counters);

        if SIGWINCH_ARRIVED.swap(false, Ordering::SeqCst) {
            let _ = copy_winsize(libc::STDIN_FILENO, pty_fd.as_raw_fd());
        }

        let mut read_fds = FdSet::new();
        let mut write_fds = FdSet::new();

        // Child output, log and X11 descriptors are drained even after
        // the child completed.
        if let Some(fd) = io.slave_read_out {
            read_fds.insert(fd);
        }
        if let Some(fd) = io.slave_read_err {
            read_fds.insert(fd);
        }
        log_readers.add_fds(&mut read_fds);
        relays.add_fds(&mut read_fds, &mut write_fds);

        let child_alive = CHILD_PID.load(Ordering::SeqCst) != 0;
        if child_alive {
            // Child input and the listeners are only interesting while
            // the child process is alive.
            if !io.pending_input.is_empty() {
                if let Some(fd) = io.slave_write {
                    write_fds.insert(fd);
                }
            } else if let Some(fd) = io.master_read {
                read_fds.insert(fd);
            }

            read_fds.insert(log_listen.as_raw_fd());
            if let Some(ctl) = ctl.as_ref() {
                read_fds.insert(ctl.as_raw_fd());
            }
            if let Some(fd) = x11_listen.as_ref() {
                read_fds.insert(fd.as_raw_fd());
            }
        } else if io.slave_read_out.is_none()
            && io.slave_read_err.is_none()
            && log_readers.is_empty()
            && relays.is_empty()
        {
            break;
        }

        let timeout = if wlimits.time_idle > 0 {
            Some(TimeSpec::new(wlimits.time_idle as i64, 0))
        } else {
            None
        };

        let empty_mask = SigSet::empty();
        let rc = pselect(
            None,
            Some(&mut read_fds),
            Some(&mut write_fds),
            None,
            timeout.as_ref(),
            Some(&empty_mask),
        );
        match rc {
            Ok(0) => {
                limit_exceeded(&format!(
                    "idle time limit ({} seconds) exceeded",
                    wlimits.time_idle
                ));
            }
            Ok(_) => {}
            Err(nix::Error::EINTR) => continue,
            Err(err) => return Err(Error::os("pselect", err)),
        }

        // Child stderr.
        if let Some(fd) = io.slave_read_err {
            if read_fds.contains(fd) {
                let mut buf = [0u8; BUF_SIZE];
                match read_retry(fd, &mut buf) {
                    Ok(n) if n > 0 => {
                        if let Some(out) = io.master_write_err {
                            xwrite_all(out, &buf[..n], &mut counters)?;
                        }
                    }
                    _ => io.slave_read_err = None,
                }
            }
        }

        // Child stdout.
        if let Some(fd) = io.slave_read_out {
            if read_fds.contains(fd) {
                let mut buf = [0u8; BUF_SIZE];
                match read_retry(fd, &mut buf) {
                    Ok(n) if n > 0 => {
                        xwrite_all(io.master_write_out, &buf[..n], &mut counters)?;
                    }
                    _ => io.slave_read_out = None,
                }
            }
        }

        // Child input.
        if !io.pending_input.is_empty() {
            if let Some(fd) = io.slave_write {
                if write_fds.contains(fd) {
                    match write_loop(fd, &io.pending_input) {
                        Ok(n) if n > 0 => {
                            counters.bytes_read += n as u64;
                            io.pending_input.advance(n);
                        }
                        _ => break,
                    }
                }
            }
        }

        // Caller input.
        if io.pending_input.is_empty() {
            if let Some(fd) = io.master_read {
                if read_fds.contains(fd) {
                    let mut buf = [0u8; BUF_SIZE];
                    match read_retry(fd, &mut buf) {
                        Ok(0) => {
                            // EOF from the caller's terminal becomes an
                            // end-of-transmission byte for the child.
                            io.pending_input.extend_from_slice(&[0x04]);
                        }
                        Ok(n) => io.pending_input.extend_from_slice(&buf[..n]),
                        Err(_) => io.master_read = None,
                    }
                }
            }
        }

        relays.handle_select(&read_fds, &write_fds)?;
        if let (Some(listen), Some(x11)) = (x11_listen.as_ref(), x11_params.as_ref()) {
            relays.handle_new(listen, &read_fds, &x11.forward, x11.dir_fd.as_ref());
        }

        log_readers.handle_select(&read_fds, &mut counters)?;
        log_readers.handle_new(&log_listen, &read_fds);

        // The one-shot control handshake delivering the X11 listener.
        let ctl_ready = ctl
            .as_ref()
            .map(|control| read_fds.contains(control.as_raw_fd()))
            .unwrap_or(false);
        if ctl_ready {
            let control = match ctl.take() {
                Some(control) => control,
                None => continue,
            };
            let outcome = x11_params
                .as_ref()
                .ok_or_else(|| Error::protocol("control data without X11 forwarding"))
                .and_then(|x11| handle_x11_ctl(&control, &x11.key_hex, x11.forward.data_len));
            match outcome {
                Ok((listen_fd, saved, fake)) => {
                    relays.set_keys(saved, fake);
                    x11_listen = Some(listen_fd);
                }
                Err(err) => {
                    hasher_log::error!("{}\r", err);
                    hasher_log::error!("X11 forwarding disabled\r");
                    x11_params = None;
                }
            }
        }
    }

    // Close the pty master, sending HUP to the child's session.
    drop(pty_fd);

    let _ = crate::signals::dfl_signal(Signal::SIGWINCH);

    // Give the child a moment to be reaped through the handler.
    block_signal(Signal::SIGCHLD, SigmaskHow::SIG_UNBLOCK)?;
    for _ in 0..10 {
        if CHILD_PID.load(Ordering::SeqCst) == 0 {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    let _ = crate::signals::dfl_signal(Signal::SIGCHLD);
    if CHILD_PID.swap(0, Ordering::SeqCst) != 0 {
        // No need to kill: it gets HUP from the closed pty anyway.
        CHILD_RC.store(128 + libc::SIGTERM, Ordering::SeqCst);
    }

    restore_tty();
    Ok(CHILD_RC.load(Ordering::SeqCst))
}
