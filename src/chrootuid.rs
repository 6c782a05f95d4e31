//! The chrootuid job: run a program inside the caller's chroot as one of
//! the two target users.
//!
//! This is the privileged heart of the daemon: namespace entry, mount
//! and device construction, pty allocation, the final fork into the
//! caller-side multiplexer and the chroot-side child.

use crate::{
    caller::Caller,
    chdir::Validator,
    chid::fchdiruid,
    comm::Connection,
    child::{handle_child, ChildParams},
    config::{CallerConfig, RlimitSpec, Target},
    error::{Error, Result},
    fds, io,
    killuid::spawn_killuid,
    mount, ns,
    net::Fd,
    pty::{open_pty, PtyWhere},
    signals::block_signal,
    unshare,
    x11::{parse_display, ConnectMethod, X11Forward},
};
use nix::{
    fcntl::{open, OFlag},
    sys::signal::{Signal, SigmaskHow},
    sys::stat::Mode,
    unistd::{chroot, fork, setgid, setgroups, setuid, ForkResult, Gid},
};
use std::{
    ffi::CString,
    mem::zeroed,
    os::unix::io::{AsRawFd, IntoRawFd},
};

/// The fixed in-chroot environment of each target identity.
fn fixed_env(which: u8) -> (&'static str, &'static str, &'static str) {
    if which == 1 {
        (
            "HOME=/root",
            "USER=root",
            "PATH=/sbin:/usr/sbin:/bin:/usr/bin",
        )
    } else {
        (
            "HOME=/usr/src",
            "USER=builder",
            "PATH=/bin:/usr/bin:/usr/X11R6/bin",
        )
    }
}

fn set_rlimits(rlimits: &[RlimitSpec]) -> Result<()> {
    for spec in rlimits {
        if spec.hard.is_none() && spec.soft.is_none() {
            continue;
        }

        let mut rlim: libc::rlimit = unsafe { zeroed() };
        if unsafe { libc::getrlimit(spec.resource as _, &mut rlim) } < 0 {
            return Err(Error::os(format!("getrlimit: {}", spec.name), nix::Error::last()));
        }

        if let Some(hard) = spec.hard {
            rlim.rlim_max = hard;
        }
        if let Some(soft) = spec.soft {
            rlim.rlim_cur = soft;
        }
        if rlim.rlim_max < rlim.rlim_cur {
            rlim.rlim_cur = rlim.rlim_max;
        }

        if unsafe { libc::setrlimit(spec.resource as _, &rlim) } < 0 {
            return Err(Error::os(format!("setrlimit: {}", spec.name), nix::Error::last()));
        }
    }
    Ok(())
}

fn clear_dumpable() -> Result<()> {
    // Do not assume that fs.suid_dumpable == 0.
    if unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0) } != 0 {
        return Err(Error::os("prctl PR_SET_DUMPABLE", nix::Error::last()));
    }
    Ok(())
}

struct PtyPair {
    master: Fd,
    slave: Fd,
}

/// Open the pty: unchrooted first because `/dev/ptmx` is always there,
/// then prefer a chrooted pair, which proves a working in-chroot devpts.
fn allocate_pty(caller: &Caller, dev_pts_mounted: bool) -> Result<PtyPair> {
    let outside = match open_pty(caller, PtyWhere::Unchrooted, dev_pts_mounted) {
        Ok((master, slave)) => Some(PtyPair { master, slave }),
        Err(err) => {
            hasher_log::error!("{}", err);
            None
        }
    };

    chroot(".").map_err(|err| Error::os("chroot", err))?;

    let inside = open_pty(caller, PtyWhere::Chrooted, dev_pts_mounted).ok();

    let chosen = match (outside, inside) {
        (Some(out), Some(ins)) => {
            if ins.0.as_raw_fd() > out.master.as_raw_fd() {
                Some(PtyPair {
                    master: ins.0,
                    slave: ins.1,
                })
            } else {
                Some(out)
            }
        }
        (Some(out), None) => Some(out),
        (None, Some((master, slave))) => Some(PtyPair { master, slave }),
        (None, None) => None,
    };

    chosen.ok_or_else(|| Error::config("failed to create pty"))
}

/// Run the full chrootuid sequence and return the child's exit status.
pub fn do_chrootuid(
    caller: &Caller,
    cfg: &mut CallerConfig,
    chroot_fd: Fd,
    argv: Vec<CString>,
    which: u8,
) -> Result<i32> {
    let target1 = cfg
        .target1
        .clone()
        .ok_or_else(|| Error::config("undefined: user1"))?;
    let target2 = cfg
        .target2
        .clone()
        .ok_or_else(|| Error::config("undefined: user2"))?;
    let target: Target = if which == 1 {
        target1.clone()
    } else {
        target2.clone()
    };
    let (ehome, euser, epath) = fixed_env(which);

    // Pre-clean stale processes of the target pair.
    spawn_killuid(&target1, &target2)?;

    // Snapshot the target's supplementary groups, then drop ours.
    let user_c = CString::new(target.name.as_str())?;
    nix::unistd::initgroups(&user_c, target.gid)
        .map_err(|err| Error::os("initgroups", err))?;
    let groups: Vec<Gid> = nix::unistd::getgroups().map_err(|err| Error::os("getgroups", err))?;
    setgroups(&[]).map_err(|err| Error::os("setgroups", err))?;

    // Enter the caller's namespaces where allowed, reject the rest.
    ns::setup_ns(caller.pid, caller.uid)?;

    let caller_ok = Validator::CallerOk {
        caller_uid: caller.uid,
        change_gid1: target1.gid,
    };

    // Enter the chroot directory, detach the mount namespace and reopen
    // the directory inside it.
    fchdiruid(
        chroot_fd.as_raw_fd(),
        caller_ok,
        caller,
        &cfg.prefix_list,
        &cfg.prefix_path,
    )?;
    drop(chroot_fd);
    unshare::unshare_mount()?;
    let chroot_fd = Fd::from(
        open(".", OFlag::O_RDONLY, Mode::empty()).map_err(|err| Error::os("open: .", err))?,
    );

    // Mount all requested mountpoints and set up devices.
    let outcome = mount::setup_mountpoints(caller, cfg, chroot_fd.as_raw_fd())?;

    // Back to the chroot directory after the mount walks.
    fchdiruid(
        chroot_fd.as_raw_fd(),
        caller_ok,
        caller,
        &cfg.prefix_list,
        &cfg.prefix_path,
    )?;
    drop(chroot_fd);

    unsafe {
        libc::endpwent();
        libc::endgrent();
    }

    // Check and sanitize file descriptors again; the log listener is the
    // only extra survivor.
    let mut log_raw = outcome.log_fd.into_raw_fd();
    fds::sanitize_fds(&mut [&mut log_raw])?;
    let log_listen = Fd::from(log_raw);

    // Pipes carry stdout/stderr only when no pty is requested.
    let pipes = if cfg.use_pty {
        None
    } else {
        let out = nix::unistd::pipe().map_err(|err| Error::os("pipe", err))?;
        let err = nix::unistd::pipe().map_err(|err| Error::os("pipe", err))?;
        Some((Fd::from(out.0), Fd::from(out.1), Fd::from(err.0), Fd::from(err.1)))
    };

    // X11 forwarding state and its control channel.
    let forward: Option<X11Forward> = match (&cfg.x11_display, &cfg.x11_key) {
        (Some(display), Some(key)) => parse_display(display, key),
        _ => None,
    };
    if let Some(fwd) = &forward {
        if fwd.method == ConnectMethod::Inet {
            // TCP requires the caller's network namespace.
            cfg.share_caller_network = true;
        }
    }
    let x11_dir_fd = forward.as_ref().and_then(|fwd| fwd.prepare_connect());
    let forward = match forward {
        Some(fwd) if fwd.method == ConnectMethod::Unix && x11_dir_fd.is_none() => None,
        other => other,
    };
    let ctl = if forward.is_some() {
        let (parent_ctl, child_ctl) = Connection::pair()?;
        Some((parent_ctl, child_ctl))
    } else {
        None
    };

    unshare::unshare_ipc(cfg.share_ipc)?;
    unshare::unshare_uts(cfg.share_uts)?;
    if !cfg.share_caller_network {
        unshare::unshare_network(cfg.share_network)?;
    }

    // Always create a pty; the child needs it for TIOCSCTTY.
    let pty = allocate_pty(caller, outcome.dev_pts_mounted)?;

    set_rlimits(&cfg.rlimits)?;

    // Set close-on-exec on all non-standard descriptors.
    fds::cloexec_fds();

    block_signal(Signal::SIGCHLD, SigmaskHow::SIG_BLOCK)?;

    match unsafe { fork() }.map_err(|err| Error::os("fork", err))? {
        ForkResult::Parent { child } => {
            let PtyPair { master, slave } = pty;
            drop(slave);

            let (pipe_out, pipe_err) = match pipes {
                Some((out_rd, out_wr, err_rd, err_wr)) => {
                    drop(out_wr);
                    drop(err_wr);
                    (Some(out_rd), Some(err_rd))
                }
                None => (None, None),
            };

            let (parent_ctl, x11_params) = match (ctl, forward) {
                (Some((parent_ctl, child_ctl)), Some(fwd)) => {
                    drop(child_ctl);
                    let key_hex = cfg.x11_key.clone().unwrap_or_default();
                    (
                        Some(parent_ctl),
                        Some(io::parent::X11Params {
                            forward: fwd,
                            dir_fd: x11_dir_fd,
                            key_hex,
                        }),
                    )
                }
                _ => (None, None),
            };

            clear_dumpable()?;

            setgid(caller.gid).map_err(|err| Error::os("setgid", err))?;
            setuid(caller.uid).map_err(|err| Error::os("setuid", err))?;

            // Process is no longer privileged at this point.

            let params = io::parent::ParentParams {
                pty_master: master,
                pipe_out,
                pipe_err,
                ctl: parent_ctl,
                log_listen,
                x11: x11_params,
            };
            io::parent::handle_parent(child, params, cfg)
        }
        ForkResult::Child => {
            let err = child_branch(
                pty, pipes, ctl, forward, log_listen, x11_dir_fd, cfg, &groups, &target, argv,
                ehome, euser, epath,
            );
            hasher_log::error!("{}", err);
            unsafe { libc::_exit(1) };
        }
    }
}

/// Everything between the chrootuid fork and the final execve; only
/// returns on error.
#[allow(clippy::too_many_arguments)]
fn child_branch(
    pty: PtyPair,
    pipes: Option<(Fd, Fd, Fd, Fd)>,
    ctl: Option<(Connection, Connection)>,
    forward: Option<X11Forward>,
    log_listen: Fd,
    x11_dir_fd: Option<Fd>,
    cfg: &mut CallerConfig,
    groups: &[Gid],
    target: &Target,
    argv: Vec<CString>,
    ehome: &str,
    euser: &str,
    epath: &str,
) -> Error {
    let result = (|| -> Result<Error> {
        let PtyPair { master, slave } = pty;
        drop(master);
        drop(log_listen);
        drop(x11_dir_fd);

        let (pipe_out, pipe_err) = match pipes {
            Some((out_rd, out_wr, err_rd, err_wr)) => {
                drop(out_rd);
                drop(err_rd);
                (Some(out_wr), Some(err_wr))
            }
            None => (None, None),
        };

        let child_ctl = match ctl {
            Some((parent_ctl, child_ctl)) => {
                drop(parent_ctl);
                Some(child_ctl)
            }
            None => None,
        };

        if cfg.share_caller_network {
            // The parent keeps the caller's network for the relays; the
            // child is isolated late.
            unshare::unshare_network(cfg.share_network)?;
        }

        clear_dumpable()?;

        setgroups(groups).map_err(|err| Error::os("setgroups", err))?;
        setgid(target.gid).map_err(|err| Error::os("setgid", err))?;
        setuid(target.uid).map_err(|err| Error::os("setuid", err))?;

        // Process is no longer privileged at this point.

        let data_len = forward.as_ref().map(|f| f.data_len).unwrap_or(0);

        // The child must not leak the real cookie.
        if let Some(key) = cfg.x11_key.as_mut() {
            unsafe { key.as_bytes_mut() }.fill(0);
        }
        cfg.x11_key = None;

        let mut env: Vec<CString> = vec![
            CString::new(ehome)?,
            CString::new(euser)?,
            CString::new(epath)?,
            CString::new(format!("TERM={}", cfg.term.as_deref().unwrap_or("dumb")))?,
        ];
        if forward.is_some() {
            env.push(CString::new("DISPLAY=:10.0")?);
        }

        Ok(handle_child(ChildParams {
            argv,
            env,
            pty_slave: slave,
            pipe_out,
            pipe_err,
            ctl: child_ctl,
            x11_data_len: data_len,
            use_pty: cfg.use_pty,
            nice: cfg.nice,
            nproc: cfg.nproc,
            umask: cfg.umask,
        }))
    })();

    match result {
        Ok(err) | Err(err) => err,
    }
}
