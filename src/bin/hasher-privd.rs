//! The hasher-privd server: listens on the well-known socket,
//! authenticates callers by their socket credentials and forks one
//! session server per (caller uid, subconfig number).

use clap::Parser;
use hasher_priv::{
    caller::Caller,
    comm::{srv_accept, srv_listen, Connection, CMD_OPEN_SESSION, CMD_STATUS_DONE, CMD_STATUS_FAILED},
    config::DaemonConfig,
    ep::Epoll,
    error::{Error, Result},
    fds::sanitize_fds,
    net::Fd,
    pidfile::{check_pid, Pidfile},
    session::run_session_server,
    signals::{create_signal_fd, ignore_signal},
    MAIN_SOCKET_NAME, SOCKET_DIR,
};
use nix::{
    sys::signal::Signal,
    sys::signalfd::SignalFd,
    sys::stat::{umask, Mode},
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::{chown, fork, getgid, getuid, ForkResult, Gid, Pid, Uid},
};
use std::{
    os::unix::io::{AsRawFd, RawFd},
    path::{Path, PathBuf},
};

#[derive(Debug, Parser)]
#[command(
    name = "hasher-privd",
    about = "Privileged helper daemon for sandboxed package builds"
)]
struct Args {
    /// Run in the background.
    #[arg(short = 'D', long)]
    daemonize: bool,

    /// Set the minimal log level.
    #[arg(short = 'l', long, value_name = "LEVEL")]
    loglevel: Option<String>,

    /// Set the pid file location.
    #[arg(short = 'p', long, value_name = "FILE")]
    pidfile: Option<PathBuf>,
}

/// One live session server.
struct Session {
    caller_uid: libc::uid_t,
    caller_num: u32,
    server_pid: Pid,
}

struct Daemon {
    cfg: DaemonConfig,
    sessions: Vec<Session>,
    /// Write end closed on shutdown to wake every session server.
    shutdown_wr: Option<Fd>,
    shutdown_rd: Fd,
    listen: Fd,
    signal: SignalFd,
    ep: Epoll,
}

fn create_socket_node(access_gid: Gid) -> Result<Fd> {
    let path = Path::new(SOCKET_DIR).join(MAIN_SOCKET_NAME);

    let saved = umask(Mode::from_bits_truncate(0o017));
    let listen = srv_listen(&path);
    umask(saved);
    let listen = listen?;

    chown(&path, Some(Uid::from_raw(0)), Some(access_gid))
        .map_err(|err| Error::os(format!("chown: {}", path.display()), err))?;

    hasher_log::info!("listening on {}", path.display());
    Ok(listen)
}

fn wait_sessions(daemon: &mut Daemon, flags: Option<WaitPidFlag>) {
    loop {
        match waitpid(None, flags) {
            Ok(WaitStatus::Exited(pid, rc)) => {
                if rc != 0 {
                    hasher_log::warn!("process {} exited, status={}", pid, rc);
                } else {
                    hasher_log::info!("process {} exited", pid);
                }
                daemon.sessions.retain(|s| s.server_pid != pid);
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                hasher_log::warn!("process {} terminated by signal {}", pid, signal);
                daemon.sessions.retain(|s| s.server_pid != pid);
            }
            Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => break,
            Ok(_) => continue,
            Err(nix::Error::EINTR) => continue,
            Err(err) => {
                hasher_log::error!("waitpid: {}", err);
                break;
            }
        }
    }
}

fn start_session(daemon: &mut Daemon, conn: &Connection, num: u32) -> Result<()> {
    let creds = conn.peer_creds()?;
    let (uid, gid, pid) = (creds.uid(), creds.gid(), creds.pid());

    if uid < daemon.cfg.min_uid || uid == getuid().as_raw() {
        return Err(Error::auth(format!("invalid uid: {}", uid)));
    }
    if gid < daemon.cfg.min_gid || gid == getgid().as_raw() {
        return Err(Error::auth(format!("invalid gid: {}", gid)));
    }

    if daemon
        .sessions
        .iter()
        .any(|s| s.caller_uid == uid && s.caller_num == num)
    {
        // Session exists and will be reused.
        conn.send_response(CMD_STATUS_DONE, None)?;
        return Ok(());
    }

    hasher_log::info!("starting session for user {}:{}", uid, num);

    match unsafe { fork() }.map_err(|err| Error::os("fork", err))? {
        ForkResult::Parent { child } => {
            daemon.sessions.push(Session {
                caller_uid: uid,
                caller_num: num,
                server_pid: child,
            });
            // The successful response is delayed until the session
            // server is ready or an error happens.
            Ok(())
        }
        ForkResult::Child => {
            // Shed the daemon's descriptors; only the shutdown pipe's
            // read end and the client connection stay.
            daemon.shutdown_wr.take();
            let shutdown_rd = daemon.shutdown_rd.as_raw_fd();
            let _ = nix::unistd::close(daemon.listen.as_raw_fd());
            let _ = nix::unistd::close(daemon.signal.as_raw_fd());
            let _ = nix::unistd::close(daemon.ep.as_raw_fd());

            let mut caller = match Caller::from_creds(uid, gid, num) {
                Ok(caller) => caller,
                Err(err) => {
                    hasher_log::error!("{}", err);
                    let _ = conn.send_response(CMD_STATUS_FAILED, None);
                    std::process::exit(1);
                }
            };
            caller.pid = pid;

            let first_conn = unsafe { Connection::from_raw_fd(conn.as_raw_fd()) };
            run_session_server(
                caller,
                first_conn,
                shutdown_rd,
                daemon.cfg.session_timeout,
            );
        }
    }
}

fn process_request(daemon: &mut Daemon, conn: Connection) {
    if conn.set_recv_timeout(3).is_err() {
        return;
    }

    let hdr = match conn.recv_header() {
        Ok(hdr) => hdr,
        Err(err) => {
            hasher_log::error!("{}", err);
            return;
        }
    };

    match hdr.kind {
        CMD_OPEN_SESSION => {
            if let Err(err) = start_session(daemon, &conn, hdr.len) {
                hasher_log::error!("{}", err);
                let _ = conn.send_response(CMD_STATUS_FAILED, Some("command failed"));
            }
        }
        other => {
            hasher_log::error!("unknown command: {}", other);
            let _ = conn.send_response(CMD_STATUS_FAILED, Some("unknown command"));
        }
    }
}

fn serve(daemon: &mut Daemon) -> Result<()> {
    hasher_log::info!("accepting connections");

    let mut finish = false;
    while !finish {
        let mut events = [nix::sys::epoll::EpollEvent::empty(); 16];
        let n = daemon.ep.wait(&mut events, -1)?;

        for event in events.iter().take(n) {
            if event.data() != daemon.signal.as_raw_fd() as u64 {
                continue;
            }
            loop {
                let signo = match daemon.signal.read_signal() {
                    Ok(Some(siginfo)) => siginfo.ssi_signo as libc::c_int,
                    _ => break,
                };
                match signo {
                    libc::SIGHUP | libc::SIGINT | libc::SIGQUIT | libc::SIGTERM => {
                        finish = true;
                    }
                    libc::SIGCHLD => wait_sessions(daemon, Some(WaitPidFlag::WNOHANG)),
                    other => {
                        hasher_log::error!("unexpected signal {} ignored", other);
                    }
                }
            }
        }

        for event in events.iter().take(n) {
            if finish || event.data() != daemon.listen.as_raw_fd() as u64 {
                continue;
            }
            match srv_accept(daemon.listen.as_raw_fd()) {
                Ok(conn) => process_request(daemon, conn),
                Err(err) => hasher_log::error!("accept: {}", err),
            }
        }
    }

    hasher_log::info!("shutting down");

    // Notify the session servers.
    daemon.shutdown_wr.take();
    wait_sessions(daemon, None);

    Ok(())
}

fn run(args: Args) -> Result<i32> {
    let cfg = DaemonConfig::load()?;

    let level = args
        .loglevel
        .as_deref()
        .or_else(|| cfg.loglevel.as_deref())
        .and_then(hasher_log::filter_from_level_name)
        .map(str::to_string);

    let pidfile_path = args
        .pidfile
        .clone()
        .or_else(|| cfg.pidfile.clone().map(PathBuf::from));

    if let Some(path) = pidfile_path.as_deref() {
        if check_pid(path) {
            return Err(Error::config("already running"));
        }
    }

    if args.daemonize {
        nix::unistd::daemon(false, false).map_err(|err| Error::os("daemon", err))?;
    }

    let _log_guard = hasher_log::sync_logger(
        "hasher-privd",
        hasher_log::Config {
            foreground: !args.daemonize,
            level,
        },
    )
    .ok();

    let pidfile = match pidfile_path.as_deref() {
        Some(path) => Some(Pidfile::write(path)?),
        None => None,
    };

    let (shutdown_rd, shutdown_wr) =
        nix::unistd::pipe().map_err(|err| Error::os("pipe", err))?;

    let listen = create_socket_node(cfg.access_gid)?;
    let signal = create_signal_fd()?;
    let ep = Epoll::new()?;
    ep.add_in(signal.as_raw_fd())?;
    ep.add_in(listen.as_raw_fd())?;

    // We are going to write into various descriptors and are prepared to
    // handle EPIPE ourselves; the disposition is reset in chrootuid so
    // it does not leak into other executables.
    ignore_signal(Signal::SIGPIPE)?;

    let mut daemon = Daemon {
        cfg,
        sessions: Vec::new(),
        shutdown_wr: Some(Fd::from(shutdown_wr)),
        shutdown_rd: Fd::from(shutdown_rd),
        listen,
        signal,
        ep,
    };

    serve(&mut daemon)?;

    if let Some(pidfile) = pidfile {
        pidfile.remove();
    }

    Ok(0)
}

fn main() {
    let mut no_keep: [&mut RawFd; 0] = [];
    if sanitize_fds(&mut no_keep).is_err() {
        // Not even worth a diagnostic at this stage.
        std::process::exit(1);
    }

    // The daemon and all its descendants never need new privileges.
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        hasher_log::error!("PR_SET_NO_NEW_PRIVS: {}", nix::Error::last());
    }

    let args = Args::parse();

    hasher_log::init();

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            hasher_log::error!("{}", err);
            std::process::exit(1);
        }
    }
}
