//! The per-caller session server.
//!
//! One process per (caller uid, subconfig number): it loads the caller
//! configuration, owns the session socket, accepts job connections from
//! exactly that caller and times out when idle.

use crate::{
    caller::Caller,
    comm::{srv_accept, srv_listen, Connection, CMD_STATUS_DONE, CMD_STATUS_FAILED},
    config::{configure_caller, CallerConfig},
    ep::Epoll,
    error::{Error, Result},
    job::receive_job,
    net::Fd,
    runner::{spawn_job_runner, SessionHandles},
    signals::create_signal_fd,
    SOCKET_DIR,
};
use nix::{
    sys::signalfd::SignalFd,
    sys::stat::{umask, Mode},
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::chown,
};
use std::{
    os::unix::io::{AsRawFd, RawFd},
    path::PathBuf,
};

/// The session socket path for a caller.
pub fn session_socket_path(uid: libc::uid_t, num: u32) -> PathBuf {
    PathBuf::from(SOCKET_DIR).join(format!("{}:{}", uid, num))
}

struct Session {
    caller: Caller,
    cfg: CallerConfig,
    listen: Fd,
    signal: SignalFd,
    ep: Epoll,
    shutdown_rd: RawFd,
    socket_path: PathBuf,
}

fn session_listener_init(caller: &Caller, shutdown_rd: RawFd) -> Result<Session> {
    // Load config according to the caller information.
    let cfg = configure_caller(caller)?;

    let socket_path = session_socket_path(caller.uid.as_raw(), caller.num);

    let saved_umask = umask(Mode::from_bits_truncate(0o077));
    let listen = srv_listen(&socket_path);
    umask(saved_umask);
    let listen = listen?;

    chown(&socket_path, Some(caller.uid), Some(caller.gid))
        .map_err(|err| Error::os(format!("chown: {}", socket_path.display()), err))?;

    let signal = create_signal_fd()?;

    let ep = Epoll::new()?;
    ep.add_in(shutdown_rd)?;
    ep.add_in(listen.as_raw_fd())?;
    ep.add_in(signal.as_raw_fd())?;

    Ok(Session {
        caller: caller.clone(),
        cfg,
        listen,
        signal,
        ep,
        shutdown_rd,
        socket_path,
    })
}

fn wait_jobs() {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, 0)) => {
                hasher_log::info!("process {} exited", pid);
            }
            Ok(WaitStatus::Exited(pid, rc)) => {
                hasher_log::warn!("process {} exited, status={}", pid, rc);
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                hasher_log::warn!("process {} terminated by signal {}", pid, signal);
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

impl Session {
    /// Accept one client, verify it is our caller and serve its job.
    fn serve_connection(&mut self) -> bool {
        let conn = match srv_accept(self.listen.as_raw_fd()) {
            Ok(conn) => conn,
            Err(err) => {
                hasher_log::error!("accept: {}", err);
                return false;
            }
        };

        if conn.set_recv_timeout(3).is_err() {
            return false;
        }

        if self.check_peer_creds(&conn).is_err() {
            return false;
        }

        self.handle_job(conn).is_ok()
    }

    /// Even group members are impostors here: only the session's caller
    /// may use its socket.
    fn check_peer_creds(&mut self, conn: &Connection) -> Result<()> {
        let creds = conn.peer_creds()?;

        if creds.uid() != self.caller.uid.as_raw() || creds.gid() != self.caller.gid.as_raw() {
            hasher_log::error!(
                "connection from [{}:{}] to {}:{} rejected",
                creds.uid(),
                creds.gid(),
                self.caller.user,
                self.caller.num
            );
            return Err(Error::auth("peer mismatch"));
        }

        self.caller.pid = creds.pid();
        Ok(())
    }

    fn handle_job(&self, conn: Connection) -> Result<()> {
        let job = receive_job(&conn)?;

        let handles = SessionHandles {
            shutdown_rd: self.shutdown_rd,
            listen_fd: self.listen.as_raw_fd(),
            signal_fd: self.signal.as_raw_fd(),
            epoll_fd: self.ep.as_raw_fd(),
        };

        spawn_job_runner(&handles, &conn, job, &self.caller, &self.cfg)?;
        // The runner answers the client; our copy of the connection
        // closes here.
        Ok(())
    }

    /// The 1-second-tick accept loop with the idle timeout.
    fn run(&mut self, session_timeout: u64) {
        let mut n_seconds: u64 = 0;

        'outer: loop {
            let mut events = [nix::sys::epoll::EpollEvent::empty(); 16];
            let n = match self.ep.wait(&mut events, 1000) {
                Ok(n) => n,
                Err(err) => {
                    hasher_log::error!("{}", err);
                    break;
                }
            };

            if n == 0 {
                n_seconds += 1;
                if session_timeout > 0 && n_seconds >= session_timeout {
                    break;
                }
                continue;
            }

            for event in events.iter().take(n) {
                if event.data() == self.shutdown_rd as u64 {
                    break 'outer;
                }

                if event.data() == self.signal.as_raw_fd() as u64 {
                    while let Ok(Some(siginfo)) = self.signal.read_signal() {
                        match siginfo.ssi_signo as libc::c_int {
                            libc::SIGCHLD => wait_jobs(),
                            libc::SIGHUP | libc::SIGINT | libc::SIGQUIT | libc::SIGTERM => {
                                break 'outer;
                            }
                            other => {
                                hasher_log::error!("unexpected signal {} ignored", other);
                            }
                        }
                    }
                }
            }

            for event in events.iter().take(n) {
                if event.data() == self.listen.as_raw_fd() as u64 {
                    if self.serve_connection() {
                        // Activity resets the idle clock.
                        n_seconds = 0;
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        hasher_log::info!(
            "{}/{}:{}: session finished",
            self.caller.user,
            self.caller.uid,
            self.caller.num
        );
    }
}

/// Become the session server for this caller.
///
/// Inherits the accepted connection of the first client, which waits for
/// the final `DONE`; never returns.
pub fn run_session_server(
    caller: Caller,
    first_conn: Connection,
    shutdown_rd: RawFd,
    session_timeout: u64,
) -> ! {
    let mut session = match session_listener_init(&caller, shutdown_rd) {
        Ok(session) => session,
        Err(err) => {
            hasher_log::error!(
                "{}/{}:{}: {}",
                caller.user,
                caller.uid,
                caller.num,
                err
            );
            let _ = first_conn.send_response(CMD_STATUS_FAILED, None);
            std::process::exit(1);
        }
    };

    hasher_log::info!(
        "{}/{}:{}: session started",
        caller.user,
        caller.uid,
        caller.num
    );

    // Notify the client that the session server is ready.
    let _ = first_conn.send_response(CMD_STATUS_DONE, None);
    drop(first_conn);

    session.run(session_timeout);
    std::process::exit(0);
}
