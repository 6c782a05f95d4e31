//! The per-job runner and executor processes.
//!
//! `JOB_RUN` forks the runner off the session server.  The runner joins
//! the caller's cgroup (for chrootuid), forks the privileged executor,
//! drops to the caller's identity and supervises: when the executor
//! exits its status becomes the job response; when the client hangs up
//! first the executor is terminated instead.

use crate::{
    caller::Caller,
    cgroup,
    chrootuid::do_chrootuid,
    comm::{Connection, JobKind},
    config::CallerConfig,
    ep::Epoll,
    error::{Error, Result},
    executors, fds,
    job::{env_pairs, Job},
    killuid,
    net::Fd,
    signals::{create_signal_fd, unblock_all_signals},
};
use nix::{
    sys::signal::{kill, Signal},
    sys::wait::{waitpid, WaitStatus},
    unistd::{fork, setgid, setgroups, setuid, ForkResult, Pid},
};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

/// The descriptors a session server holds; the runner closes its copies
/// right after the fork.
pub struct SessionHandles {
    pub shutdown_rd: RawFd,
    pub listen_fd: RawFd,
    pub signal_fd: RawFd,
    pub epoll_fd: RawFd,
}

impl SessionHandles {
    fn close_all(&self) {
        for fd in [
            self.shutdown_rd,
            self.listen_fd,
            self.signal_fd,
            self.epoll_fd,
        ] {
            if fd >= 0 {
                let _ = nix::unistd::close(fd);
            }
        }
    }
}

/// Translate a wait status into the job's response code.
pub fn status_to_rc(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, rc) => rc,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 255,
    }
}

fn wait_pid_retry(pid: Pid) -> Result<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(status @ (WaitStatus::Exited(_, _) | WaitStatus::Signaled(_, _, _))) => {
                return Ok(status);
            }
            Ok(_) => continue,
            Err(nix::Error::EINTR) => continue,
            Err(err) => return Err(Error::os("waitpid", err)),
        }
    }
}

/// The executor: the process that performs the job with root privileges.
///
/// Never returns; exits with the job's status code.
fn job_executor(job: Job, caller: &Caller, cfg: &CallerConfig) -> ! {
    let code = match executor_main(job, caller, cfg.clone()) {
        Ok(code) => code,
        Err(err) => {
            hasher_log::error!(
                "{}/{}:{}: {}",
                caller.user,
                caller.uid,
                caller.num,
                err
            );
            1
        }
    };
    std::process::exit(code);
}

fn executor_main(mut job: Job, caller: &Caller, mut cfg: CallerConfig) -> Result<i32> {
    unblock_all_signals()?;

    // Reset standard descriptors to the caller's.
    if job.std_fds.len() == 3 {
        let fds: Vec<RawFd> = job.std_fds.drain(..).map(IntoRawFd::into_raw_fd).collect();
        for (target, fd) in fds.into_iter().enumerate() {
            fds::move_fd(fd, target as RawFd)?;
        }
    }

    // Log to our own stderr from here on.
    let _guard = hasher_log::sync_logger("hasher-privd", true).ok();

    // Check and sanitize file descriptors; only the chroot directory
    // survives.
    let mut chroot_raw = job.chroot_fd.take().map(IntoRawFd::into_raw_fd).unwrap_or(-1);
    fds::sanitize_fds(&mut [&mut chroot_raw])?;
    let chroot_fd = if chroot_raw >= 0 {
        Some(Fd::from(chroot_raw))
    } else {
        None
    };

    // The daemon's environment is no business of the job.
    unsafe { libc::clearenv() };

    // Parse the job environment for the runtime option allow-list.
    cfg.apply_environment(&env_pairs(&job.env))?;

    if let Some(persona) = job.persona {
        if unsafe { libc::personality(persona) } < 0 {
            return Err(Error::os("personality", nix::Error::last()));
        }
    }

    let kind = job.kind.ok_or_else(|| Error::protocol("no job type"))?;
    match kind {
        JobKind::GetConf => {
            executors::do_getconf(caller)?;
            Ok(0)
        }
        JobKind::KillUid => {
            let target1 = cfg
                .target1
                .as_ref()
                .ok_or_else(|| Error::config("undefined: user1"))?;
            let target2 = cfg
                .target2
                .as_ref()
                .ok_or_else(|| Error::config("undefined: user2"))?;
            killuid::do_killuid(target1, target2)?;
            Ok(0)
        }
        JobKind::GetUgid1 => {
            let target = cfg
                .target1
                .as_ref()
                .ok_or_else(|| Error::config("undefined: user1"))?;
            executors::do_getugid(target)?;
            Ok(0)
        }
        JobKind::GetUgid2 => {
            let target = cfg
                .target2
                .as_ref()
                .ok_or_else(|| Error::config("undefined: user2"))?;
            executors::do_getugid(target)?;
            Ok(0)
        }
        JobKind::ChrootUid1 | JobKind::ChrootUid2 => {
            let chroot_fd =
                chroot_fd.ok_or_else(|| Error::protocol("no chroot descriptor"))?;
            let which = if kind == JobKind::ChrootUid1 { 1 } else { 2 };
            let argv = std::mem::take(&mut job.argv);
            do_chrootuid(caller, &mut cfg, chroot_fd, argv, which)
        }
    }
}

/// The runner: supervises one executor and reports the job status.
///
/// Never returns.
fn job_runner(handles: &SessionHandles, conn: &Connection, job: Job, caller: &Caller,
              cfg: &CallerConfig) -> ! {
    handles.close_all();

    let code = match run_job(conn, job, caller, cfg) {
        Ok(()) => 0,
        Err(err) => {
            hasher_log::error!("{}", err);
            let _ = conn.send_response(crate::comm::CMD_STATUS_FAILED, None);
            1
        }
    };
    std::process::exit(code);
}

fn run_job(conn: &Connection, job: Job, caller: &Caller, cfg: &CallerConfig) -> Result<()> {
    let kind = job.kind.ok_or_else(|| Error::protocol("no job type"))?;

    // Chroot'ed processes stay under whatever resource regulation the
    // caller already runs with.
    if kind.is_chrootuid() {
        cgroup::join_caller_cgroup(caller.pid, caller.uid)?;
    }

    // Block the lifecycle signals and take them through a signalfd so
    // the wait below cannot race the executor's exit.
    let mut signal_fd = create_signal_fd()?;

    let executor = match unsafe { fork() }.map_err(|err| Error::os("fork", err))? {
        ForkResult::Child => job_executor(job, caller, cfg),
        ForkResult::Parent { child } => child,
    };
    drop(job);

    // The executor holds the privileged state; the runner itself serves
    // the caller and can drop to its identity.
    if unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0) } != 0 {
        return Err(Error::os("prctl PR_SET_DUMPABLE", nix::Error::last()));
    }
    setgroups(&[]).map_err(|err| Error::os("setgroups", err))?;
    setgid(caller.gid).map_err(|err| Error::os("setgid", err))?;
    setuid(caller.uid).map_err(|err| Error::os("setuid", err))?;

    let ep = Epoll::new()?;
    ep.add_in(signal_fd.as_raw_fd())?;
    ep.add_hup(conn.as_raw_fd())?;

    loop {
        let mut events = [nix::sys::epoll::EpollEvent::empty(); 4];
        let n = ep.wait(&mut events, -1)?;

        for event in events.iter().take(n) {
            if event.data() == signal_fd.as_raw_fd() as u64 {
                while let Ok(Some(siginfo)) = signal_fd.read_signal() {
                    match siginfo.ssi_signo as libc::c_int {
                        libc::SIGCHLD => {
                            let status = wait_pid_retry(executor)?;
                            let rc = status_to_rc(status);
                            log_job_status(caller, kind, executor, status);
                            conn.send_response(rc, None)?;
                            return Ok(());
                        }
                        _ => {
                            // Shut down: take the executor with us.
                            let _ = kill(executor, Signal::SIGTERM);
                            let _ = wait_pid_retry(executor);
                            return Err(Error::JobFailed);
                        }
                    }
                }
            } else if event.data() == conn.as_raw_fd() as u64 {
                // The client is gone; there is nobody to answer.
                let _ = kill(executor, Signal::SIGTERM);
                let _ = wait_pid_retry(executor);
                return Err(Error::JobFailed);
            }
        }
    }
}

fn log_job_status(caller: &Caller, kind: JobKind, pid: Pid, status: WaitStatus) {
    match status {
        WaitStatus::Exited(_, 0) => {
            hasher_log::info!(
                "{}/{}:{}: {}: process {} exited",
                caller.user,
                caller.uid,
                caller.num,
                kind.as_str(),
                pid
            );
        }
        WaitStatus::Exited(_, rc) => {
            hasher_log::warn!(
                "{}/{}:{}: {}: process {} exited, status={}",
                caller.user,
                caller.uid,
                caller.num,
                kind.as_str(),
                pid,
                rc
            );
        }
        WaitStatus::Signaled(_, signal, _) => {
            hasher_log::warn!(
                "{}/{}:{}: {}: process {} terminated by signal {}",
                caller.user,
                caller.uid,
                caller.num,
                kind.as_str(),
                pid,
                signal
            );
        }
        _ => {}
    }
}

/// Fork the runner for an assembled job.  The runner owns the response
/// to `JOB_RUN`.
pub fn spawn_job_runner(
    handles: &SessionHandles,
    conn: &Connection,
    job: Job,
    caller: &Caller,
    cfg: &CallerConfig,
) -> Result<Pid> {
    match unsafe { fork() }.map_err(|err| Error::os("fork", err))? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => job_runner(handles, conn, job, caller, cfg),
    }
}

#[cfg(test)]
mod tests {
    use super::status_to_rc;
    use nix::sys::signal::Signal;
    use nix::sys::wait::WaitStatus;
    use nix::unistd::Pid;

    #[test]
    fn test_status_translation() {
        let pid = Pid::from_raw(123);
        assert_eq!(status_to_rc(WaitStatus::Exited(pid, 0)), 0);
        assert_eq!(status_to_rc(WaitStatus::Exited(pid, 7)), 7);
        assert_eq!(
            status_to_rc(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            128 + 15
        );
        assert_eq!(
            status_to_rc(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            128 + 9
        );
    }
}
