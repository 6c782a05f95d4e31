//! Assembling a job from the wire protocol.
//!
//! The commands of a job may arrive in any order, each at most once;
//! `JOB_RUN` is final and triggers validation of the assembled record.

use crate::{
    comm::{
        Connection, JobKind, CMD_JOB_ARGUMENTS, CMD_JOB_CHROOT_FD, CMD_JOB_ENVIRON, CMD_JOB_FDS,
        CMD_JOB_PERSONALITY, CMD_JOB_RUN, CMD_JOB_TYPE, CMD_STATUS_DONE, CMD_STATUS_FAILED,
    },
    error::{Error, Result},
    net::Fd,
    MAX_ARGS_SIZE,
};
use std::{ffi::CString, mem};

/// One job under assembly or ready to run.
#[derive(Debug, Default)]
pub struct Job {
    pub kind: Option<JobKind>,
    /// Bitset of the command kinds received so far.
    pub mask: u32,
    pub chroot_fd: Option<Fd>,
    pub std_fds: Vec<Fd>,
    pub argv: Vec<CString>,
    pub env: Vec<CString>,
    pub persona: Option<libc::c_ulong>,
}

/// Check the argument count against the job type.
pub fn validate_arguments(kind: JobKind, argv: &[CString]) -> Result<()> {
    if kind.is_chrootuid() {
        if argv.is_empty() {
            return Err(Error::protocol(format!(
                "{} job requires at least 1 argument but got 0",
                kind.as_str()
            )));
        }
    } else if !argv.is_empty() {
        return Err(Error::protocol(format!(
            "{} job requires exactly 0 arguments but got {}",
            kind.as_str(),
            argv.len()
        )));
    }
    Ok(())
}

/// Check the fully assembled job before it may run.
pub fn validate_job(job: &Job) -> Result<()> {
    let kind = job.kind.ok_or_else(|| Error::protocol("no job type"))?;

    if kind.is_chrootuid() {
        if job.mask & CMD_JOB_ARGUMENTS == 0 {
            return Err(Error::protocol("no arguments"));
        }
        if job.mask & CMD_JOB_CHROOT_FD == 0 {
            return Err(Error::protocol("no chroot descriptor"));
        }
    }

    validate_arguments(kind, &job.argv)
}

/// Receive commands until `JOB_RUN` and return the assembled job.
///
/// Every accepted step except the final one is acknowledged with `DONE`.
/// A protocol violation is answered with `FAILED "bad request"`, any
/// other failure with `FAILED "command failed"`; either way all received
/// job resources are released on return.
pub fn receive_job(conn: &Connection) -> Result<Job> {
    let mut job = Job::default();

    let result = receive_job_steps(conn, &mut job);
    match result {
        Ok(()) => Ok(job),
        Err(err) => {
            let text = if err.is_protocol() {
                "bad request"
            } else {
                "command failed"
            };
            hasher_log::error!("{}", err);
            let _ = conn.send_response(CMD_STATUS_FAILED, Some(text));
            Err(err)
        }
    }
}

fn receive_job_steps(conn: &Connection, job: &mut Job) -> Result<()> {
    loop {
        let hdr = conn.recv_header()?;

        if job.mask & hdr.kind != 0 {
            return Err(Error::protocol(format!("repeated command: {}", hdr.kind)));
        }

        match hdr.kind {
            CMD_JOB_TYPE => {
                job.kind = Some(
                    JobKind::from_code(hdr.len)
                        .ok_or_else(|| Error::protocol(format!("unknown job type: {}", hdr.len)))?,
                );
                job.mask |= CMD_JOB_TYPE;
            }

            CMD_JOB_FDS => {
                if hdr.len as usize != 3 * mem::size_of::<libc::c_int>() {
                    return Err(Error::protocol("bad descriptor payload"));
                }
                let (fds, _) = conn.fd_recv(3, 0)?;
                job.std_fds = fds;
                job.mask |= CMD_JOB_FDS;
            }

            CMD_JOB_CHROOT_FD => {
                if hdr.len as usize != mem::size_of::<libc::c_int>() {
                    return Err(Error::protocol("bad descriptor payload"));
                }
                let (mut fds, _) = conn.fd_recv(1, 0)?;
                job.chroot_fd = fds.pop();
                job.mask |= CMD_JOB_CHROOT_FD;
            }

            CMD_JOB_ARGUMENTS => {
                let blob = conn.recv_blob(hdr.len as usize, MAX_ARGS_SIZE)?;
                job.argv = crate::comm::split_nul_blob(&blob);
                job.mask |= CMD_JOB_ARGUMENTS;
            }

            CMD_JOB_ENVIRON => {
                let blob = conn.recv_blob(hdr.len as usize, MAX_ARGS_SIZE)?;
                job.env = crate::comm::split_nul_blob(&blob);
                job.mask |= CMD_JOB_ENVIRON;
            }

            CMD_JOB_PERSONALITY => {
                job.persona = Some(hdr.len as libc::c_ulong);
                job.mask |= CMD_JOB_PERSONALITY;
            }

            CMD_JOB_RUN => {
                job.mask |= CMD_JOB_RUN;
                validate_job(job)?;
                // The response to RUN is the job completion status,
                // delivered by the runner.
                return Ok(());
            }

            other => {
                return Err(Error::protocol(format!("unknown command: {}", other)));
            }
        }

        conn.send_response(CMD_STATUS_DONE, None)?;
    }
}

/// Decompose the environment blob entries into `NAME=value` pairs;
/// entries without `=` are ignored.
pub fn env_pairs(env: &[CString]) -> Vec<(String, String)> {
    env.iter()
        .filter_map(|entry| {
            let entry = entry.to_str().ok()?;
            let eq = entry.find('=')?;
            Some((entry[..eq].to_string(), entry[eq + 1..].to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{srv_accept, srv_listen};
    use std::os::unix::io::AsRawFd;

    fn cstr(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    fn test_argument_counts() {
        assert!(validate_arguments(JobKind::GetConf, &[]).is_ok());
        assert!(validate_arguments(JobKind::GetConf, &[cstr("x")]).is_err());
        assert!(validate_arguments(JobKind::ChrootUid1, &[]).is_err());
        assert!(validate_arguments(JobKind::ChrootUid1, &[cstr("/bin/true")]).is_ok());
    }

    #[test]
    fn test_env_pairs() {
        let env = vec![cstr("HOME=/root"), cstr("bogus"), cstr("A=b=c")];
        let pairs = env_pairs(&env);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], ("HOME".to_string(), "/root".to_string()));
        assert_eq!(pairs[1], ("A".to_string(), "b=c".to_string()));
    }

    #[test]
    fn test_job_validation() {
        let mut job = Job::default();
        assert!(validate_job(&job).is_err());

        job.kind = Some(JobKind::GetUgid1);
        job.mask |= CMD_JOB_TYPE;
        assert!(validate_job(&job).is_ok());

        let mut job = Job::default();
        job.kind = Some(JobKind::ChrootUid2);
        job.mask |= CMD_JOB_TYPE | CMD_JOB_ARGUMENTS;
        job.argv = vec![cstr("/bin/true")];
        // Still missing the chroot descriptor.
        assert!(validate_job(&job).is_err());
        job.mask |= CMD_JOB_CHROOT_FD;
        assert!(validate_job(&job).is_ok());
    }

    fn client_server() -> (Connection, Connection) {
        Connection::pair().unwrap()
    }

    #[test]
    fn test_happy_assembly() {
        let (client, server) = client_server();

        let handler = std::thread::spawn(move || receive_job(&server));

        client.send_header(CMD_JOB_TYPE, JobKind::GetConf.code()).unwrap();
        assert_eq!(client.recv_response().unwrap().0, CMD_STATUS_DONE);
        client
            .send_fds(CMD_JOB_FDS, &[0, 1, 2])
            .unwrap();
        assert_eq!(client.recv_response().unwrap().0, CMD_STATUS_DONE);
        client.send_header(CMD_JOB_RUN, 0).unwrap();

        let job = handler.join().unwrap().unwrap();
        assert_eq!(job.kind, Some(JobKind::GetConf));
        assert_eq!(job.std_fds.len(), 3);
        assert!(job.mask & CMD_JOB_RUN != 0);
    }

    #[test]
    fn test_repeated_command_rejected() {
        let (client, server) = client_server();

        let handler = std::thread::spawn(move || receive_job(&server));

        client.send_header(CMD_JOB_TYPE, JobKind::GetConf.code()).unwrap();
        assert_eq!(client.recv_response().unwrap().0, CMD_STATUS_DONE);
        client.send_header(CMD_JOB_TYPE, JobKind::KillUid.code()).unwrap();
        let (rc, text) = client.recv_response().unwrap();
        assert_eq!(rc, CMD_STATUS_FAILED);
        assert_eq!(text.as_deref(), Some("bad request"));

        assert!(handler.join().unwrap().is_err());
    }

    #[test]
    fn test_unknown_command_rejected() {
        let (client, server) = client_server();

        let handler = std::thread::spawn(move || receive_job(&server));

        client.send_header(1 << 12, 0).unwrap();
        let (rc, text) = client.recv_response().unwrap();
        assert_eq!(rc, CMD_STATUS_FAILED);
        assert_eq!(text.as_deref(), Some("bad request"));
        assert!(handler.join().unwrap().is_err());
    }

    #[test]
    fn test_run_without_type_rejected() {
        let (client, server) = client_server();

        let handler = std::thread::spawn(move || receive_job(&server));

        client.send_header(CMD_JOB_RUN, 0).unwrap();
        let (rc, _) = client.recv_response().unwrap();
        assert_eq!(rc, CMD_STATUS_FAILED);
        assert!(handler.join().unwrap().is_err());
    }

    #[test]
    fn test_oversized_arguments_rejected() {
        let (client, server) = client_server();

        let handler = std::thread::spawn(move || receive_job(&server));

        // Announce an oversized blob; it must be rejected from the
        // header alone.
        client
            .send_header(CMD_JOB_ARGUMENTS, (MAX_ARGS_SIZE + 1) as u32)
            .unwrap();
        let (rc, text) = client.recv_response().unwrap();
        assert_eq!(rc, CMD_STATUS_FAILED);
        assert_eq!(text.as_deref(), Some("bad request"));
        assert!(handler.join().unwrap().is_err());
    }

    #[test]
    fn test_session_socket_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("500:0");
        let listen = srv_listen(&path).unwrap();

        let client = crate::comm::srv_connect(
            dir.path().to_str().unwrap(),
            "500:0",
        )
        .unwrap();
        let server = srv_accept(listen.as_raw_fd()).unwrap();

        client.send_header(CMD_JOB_TYPE, JobKind::GetUgid2.code()).unwrap();
        let hdr = server.recv_header().unwrap();
        assert_eq!(hdr.kind, CMD_JOB_TYPE);
        assert_eq!(JobKind::from_code(hdr.len), Some(JobKind::GetUgid2));

        let creds = server.peer_creds().unwrap();
        assert_eq!(creds.uid(), nix::unistd::getuid().as_raw());
        assert_eq!(creds.gid(), nix::unistd::getgid().as_raw());
    }
}
