//! End-to-end exercise of the job protocol over a socketpair, the way
//! the client and a session server use it.

use hasher_priv::comm::{
    split_nul_blob, Connection, JobKind, CMD_JOB_ARGUMENTS, CMD_JOB_CHROOT_FD, CMD_JOB_ENVIRON,
    CMD_JOB_FDS, CMD_JOB_RUN, CMD_JOB_TYPE, CMD_STATUS_DONE,
};
use hasher_priv::job::{env_pairs, receive_job};
use std::ffi::CString;
use std::os::unix::io::AsRawFd;

fn cstr(s: &str) -> CString {
    CString::new(s).unwrap()
}

#[test]
fn test_full_chrootuid_job_assembly() {
    let (client, server) = Connection::pair().unwrap();

    let handler = std::thread::spawn(move || receive_job(&server));

    // The command order is the client's choice; only RUN is final.
    client
        .send_strings(
            CMD_JOB_ENVIRON,
            &[cstr("use_pty=yes"), cstr("wlimit_time_elapsed=30")],
        )
        .unwrap();
    assert_eq!(client.recv_response().unwrap().0, CMD_STATUS_DONE);

    client
        .send_header(CMD_JOB_TYPE, JobKind::ChrootUid2.code())
        .unwrap();
    assert_eq!(client.recv_response().unwrap().0, CMD_STATUS_DONE);

    client.send_fds(CMD_JOB_FDS, &[0, 1, 2]).unwrap();
    assert_eq!(client.recv_response().unwrap().0, CMD_STATUS_DONE);

    let chroot = tempfile::tempdir().unwrap();
    let chroot_fd = std::fs::File::open(chroot.path()).unwrap();
    client
        .send_fds(CMD_JOB_CHROOT_FD, &[chroot_fd.as_raw_fd()])
        .unwrap();
    assert_eq!(client.recv_response().unwrap().0, CMD_STATUS_DONE);

    client
        .send_strings(CMD_JOB_ARGUMENTS, &[cstr("/bin/true"), cstr("--quiet")])
        .unwrap();
    assert_eq!(client.recv_response().unwrap().0, CMD_STATUS_DONE);

    client.send_header(CMD_JOB_RUN, 0).unwrap();

    let job = handler.join().unwrap().unwrap();
    assert_eq!(job.kind, Some(JobKind::ChrootUid2));
    assert_eq!(job.std_fds.len(), 3);
    assert!(job.chroot_fd.is_some());
    assert_eq!(job.argv, vec![cstr("/bin/true"), cstr("--quiet")]);

    let pairs = env_pairs(&job.env);
    assert!(pairs.contains(&("use_pty".to_string(), "yes".to_string())));
    assert!(pairs.contains(&("wlimit_time_elapsed".to_string(), "30".to_string())));
}

#[test]
fn test_control_channel_handshake_shape() {
    // The X11 control channel carries the listener descriptor together
    // with the fake cookie in one message.
    let (child_side, parent_side) = Connection::pair().unwrap();

    let fake_cookie = [0x5au8; 16];
    let (pipe_rd, pipe_wr) = nix::unistd::pipe().unwrap();

    child_side.fd_send(&[pipe_rd], &fake_cookie).unwrap();

    let (fds, data) = parent_side.fd_recv(1, fake_cookie.len()).unwrap();
    assert_eq!(fds.len(), 1);
    assert_eq!(data, fake_cookie);

    nix::unistd::close(pipe_rd).unwrap();
    nix::unistd::close(pipe_wr).unwrap();
}

#[test]
fn test_blob_format_matches_client_encoding() {
    // What send_strings produces is exactly what split_nul_blob expects.
    let items = vec![cstr("a"), cstr(""), cstr("bc")];
    let mut blob = Vec::new();
    for item in &items {
        blob.extend_from_slice(item.as_bytes_with_nul());
    }
    assert_eq!(split_nul_blob(&blob), items);
}
