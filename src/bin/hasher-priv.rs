//! The hasher-priv client: streams one job to the session server and
//! mirrors its completion status.

use hasher_priv::{
    comm::{
        srv_connect, srv_try_connect, Connection, JobKind, CMD_JOB_ARGUMENTS, CMD_JOB_CHROOT_FD,
        CMD_JOB_ENVIRON, CMD_JOB_FDS, CMD_JOB_RUN, CMD_JOB_TYPE, CMD_OPEN_SESSION,
        CMD_STATUS_FAILED,
    },
    error::{Error, Result},
    fds::sanitize_fds,
    MAIN_SOCKET_NAME, SOCKET_DIR,
};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use std::{ffi::CString, os::unix::io::RawFd, process::exit};

const PROGRAM: &str = "hasher-priv";

/// The parsed command line.
struct Cmdline {
    caller_num: u32,
    job: JobKind,
    /// Program and arguments for chrootuid jobs.
    job_args: Vec<String>,
    chroot_path: Option<String>,
}

fn show_usage(message: &str) -> ! {
    eprintln!("{}: {}", PROGRAM, message);
    eprintln!("Try `{} --help' for more information.", PROGRAM);
    exit(1);
}

fn print_help() -> ! {
    println!(
        "Privileged helper for sandboxed package builds.

Usage: {} [options] <args>

Valid options are:
  -<number>:
       subconfig identifier;
  --version:
       print program version and exit;
  -h or --help:
       print this help text and exit.

Valid args are any of:

getconf:
       print config file name;
killuid:
       kill all processes of user1 and user2;
getugid1:
       print uid:gid pair for user1;
chrootuid1 <chroot path> <program> [program args]:
       execute program in given chroot with credentials of user1;
getugid2:
       print uid:gid pair for user2;
chrootuid2 <chroot path> <program> [program args]:
       execute program in given chroot with credentials of user2;",
        PROGRAM
    );
    exit(0);
}

fn print_version() -> ! {
    println!("{} version {}", PROGRAM, env!("CARGO_PKG_VERSION"));
    exit(0);
}

fn parse_caller_num(text: &str) -> u32 {
    if text.is_empty() {
        show_usage(&format!("-{}: invalid option", text));
    }
    match text.parse::<u32>() {
        Ok(num) if num <= i32::MAX as u32 => num,
        _ => show_usage(&format!("-{}: invalid option", text)),
    }
}

fn parse_cmdline() -> Cmdline {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    if args.is_empty() {
        show_usage("insufficient arguments");
    }

    let mut caller_num = 0;
    if args[0].starts_with('-') {
        match args[0].as_str() {
            "-h" | "--help" => print_help(),
            "--version" => print_version(),
            option => caller_num = parse_caller_num(&option[1..]),
        }
        args.remove(0);
    }

    if args.is_empty() {
        show_usage("insufficient arguments");
    }

    let cmd = args.remove(0);
    match cmd.as_str() {
        "getconf" | "killuid" | "getugid1" | "getugid2" => {
            if !args.is_empty() {
                show_usage(&format!("{}: invalid usage", cmd));
            }
            let job = match cmd.as_str() {
                "getconf" => JobKind::GetConf,
                "killuid" => JobKind::KillUid,
                "getugid1" => JobKind::GetUgid1,
                _ => JobKind::GetUgid2,
            };
            Cmdline {
                caller_num,
                job,
                job_args: Vec::new(),
                chroot_path: None,
            }
        }
        "chrootuid1" | "chrootuid2" => {
            if args.len() < 2 {
                show_usage(&format!("{}: invalid usage", cmd));
            }
            let chroot_path = args.remove(0);
            Cmdline {
                caller_num,
                job: if cmd == "chrootuid1" {
                    JobKind::ChrootUid1
                } else {
                    JobKind::ChrootUid2
                },
                job_args: args,
                chroot_path: Some(chroot_path),
            }
        }
        other => show_usage(&format!("{}: invalid argument", other)),
    }
}

/// Handle one response from a server, mirroring its diagnostic text.
fn recv_response(conn: &Connection, name: &str) -> Result<i32> {
    let (rc, text) = conn
        .recv_response()
        .map_err(|_| Error::protocol(format!("failed to receive response to {}", name)))?;

    if let Some(text) = text {
        if !text.is_empty() {
            eprintln!("{}: {}: {}", PROGRAM, name, text);
        }
    }

    if rc == CMD_STATUS_FAILED {
        return Err(Error::protocol(format!("{}: failed", name)));
    }
    Ok(rc)
}

/// Ask the main daemon socket for a session server.
fn request_session(num: u32) -> Result<()> {
    let conn = srv_connect(SOCKET_DIR, MAIN_SOCKET_NAME)?;
    conn.send_header(CMD_OPEN_SESSION, num)?;
    recv_response(&conn, "session request")?;
    Ok(())
}

/// Connect to our session server, spawning it on demand.
fn connect_to_session(num: u32) -> Result<Connection> {
    let socket_name = format!("{}:{}", nix::unistd::geteuid(), num);

    // Try to connect directly to the session server first.
    if let Some(conn) = srv_try_connect(SOCKET_DIR, &socket_name)? {
        return Ok(conn);
    }

    request_session(num)?;

    srv_connect(SOCKET_DIR, &socket_name)
}

fn send_type(conn: &Connection, job: JobKind) -> Result<()> {
    conn.send_header(CMD_JOB_TYPE, job.code())?;
    recv_response(conn, "job type")?;
    Ok(())
}

fn send_fds(conn: &Connection, cmd: u32, name: &str, fds: &[RawFd]) -> Result<()> {
    conn.send_fds(cmd, fds)?;
    recv_response(conn, name)?;
    Ok(())
}

fn send_strings(conn: &Connection, cmd: u32, name: &str, items: &[CString]) -> Result<()> {
    conn.send_strings(cmd, items)?;
    recv_response(conn, name)?;
    Ok(())
}

fn send_run(conn: &Connection) -> Result<i32> {
    conn.send_header(CMD_JOB_RUN, 0)?;
    recv_response(conn, "run")
}

fn environ() -> Result<Vec<CString>> {
    let mut env = Vec::new();
    for (name, value) in std::env::vars_os() {
        let mut entry = name.into_string().unwrap_or_default();
        entry.push('=');
        entry.push_str(&value.to_string_lossy());
        if let Ok(entry) = CString::new(entry) {
            env.push(entry);
        }
    }
    Ok(env)
}

fn run(cmdline: Cmdline) -> Result<i32> {
    let conn = connect_to_session(cmdline.caller_num)?;

    send_type(&conn, cmdline.job)?;
    send_fds(&conn, CMD_JOB_FDS, "stdio", &[0, 1, 2])?;

    if !cmdline.job_args.is_empty() {
        let args: Vec<CString> = cmdline
            .job_args
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<std::result::Result<_, _>>()?;
        send_strings(&conn, CMD_JOB_ARGUMENTS, "arguments", &args)?;
    }

    if cmdline.job.is_chrootuid() {
        send_strings(&conn, CMD_JOB_ENVIRON, "environment", &environ()?)?;

        let chroot_path = cmdline
            .chroot_path
            .as_deref()
            .ok_or_else(|| Error::config("invalid chroot path"))?;
        let chroot_fd = open(
            chroot_path,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|err| Error::os(format!("open: {}", chroot_path), err))?;

        let result = send_fds(&conn, CMD_JOB_CHROOT_FD, "chroot descriptor", &[chroot_fd]);
        let _ = nix::unistd::close(chroot_fd);
        result?;
    }

    send_run(&conn)
}

fn main() {
    let mut no_keep: [&mut RawFd; 0] = [];
    if sanitize_fds(&mut no_keep).is_err() {
        exit(1);
    }

    let cmdline = parse_cmdline();

    match run(cmdline) {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("{}: {}", PROGRAM, err);
            exit(1);
        }
    }
}
