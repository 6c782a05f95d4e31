//! Privileged helper for sandboxed package builds.
//!
//! An unprivileged build system talks to the `hasher-privd` daemon over a
//! local socket and asks it to run build steps inside a chroot as one of two
//! pre-configured unprivileged identities.  The daemon is a ladder of
//! single-threaded processes — root daemon, per-caller session server, job
//! runner, executor, chroot'ed child — that only communicate via Unix
//! sockets with `SCM_RIGHTS` descriptor passing.  The privilege boundary is
//! always a process boundary.
//!
//! The crate is a library so that the `hasher-priv` client and the
//! `hasher-privd` daemon binaries share the protocol and setup code, and so
//! that the pure parts stay testable without privileges.

pub mod caller;
pub mod cgroup;
pub mod chdir;
pub mod chid;
pub mod child;
pub mod chrootuid;
pub mod comm;
pub mod config;
pub mod ep;
pub mod error;
pub mod executors;
pub mod fds;
pub mod io;
pub mod job;
pub mod killuid;
pub mod makedev;
pub mod mount;
pub mod net;
pub mod ns;
pub mod pidfile;
pub mod pty;
pub mod runner;
pub mod session;
pub mod signals;
pub mod tty;
pub mod unshare;
pub mod x11;

pub use error::{Error, Result};

/// Directory holding the daemon and per-session sockets.
pub const SOCKET_DIR: &str = "/var/run/hasher-priv";

/// Basename of the well-known daemon socket under [`SOCKET_DIR`].
pub const MAIN_SOCKET_NAME: &str = "daemon";

/// Configuration directory, always descended into with validated walks.
pub const CONFIG_DIR: &str = "/etc/hasher-priv";

/// Smallest uid allowed for the caller and for both target users.
pub const MIN_CHANGE_UID: libc::uid_t = 34;

/// Smallest gid allowed for the caller and for both target users.
pub const MIN_CHANGE_GID: libc::gid_t = 34;

/// Upper bound on a single config file, applied before parsing.
pub const MAX_CONFIG_SIZE: u64 = 16384;

/// Upper bound on an argument or environment blob, applied before
/// allocation and well below ARG_MAX.
pub const MAX_ARGS_SIZE: usize = 128 * 1024;

/// I/O chunk size of the multiplexer and relays.
pub const BUF_SIZE: usize = 8192;
