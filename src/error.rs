//! Error definitions

use derive_more::{Display, From};
use std::{borrow::Cow, io, num};

/// Common errors of the privilege ladder.
///
/// The variants follow the failure taxonomy of the daemon: configuration,
/// protocol, authentication, resource and child-runtime errors.  Every
/// privileged subprocess maps an unrecoverable `Error` to a nonzero exit
/// status at its top level; protocol errors additionally produce a
/// `FAILED "bad request"` response before the connection is dropped.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "I/O error: {}", "_0")]
    Io(io::Error),
    #[display(fmt = "{}", "_0")]
    Unix(nix::Error),
    #[display(fmt = "{}", "_0")]
    NulError(std::ffi::NulError),
    #[display(fmt = "{}", "_0")]
    InvalidNumber(num::ParseIntError),
    /// Bad option, bad value or violated pair invariant; fatal, no retry.
    #[display(fmt = "{}", "_0")]
    #[from(ignore)]
    Config(Cow<'static, str>),
    /// The client violated the wire protocol.
    #[display(fmt = "{}", "_0")]
    #[from(ignore)]
    Protocol(Cow<'static, str>),
    /// Peer credentials failed validation; never echoed to the peer.
    #[display(fmt = "{}", "_0")]
    #[from(ignore)]
    Auth(Cow<'static, str>),
    /// A syscall failed in a context worth naming.
    #[display(fmt = "{}: {}", "_0", "_1")]
    #[from(ignore)]
    Os(Cow<'static, str>, nix::Error),
    #[display(fmt = "job failed")]
    JobFailed,
}

impl Error {
    pub fn config<S: Into<Cow<'static, str>>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn protocol<S: Into<Cow<'static, str>>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn auth<S: Into<Cow<'static, str>>>(msg: S) -> Self {
        Error::Auth(msg.into())
    }

    pub fn os<S: Into<Cow<'static, str>>>(what: S, err: nix::Error) -> Self {
        Error::Os(what.into(), err)
    }

    /// Whether the error is a client-side protocol violation, answered
    /// with `FAILED "bad request"`.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn test_display() {
        let err = Error::config("user1 coincides with user2");
        assert_eq!(err.to_string(), "user1 coincides with user2");

        let err = Error::os("mount: /dev", nix::Error::EPERM);
        assert!(err.to_string().starts_with("mount: /dev: "));
    }

    #[test]
    fn test_protocol_detection() {
        assert!(Error::protocol("repeated command").is_protocol());
        assert!(!Error::config("bad value").is_protocol());
    }
}
