//! X11 forwarding support.
//!
//! The caller hands us a DISPLAY string and an authentication cookie in
//! hex.  Inside the chroot the child listens on display `:10` with a
//! freshly generated fake cookie; the parent relays accepted connections
//! to the real display, substituting the real cookie for the fake one in
//! the connection setup packet.

use crate::{
    comm::unix_listen,
    error::{Error, Result},
    net::Fd,
};
use nix::{
    fcntl::{open, OFlag},
    sys::socket::{connect, getsockname, socket, AddressFamily, SockFlag, SockType, UnixAddr},
    sys::stat::Mode,
    unistd::{chdir, fchdir},
};
use std::{
    net::TcpStream,
    os::unix::io::{AsRawFd, IntoRawFd},
};

pub const X11_UNIX_DIR: &str = "/tmp/.X11-unix";

/// The display number served inside the chroot.
pub const X11_CHROOT_DISPLAY: u32 = 10;

/// How to reach the real display server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMethod {
    /// `AF_UNIX` socket `X<number>` under [`X11_UNIX_DIR`].
    Unix,
    /// TCP to `<host>:(6000 + number)`; requires the caller's network.
    Inet,
}

/// A parsed DISPLAY plus the validated cookie length.
#[derive(Debug, Clone)]
pub struct X11Forward {
    pub method: ConnectMethod,
    pub host: String,
    pub display_number: u32,
    /// Cookie length in bytes (half the hex length).
    pub data_len: usize,
}

/// Parse `<host>:<number>[.<screen>]`.
///
/// Returns `None` when the display is unusable; forwarding is then
/// silently disabled.
pub fn parse_display(display: &str, key: &str) -> Option<X11Forward> {
    if key.len() & 1 != 0 || key.is_empty() {
        return None;
    }

    let colon = display.rfind(':')?;
    let host = &display[..colon];
    let number = &display[colon + 1..];

    let number = match number.find('.') {
        Some(dot) => &number[..dot],
        None => number,
    };
    let display_number = number.parse::<u32>().ok()?;
    if display_number > 100 {
        return None;
    }

    let method = if host.is_empty() || host.ends_with("/unix") {
        ConnectMethod::Unix
    } else {
        ConnectMethod::Inet
    };

    Some(X11Forward {
        method,
        host: host.to_string(),
        display_number,
        data_len: key.len() / 2,
    })
}

/// Decode an even-length hex cookie.
pub fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() & 1 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

/// Encode a cookie as lowercase hex; `xauth` is case-sensitive in places.
pub fn bytes_to_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

impl X11Forward {
    /// Open the X11 socket directory ahead of the chroot, so connects
    /// keep working from inside the new mount namespace.
    ///
    /// Returns `None` (forwarding disabled) when the directory cannot be
    /// opened.
    pub fn prepare_connect(&self) -> Option<Fd> {
        match self.method {
            ConnectMethod::Unix => {
                match open(X11_UNIX_DIR, OFlag::O_RDONLY, Mode::empty()) {
                    Ok(fd) => Some(Fd::from(fd)),
                    Err(err) => {
                        hasher_log::error!("open: {}: {}", X11_UNIX_DIR, err);
                        hasher_log::error!("X11 forwarding disabled");
                        None
                    }
                }
            }
            ConnectMethod::Inet => None,
        }
    }

    /// Open one connection to the real display.
    pub fn connect(&self, dir_fd: Option<&Fd>) -> Result<Fd> {
        match self.method {
            ConnectMethod::Unix => {
                let dir_fd = dir_fd.ok_or_else(|| Error::config("X11 directory not open"))?;
                fchdir(dir_fd.as_raw_fd()).map_err(|err| Error::os("fchdir", err))?;

                let result = (|| {
                    let fd = Fd::from(socket(
                        AddressFamily::Unix,
                        SockType::Stream,
                        SockFlag::empty(),
                        None,
                    )?);
                    let addr = UnixAddr::new(format!("X{}", self.display_number).as_str())?;
                    connect(fd.as_raw_fd(), &addr)?;
                    Ok(fd)
                })();

                chdir("/").map_err(|err| Error::os("chdir: /", err))?;
                result
            }
            ConnectMethod::Inet => {
                let port = 6000 + self.display_number as u16;
                let stream = TcpStream::connect((self.host.as_str(), port))?;
                Ok(Fd::from(stream.into_raw_fd()))
            }
        }
    }
}

/// Create the in-chroot listening socket `/tmp/.X11-unix/X10`.
///
/// Runs with child privileges, after the chroot.
pub fn x11_listen() -> Result<Fd> {
    match nix::unistd::mkdir(X11_UNIX_DIR, Mode::from_bits_truncate(0o700)) {
        Ok(()) | Err(nix::Error::EEXIST) => {}
        Err(err) => return Err(Error::os(format!("mkdir: {}", X11_UNIX_DIR), err)),
    }
    let path = format!("{}/X{}", X11_UNIX_DIR, X11_CHROOT_DISPLAY);
    match nix::unistd::unlink(path.as_str()) {
        Ok(()) | Err(nix::Error::ENOENT) => {}
        Err(err) => return Err(Error::os(format!("unlink: {}", path), err)),
    }
    unix_listen(&path)
}

/// Validate that a descriptor received over the control channel really is
/// the in-chroot X11 listener.
pub fn x11_check_listen(fd: &Fd) -> Result<()> {
    let addr: UnixAddr =
        getsockname(fd.as_raw_fd()).map_err(|err| Error::os("getsockname", err))?;

    let expected = format!("{}/X{}", X11_UNIX_DIR, X11_CHROOT_DISPLAY);
    match addr.path() {
        Some(path) if path.to_string_lossy() == expected => Ok(()),
        other => Err(Error::protocol(format!(
            "getsockname: expected {}, got {:?}",
            expected, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix_displays() {
        let fwd = parse_display(":0", "aabb").unwrap();
        assert_eq!(fwd.method, ConnectMethod::Unix);
        assert_eq!(fwd.display_number, 0);
        assert_eq!(fwd.data_len, 2);

        let fwd = parse_display(":10.0", "00ff").unwrap();
        assert_eq!(fwd.display_number, 10);

        let fwd = parse_display("/var/run/x11/unix:3", "00ff").unwrap();
        assert_eq!(fwd.method, ConnectMethod::Unix);
    }

    #[test]
    fn test_parse_inet_display() {
        let fwd = parse_display("remote.example.com:2.1", "00112233").unwrap();
        assert_eq!(fwd.method, ConnectMethod::Inet);
        assert_eq!(fwd.host, "remote.example.com");
        assert_eq!(fwd.display_number, 2);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_display("nodisplay", "aabb").is_none());
        assert!(parse_display(":abc", "aabb").is_none());
        assert!(parse_display(":101", "aabb").is_none());
        // Odd-length or empty keys disable forwarding.
        assert!(parse_display(":0", "abc").is_none());
        assert!(parse_display(":0", "").is_none());
    }

    #[test]
    fn test_hex_roundtrip() {
        let data = vec![0x00, 0x1f, 0xab, 0xff];
        let hex = bytes_to_hex(&data);
        assert_eq!(hex, "001fabff");
        assert_eq!(hex_to_bytes(&hex).unwrap(), data);
        assert!(hex_to_bytes("0g").is_none());
        assert!(hex_to_bytes("abc").is_none());
    }
}
