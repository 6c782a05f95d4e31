//! X11 connection relays with authentication cookie substitution.

use crate::{
    comm::unix_accept,
    error::Result,
    fds::unblock_fd,
    io::{read_retry, write_loop},
    net::Fd,
    x11::X11Forward,
    BUF_SIZE,
};
use bytes::{Buf, BytesMut};
use nix::sys::select::FdSet;
use std::os::unix::io::AsRawFd;

/// What the connection-setup inspection decided.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthCheck {
    /// Auth data matched the fake cookie and was replaced in place.
    Substituted,
    /// The packet carries no authentication data; forward untouched.
    NoAuth,
    /// Malformed packet or wrong cookie; the connection must be dropped.
    Reject(&'static str),
}

fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

/// Inspect the first client packet of an X11 connection and substitute
/// the real cookie for the fake one.
///
/// The packet starts with a byte-order marker (0x42 MSB-first or 0x6c
/// LSB-first) and a 12-byte prefix carrying the auth protocol name and
/// auth data lengths, each padded to a multiple of 4.
pub fn check_auth_packet(buf: &mut [u8], saved: &[u8], fake: &[u8]) -> AuthCheck {
    if buf.len() < 12 {
        return AuthCheck::Reject("initial X11 packet too short");
    }

    let (proto_len, data_len) = match buf[0] {
        0x42 => (
            (buf[7] as usize) | ((buf[6] as usize) << 8),
            (buf[9] as usize) | ((buf[8] as usize) << 8),
        ),
        0x6c => (
            (buf[6] as usize) | ((buf[7] as usize) << 8),
            (buf[8] as usize) | ((buf[9] as usize) << 8),
        ),
        _ => return AuthCheck::Reject("unrecognized X11 byte order"),
    };

    let expected = 12 + pad4(proto_len) + pad4(data_len);
    if buf.len() < expected {
        return AuthCheck::Reject("initial X11 packet too short");
    }

    if proto_len == 0 && data_len == 0 {
        return AuthCheck::NoAuth;
    }

    let offset = 12 + pad4(proto_len);
    if data_len != fake.len() || &buf[offset..offset + data_len] != fake {
        return AuthCheck::Reject("X11 auth data does not match fake data");
    }

    buf[offset..offset + data_len].copy_from_slice(saved);
    AuthCheck::Substituted
}

/// One relayed connection: `slave` is the accepted in-chroot client,
/// `master` the matching connection to the real display.
#[derive(Debug)]
struct Relay {
    master: Fd,
    slave: Fd,
    master_queue: BytesMut,
    slave_queue: BytesMut,
    authenticated: bool,
}

/// All live relays plus the two cookies.
#[derive(Debug, Default)]
pub struct X11Relays {
    relays: Vec<Relay>,
    saved: Vec<u8>,
    fake: Vec<u8>,
}

impl X11Relays {
    pub fn set_keys(&mut self, saved: Vec<u8>, fake: Vec<u8>) {
        self.saved = saved;
        self.fake = fake;
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Select each relay side for reading when its queue is empty and
    /// for writing when data is pending.
    pub fn add_fds(&self, read_fds: &mut FdSet, write_fds: &mut FdSet) {
        for relay in &self.relays {
            if relay.slave_queue.is_empty() {
                read_fds.insert(relay.slave.as_raw_fd());
            } else {
                write_fds.insert(relay.master.as_raw_fd());
            }
            if relay.master_queue.is_empty() {
                read_fds.insert(relay.master.as_raw_fd());
            } else {
                write_fds.insert(relay.slave.as_raw_fd());
            }
        }
    }

    /// Accept a new in-chroot connection and pair it with a fresh
    /// connection to the real display.
    pub fn handle_new(
        &mut self,
        listen_fd: &Fd,
        read_fds: &FdSet,
        forward: &X11Forward,
        dir_fd: Option<&Fd>,
    ) {
        if !read_fds.contains(listen_fd.as_raw_fd()) {
            return;
        }

        let accepted = match unix_accept(listen_fd.as_raw_fd()) {
            Ok(fd) => fd,
            Err(err) => {
                hasher_log::error!("accept: {}\r", err);
                return;
            }
        };

        match forward.connect(dir_fd) {
            Ok(connected) => {
                let _ = unblock_fd(accepted.as_raw_fd());
                let _ = unblock_fd(connected.as_raw_fd());
                self.relays.push(Relay {
                    master: connected,
                    slave: accepted,
                    master_queue: BytesMut::new(),
                    slave_queue: BytesMut::new(),
                    authenticated: false,
                });
            }
            Err(err) => {
                hasher_log::error!("X11 connect failed: {}\r", err);
            }
        }
    }

    /// Push bytes in both directions for every relay that fired.
    pub fn handle_select(&mut self, read_fds: &FdSet, write_fds: &FdSet) -> Result<()> {
        let mut closed = Vec::new();

        for (idx, relay) in self.relays.iter_mut().enumerate() {
            if !relay.run(read_fds, write_fds, &self.saved, &self.fake) {
                closed.push(idx);
            }
        }

        for idx in closed.into_iter().rev() {
            self.relays.remove(idx);
        }
        Ok(())
    }
}

impl Relay {
    /// One round of relaying; false means the connection is finished.
    fn run(&mut self, read_fds: &FdSet, write_fds: &FdSet, saved: &[u8], fake: &[u8]) -> bool {
        // Pending caller-display data to the in-chroot client.
        if !self.master_queue.is_empty() && write_fds.contains(self.slave.as_raw_fd()) {
            match write_loop(self.slave.as_raw_fd(), &self.master_queue) {
                Ok(n) if n > 0 => self.master_queue.advance(n),
                _ => return false,
            }
        }

        if self.master_queue.is_empty() && read_fds.contains(self.master.as_raw_fd()) {
            let mut buf = [0u8; BUF_SIZE];
            match read_retry(self.master.as_raw_fd(), &mut buf) {
                Ok(n) if n > 0 => self.master_queue.extend_from_slice(&buf[..n]),
                _ => return false,
            }
        }

        // Pending in-chroot client data to the real display.
        if !self.slave_queue.is_empty() && write_fds.contains(self.master.as_raw_fd()) {
            match write_loop(self.master.as_raw_fd(), &self.slave_queue) {
                Ok(n) if n > 0 => self.slave_queue.advance(n),
                _ => return false,
            }
        }

        if self.slave_queue.is_empty() && read_fds.contains(self.slave.as_raw_fd()) {
            let mut buf = [0u8; BUF_SIZE];
            match read_retry(self.slave.as_raw_fd(), &mut buf) {
                Ok(n) if n > 0 => {
                    self.slave_queue.extend_from_slice(&buf[..n]);
                    if !self.authenticated {
                        self.authenticated = true;
                        match check_auth_packet(&mut self.slave_queue, saved, fake) {
                            AuthCheck::Substituted | AuthCheck::NoAuth => {}
                            AuthCheck::Reject(reason) => {
                                hasher_log::error!("{}\r", reason);
                                return false;
                            }
                        }
                    }
                }
                _ => return false,
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal connection-setup packet.
    fn packet(order: u8, proto: &[u8], data: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 12];
        buf[0] = order;
        let (proto_len, data_len) = (proto.len() as u16, data.len() as u16);
        if order == 0x42 {
            buf[6..8].copy_from_slice(&proto_len.to_be_bytes());
            buf[8..10].copy_from_slice(&data_len.to_be_bytes());
        } else {
            buf[6..8].copy_from_slice(&proto_len.to_le_bytes());
            buf[8..10].copy_from_slice(&data_len.to_le_bytes());
        }
        buf.extend_from_slice(proto);
        buf.resize(12 + pad4(proto.len()), 0);
        buf.extend_from_slice(data);
        buf.resize(12 + pad4(proto.len()) + pad4(data.len()), 0);
        buf
    }

    #[test]
    fn test_substitution_lsb() {
        let fake = [0xaau8; 16];
        let real = [0x11u8; 16];
        let mut buf = packet(0x6c, b"MIT-MAGIC-COOKIE-1", &fake);

        assert_eq!(check_auth_packet(&mut buf, &real, &fake), AuthCheck::Substituted);
        let offset = 12 + pad4(18);
        assert_eq!(&buf[offset..offset + 16], &real);
    }

    #[test]
    fn test_substitution_msb() {
        let fake = [0xabu8; 16];
        let real = [0x22u8; 16];
        let mut buf = packet(0x42, b"MIT-MAGIC-COOKIE-1", &fake);

        assert_eq!(check_auth_packet(&mut buf, &real, &fake), AuthCheck::Substituted);
        let offset = 12 + pad4(18);
        assert_eq!(&buf[offset..offset + 16], &real);
    }

    #[test]
    fn test_no_auth_passes_through() {
        let mut buf = packet(0x6c, b"", b"");
        let before = buf.clone();
        assert_eq!(check_auth_packet(&mut buf, &[1], &[2]), AuthCheck::NoAuth);
        assert_eq!(buf, before);
    }

    #[test]
    fn test_wrong_cookie_rejected() {
        let fake = [0xaau8; 16];
        let wrong = [0xbbu8; 16];
        let mut buf = packet(0x6c, b"MIT-MAGIC-COOKIE-1", &wrong);
        assert!(matches!(
            check_auth_packet(&mut buf, &[0x11; 16], &fake),
            AuthCheck::Reject(_)
        ));
        // Nothing was substituted.
        let offset = 12 + pad4(18);
        assert_eq!(&buf[offset..offset + 16], &wrong);
    }

    #[test]
    fn test_malformed_rejected() {
        let mut short = vec![0x6c, 0, 0];
        assert!(matches!(
            check_auth_packet(&mut short, &[], &[]),
            AuthCheck::Reject(_)
        ));

        let mut bad_order = packet(0x00, b"", b"");
        assert!(matches!(
            check_auth_packet(&mut bad_order, &[], &[]),
            AuthCheck::Reject(_)
        ));
    }
}
