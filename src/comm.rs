//! Client-server communication over the local sockets.
//!
//! Every record on the wire is a fixed-layout header, optionally followed
//! by a payload blob and/or descriptors piggybacked as `SCM_RIGHTS`
//! ancillary data on the record they accompany.  Records are sent and
//! received whole; a short read is a protocol error for that connection.

use crate::{
    error::{Error, Result},
    net::{AncillaryData, Fd, SocketAncillary, UnixStreamExt},
    MAX_ARGS_SIZE,
};
use nix::{
    errno::Errno,
    sys::socket::{
        accept4, bind, getsockopt, listen, socket, sockopt, AddressFamily, SockFlag, SockType,
        UnixAddr, UnixCredentials,
    },
};
use std::{
    ffi::CString,
    io::{IoSlice, IoSliceMut},
    mem,
    os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd},
    os::unix::net::UnixStream,
    path::Path,
    time::Duration,
};
use zerocopy::{AsBytes, FromBytes};

/// Command kinds; a bitset so a job can record which commands it has seen.
pub const CMD_OPEN_SESSION: u32 = 1 << 0;
pub const CMD_JOB_TYPE: u32 = 1 << 1;
pub const CMD_JOB_FDS: u32 = 1 << 2;
pub const CMD_JOB_ARGUMENTS: u32 = 1 << 3;
pub const CMD_JOB_ENVIRON: u32 = 1 << 4;
pub const CMD_JOB_CHROOT_FD: u32 = 1 << 5;
pub const CMD_JOB_PERSONALITY: u32 = 1 << 6;
pub const CMD_JOB_RUN: u32 = 1 << 7;

/// Response status codes.
pub const CMD_STATUS_DONE: i32 = 0;
pub const CMD_STATUS_FAILED: i32 = -1;

/// The kinds of work a job can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    GetConf,
    KillUid,
    GetUgid1,
    ChrootUid1,
    GetUgid2,
    ChrootUid2,
}

impl JobKind {
    pub fn from_code(code: u32) -> Option<JobKind> {
        match code {
            1 => Some(JobKind::GetConf),
            2 => Some(JobKind::KillUid),
            3 => Some(JobKind::GetUgid1),
            4 => Some(JobKind::ChrootUid1),
            5 => Some(JobKind::GetUgid2),
            6 => Some(JobKind::ChrootUid2),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            JobKind::GetConf => 1,
            JobKind::KillUid => 2,
            JobKind::GetUgid1 => 3,
            JobKind::ChrootUid1 => 4,
            JobKind::GetUgid2 => 5,
            JobKind::ChrootUid2 => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::GetConf => "getconf",
            JobKind::KillUid => "killuid",
            JobKind::GetUgid1 => "getugid1",
            JobKind::ChrootUid1 => "chrootuid1",
            JobKind::GetUgid2 => "getugid2",
            JobKind::ChrootUid2 => "chrootuid2",
        }
    }

    pub fn is_chrootuid(self) -> bool {
        matches!(self, JobKind::ChrootUid1 | JobKind::ChrootUid2)
    }
}

/// Command header.
///
/// `len` is either the payload byte count or a small inline value (job
/// type code, subconfig number, personality) depending on the command.
#[derive(Debug, AsBytes, FromBytes, Default, Clone, Copy)]
#[repr(C)]
pub struct Header {
    pub kind: u32,
    pub len: u32,
}

impl Header {
    pub const SIZE: usize = mem::size_of::<Self>();
}

/// Response header; `len` bytes of diagnostic text follow when nonzero.
#[derive(Debug, AsBytes, FromBytes, Default, Clone, Copy)]
#[repr(C)]
pub struct Response {
    pub rc: i32,
    pub len: u32,
}

impl Response {
    pub const SIZE: usize = mem::size_of::<Self>();
}

/// One accepted or established protocol connection.
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
}

impl From<UnixStream> for Connection {
    fn from(stream: UnixStream) -> Self {
        Self { stream }
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Connection {
    /// Create a connected pair, e.g. the X11 control channel.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((a.into(), b.into()))
    }

    /// Adopt a raw descriptor, e.g. one inherited across fork.
    ///
    /// # Safety
    ///
    /// `fd` must be an open Unix stream socket owned by the caller.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        UnixStream::from_raw_fd(fd).into()
    }

    /// Give up ownership of the underlying descriptor.
    pub fn into_raw_fd(self) -> RawFd {
        self.stream.into_raw_fd()
    }

    /// Bound the time a peer may keep us waiting in a receive.
    pub fn set_recv_timeout(&self, secs: u64) -> Result<()> {
        self.stream
            .set_read_timeout(Some(Duration::from_secs(secs)))
            .map_err(Into::into)
    }

    /// The peer's credentials as reported by the kernel.
    pub fn peer_creds(&self) -> Result<UnixCredentials> {
        getsockopt(self.stream.as_raw_fd(), sockopt::PeerCredentials).map_err(Into::into)
    }

    fn send_exact(&self, buf: &[u8]) -> Result<()> {
        let fd = self.stream.as_raw_fd();
        let mut off = 0;
        while off < buf.len() {
            let n = unsafe {
                libc::send(
                    fd,
                    buf[off..].as_ptr().cast(),
                    buf.len() - off,
                    libc::MSG_NOSIGNAL,
                )
            };
            if n < 0 {
                let err = Errno::last();
                if err == Errno::EINTR {
                    continue;
                }
                return Err(err.into());
            }
            if n == 0 {
                return Err(Error::protocol("unexpected EOF"));
            }
            off += n as usize;
        }
        Ok(())
    }

    fn recv_exact(&self, buf: &mut [u8]) -> Result<()> {
        let fd = self.stream.as_raw_fd();
        let mut off = 0;
        while off < buf.len() {
            let n = unsafe {
                libc::recv(
                    fd,
                    buf[off..].as_mut_ptr().cast(),
                    buf.len() - off,
                    libc::MSG_WAITALL,
                )
            };
            if n < 0 {
                let err = Errno::last();
                if err == Errno::EINTR {
                    continue;
                }
                return Err(err.into());
            }
            if n == 0 {
                return Err(Error::protocol("unexpected EOF"));
            }
            off += n as usize;
        }
        Ok(())
    }

    pub fn send_header(&self, kind: u32, len: u32) -> Result<()> {
        let hdr = Header { kind, len };
        self.send_exact(hdr.as_bytes())
    }

    pub fn recv_header(&self) -> Result<Header> {
        let mut hdr = Header::default();
        self.recv_exact(hdr.as_bytes_mut())?;
        Ok(hdr)
    }

    /// Send a response record, silently tolerating a client that already
    /// disconnected.
    pub fn send_response(&self, rc: i32, text: Option<&str>) -> Result<()> {
        let text = text.filter(|t| !t.is_empty());
        let size = text.map(|t| t.len() + 1).unwrap_or(0);

        let resp = Response {
            rc,
            len: size as u32,
        };
        match self.send_exact(resp.as_bytes()) {
            Err(Error::Unix(Errno::EPIPE)) => return Ok(()),
            other => other?,
        }

        if let Some(text) = text {
            let mut data = Vec::with_capacity(size);
            data.extend_from_slice(text.as_bytes());
            data.push(0);
            match self.send_exact(&data) {
                Err(Error::Unix(Errno::EPIPE)) => return Ok(()),
                other => other?,
            }
        }
        Ok(())
    }

    /// Receive a response record and its optional diagnostic text.
    pub fn recv_response(&self) -> Result<(i32, Option<String>)> {
        let mut resp = Response::default();
        self.recv_exact(resp.as_bytes_mut())?;

        let text = if resp.len > 0 {
            let mut data = vec![0u8; resp.len as usize];
            self.recv_exact(&mut data)?;
            while data.last() == Some(&0) {
                data.pop();
            }
            Some(String::from_utf8_lossy(&data).into_owned())
        } else {
            None
        };

        Ok((resp.rc, text))
    }

    /// Send descriptors in a single message.
    ///
    /// The kernel requires at least one byte of regular data to carry
    /// ancillary data, so an empty `data` is padded with one zero byte.
    pub fn fd_send(&self, fds: &[RawFd], data: &[u8]) -> Result<()> {
        let dummy = [0u8];
        let payload = if data.is_empty() { &dummy[..] } else { data };

        let mut ancillary_buffer = [0u8; 128];
        let mut ancillary = SocketAncillary::new(&mut ancillary_buffer[..]);
        if !ancillary.add_fds(fds) {
            return Err(Error::protocol("too many descriptors"));
        }

        let bufs = [IoSlice::new(payload)];
        let n = self
            .stream
            .send_vectored_with_ancillary(&bufs, &mut ancillary)?;
        if n != payload.len() {
            return Err(Error::protocol("short descriptor message"));
        }
        Ok(())
    }

    /// Receive exactly `n_fds` descriptors and `data_len` bytes of data
    /// from a single message.
    ///
    /// The peer is expected to follow the protocol; any irregularity —
    /// missing, truncated, short or stray ancillary data — fails the
    /// connection.  Descriptors received along an error path are closed.
    pub fn fd_recv(&self, n_fds: usize, data_len: usize) -> Result<(Vec<Fd>, Vec<u8>)> {
        let mut data = vec![0u8; data_len.max(1)];
        let mut ancillary_buffer = [0u8; 128];
        let mut ancillary = SocketAncillary::new(&mut ancillary_buffer[..]);

        let mut bufs = [IoSliceMut::new(&mut data)];
        let n = self
            .stream
            .recv_vectored_with_ancillary(&mut bufs, &mut ancillary)?;
        if n == 0 {
            return Err(Error::protocol("unexpected EOF"));
        }
        if n != data.len() {
            return Err(Error::protocol("short descriptor message"));
        }

        if ancillary.truncated() {
            return Err(Error::protocol("truncated ancillary data"));
        }

        let mut fds = Vec::new();
        let mut messages = 0;
        for message in ancillary.messages() {
            messages += 1;
            match message {
                Ok(AncillaryData::ScmRights(scm_rights)) => {
                    fds.extend(scm_rights.map(Fd::from));
                }
                Err(_) => {
                    return Err(Error::protocol("unexpected ancillary data"));
                }
            }
        }

        if messages == 0 {
            return Err(Error::protocol("no ancillary data"));
        }
        if messages > 1 {
            return Err(Error::protocol("stray ancillary data"));
        }
        if fds.len() != n_fds {
            return Err(Error::protocol("wrong number of descriptors"));
        }

        if data_len == 0 {
            data.clear();
        }
        Ok((fds, data))
    }

    /// Send a command carrying descriptors: header first, then one
    /// descriptor-passing message.
    pub fn send_fds(&self, kind: u32, fds: &[RawFd]) -> Result<()> {
        let len = fds.len() * mem::size_of::<RawFd>();
        self.send_header(kind, len as u32)?;
        self.fd_send(fds, &[])
    }

    /// Send a command carrying a NUL-separated string blob.
    pub fn send_strings(&self, kind: u32, items: &[CString]) -> Result<()> {
        let size: usize = items.iter().map(|s| s.as_bytes().len() + 1).sum();
        if size > MAX_ARGS_SIZE {
            return Err(Error::protocol("argument blob too large"));
        }

        self.send_header(kind, size as u32)?;

        let mut blob = Vec::with_capacity(size);
        for item in items {
            blob.extend_from_slice(item.as_bytes_with_nul());
        }
        self.send_exact(&blob)
    }

    /// Receive a payload blob, rejecting oversized requests before
    /// allocation.
    pub fn recv_blob(&self, len: usize, cap: usize) -> Result<Vec<u8>> {
        if len > cap {
            return Err(Error::protocol("payload too large"));
        }
        let mut blob = vec![0u8; len];
        if len > 0 {
            self.recv_exact(&mut blob)?;
        }
        Ok(blob)
    }
}

/// Re-split a NUL-separated blob into strings.
///
/// An unterminated tail still becomes an entry, as if a final NUL had been
/// appended.
pub fn split_nul_blob(blob: &[u8]) -> Vec<CString> {
    let mut out = Vec::new();
    let mut rest = blob;
    while !rest.is_empty() {
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .unwrap_or_else(|| rest.len());
        out.push(unsafe { CString::from_vec_unchecked(rest[..end].to_vec()) });
        if end == rest.len() {
            break;
        }
        rest = &rest[end + 1..];
    }
    out
}

/// Create a listening socket node.
///
/// All necessary path components are assumed to exist with proper
/// permissions; a stale node is removed first.
pub fn srv_listen(path: &Path) -> Result<Fd> {
    match nix::unistd::unlink(path) {
        Ok(()) | Err(Errno::ENOENT) => {}
        Err(err) => return Err(Error::os(format!("unlink: {}", path.display()), err)),
    }

    let fd = Fd::from(socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?);

    let addr = UnixAddr::new(path)?;
    bind(fd.as_raw_fd(), &addr)?;
    listen(fd.as_raw_fd(), 16)?;

    Ok(fd)
}

/// Create a listening socket at a path relative to the current directory,
/// e.g. the in-chroot `dev/log` and X11 sockets.
pub fn unix_listen(path: &str) -> Result<Fd> {
    let fd = Fd::from(socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )?);

    let addr = UnixAddr::new(path)?;
    bind(fd.as_raw_fd(), &addr)?;
    listen(fd.as_raw_fd(), 16)?;

    Ok(fd)
}

/// Accept one connection with close-on-exec set.
pub fn srv_accept(listen_fd: RawFd) -> Result<Connection> {
    let fd = accept4(listen_fd, SockFlag::SOCK_CLOEXEC)?;
    Ok(unsafe { Connection::from_raw_fd(fd) })
}

/// Accept one plain connection, e.g. a log or X11 client.
pub fn unix_accept(listen_fd: RawFd) -> Result<Fd> {
    nix::sys::socket::accept(listen_fd)
        .map(Fd::from)
        .map_err(Into::into)
}

/// Connect to a socket under `dir`.
pub fn srv_connect(dir: &str, name: &str) -> Result<Connection> {
    UnixStream::connect(Path::new(dir).join(name))
        .map(Connection::from)
        .map_err(Into::into)
}

/// Connect to a socket under `dir` if it is there and accepting.
pub fn srv_try_connect(dir: &str, name: &str) -> Result<Option<Connection>> {
    match UnixStream::connect(Path::new(dir).join(name)) {
        Ok(stream) => Ok(Some(stream.into())),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{read, write};

    #[test]
    fn test_header_roundtrip() {
        let (a, b) = Connection::pair().unwrap();
        a.send_header(CMD_JOB_TYPE, JobKind::GetConf.code()).unwrap();
        let hdr = b.recv_header().unwrap();
        assert_eq!(hdr.kind, CMD_JOB_TYPE);
        assert_eq!(JobKind::from_code(hdr.len), Some(JobKind::GetConf));
    }

    #[test]
    fn test_response_with_text() {
        let (a, b) = Connection::pair().unwrap();
        a.send_response(CMD_STATUS_FAILED, Some("bad request")).unwrap();
        let (rc, text) = b.recv_response().unwrap();
        assert_eq!(rc, CMD_STATUS_FAILED);
        assert_eq!(text.as_deref(), Some("bad request"));
    }

    #[test]
    fn test_response_without_text() {
        let (a, b) = Connection::pair().unwrap();
        a.send_response(CMD_STATUS_DONE, None).unwrap();
        let (rc, text) = b.recv_response().unwrap();
        assert_eq!(rc, CMD_STATUS_DONE);
        assert_eq!(text, None);
    }

    #[test]
    fn test_fd_passing() {
        let (a, b) = Connection::pair().unwrap();
        let (pipe_rd, pipe_wr) = nix::unistd::pipe().unwrap();

        a.fd_send(&[pipe_wr], b"key").unwrap();
        let (fds, data) = b.fd_recv(1, 3).unwrap();
        assert_eq!(data, b"key");
        assert_eq!(fds.len(), 1);

        write(fds[0].as_raw_fd(), b"x").unwrap();
        let mut buf = [0u8; 1];
        read(pipe_rd, &mut buf).unwrap();
        assert_eq!(&buf, b"x");

        nix::unistd::close(pipe_rd).unwrap();
        nix::unistd::close(pipe_wr).unwrap();
    }

    #[test]
    fn test_fd_recv_wrong_count() {
        let (a, b) = Connection::pair().unwrap();
        let (pipe_rd, pipe_wr) = nix::unistd::pipe().unwrap();

        a.fd_send(&[pipe_rd, pipe_wr], &[]).unwrap();
        assert!(b.fd_recv(3, 0).is_err());

        nix::unistd::close(pipe_rd).unwrap();
        nix::unistd::close(pipe_wr).unwrap();
    }

    #[test]
    fn test_strings_roundtrip() {
        let (a, b) = Connection::pair().unwrap();
        let items = vec![
            CString::new("/bin/sh").unwrap(),
            CString::new("-c").unwrap(),
            CString::new("true").unwrap(),
        ];
        a.send_strings(CMD_JOB_ARGUMENTS, &items).unwrap();

        let hdr = b.recv_header().unwrap();
        assert_eq!(hdr.kind, CMD_JOB_ARGUMENTS);
        let blob = b.recv_blob(hdr.len as usize, MAX_ARGS_SIZE).unwrap();
        assert_eq!(split_nul_blob(&blob), items);
    }

    #[test]
    fn test_blob_cap_rejected_before_allocation() {
        let (a, _b) = Connection::pair().unwrap();
        assert!(a.recv_blob(MAX_ARGS_SIZE + 1, MAX_ARGS_SIZE).is_err());
    }

    #[test]
    fn test_split_nul_blob_edge_cases() {
        assert!(split_nul_blob(b"").is_empty());
        let empty_entry = split_nul_blob(b"a\0\0b\0");
        assert_eq!(empty_entry.len(), 3);
        assert_eq!(empty_entry[1].as_bytes(), b"");
        // Unterminated tail is kept.
        let tail = split_nul_blob(b"a\0b");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].as_bytes(), b"b");
    }
}
