//! Forwarding of the chroot's `/dev/log` stream to the caller's stderr.

use crate::{
    comm::unix_accept,
    error::Result,
    fds::unblock_fd,
    io::{read_retry, xwrite_all, Counters},
    net::Fd,
    BUF_SIZE,
};
use nix::sys::select::FdSet;
use std::os::unix::io::AsRawFd;

/// Chunk a log read for the caller's terminal: truncate at an embedded
/// NUL and terminate with `\r\n` when no newline is present.
pub fn normalize_log_chunk(data: &[u8]) -> Vec<u8> {
    let end = data.iter().position(|&b| b == 0).unwrap_or_else(|| data.len());
    let mut out = data[..end].to_vec();
    if !out.is_empty() && out.last() != Some(&b'\n') {
        out.push(b'\r');
        out.push(b'\n');
    }
    out
}

/// The set of accepted `/dev/log` reader connections.
#[derive(Debug, Default)]
pub struct LogReaders {
    readers: Vec<Fd>,
}

impl LogReaders {
    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Select all readers for input.
    pub fn add_fds(&self, read_fds: &mut FdSet) {
        for reader in &self.readers {
            read_fds.insert(reader.as_raw_fd());
        }
    }

    /// Accept a new reader if the listener fired.
    pub fn handle_new(&mut self, listen_fd: &Fd, read_fds: &FdSet) {
        if !read_fds.contains(listen_fd.as_raw_fd()) {
            return;
        }
        match unix_accept(listen_fd.as_raw_fd()) {
            Ok(fd) => {
                if unblock_fd(fd.as_raw_fd()).is_ok() {
                    self.readers.push(fd);
                }
            }
            Err(err) => {
                hasher_log::error!("accept: {}\r", err);
            }
        }
    }

    /// Drain every reader that fired; closed readers are forgotten.
    pub fn handle_select(&mut self, read_fds: &FdSet, counters: &mut Counters) -> Result<()> {
        let mut closed = Vec::new();

        for (idx, reader) in self.readers.iter().enumerate() {
            if !read_fds.contains(reader.as_raw_fd()) {
                continue;
            }

            let mut buf = [0u8; BUF_SIZE - 2];
            match read_retry(reader.as_raw_fd(), &mut buf) {
                Ok(n) if n > 0 => {
                    let chunk = normalize_log_chunk(&buf[..n]);
                    xwrite_all(libc::STDERR_FILENO, &chunk, counters)?;
                }
                _ => closed.push(idx),
            }
        }

        for idx in closed.into_iter().rev() {
            self.readers.remove(idx);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_log_chunk;

    #[test]
    fn test_newline_enforced_as_crlf() {
        assert_eq!(normalize_log_chunk(b"hello"), b"hello\r\n");
        assert_eq!(normalize_log_chunk(b"hello\n"), b"hello\n");
        assert_eq!(normalize_log_chunk(b""), b"");
    }

    #[test]
    fn test_truncated_at_nul() {
        assert_eq!(normalize_log_chunk(b"abc\0def"), b"abc\r\n");
    }
}
