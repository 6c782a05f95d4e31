//! Pidfile handling for the daemon.

use crate::error::{Error, Result};
use nix::{
    fcntl::{flock, FlockArg},
    sys::signal::kill,
    unistd::{getpid, Pid},
};
use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    os::unix::{fs::OpenOptionsExt, io::AsRawFd},
    path::{Path, PathBuf},
};

/// An exclusively locked pidfile.
///
/// The lock is held for the daemon's lifetime; dropping the struct closes
/// the descriptor and releases it, but the file itself is only removed by
/// an explicit [`Pidfile::remove`] on shutdown.
pub struct Pidfile {
    file: File,
    path: PathBuf,
}

/// Whether a daemon holding `path` is already alive.
pub fn check_pid(path: &Path) -> bool {
    let mut buf = String::new();
    let read = File::open(path).and_then(|mut f| f.read_to_string(&mut buf));
    if read.is_err() {
        return false;
    }
    match buf.trim().parse::<libc::pid_t>() {
        Ok(pid) if pid > 0 => kill(Pid::from_raw(pid), None).is_ok(),
        _ => false,
    }
}

impl Pidfile {
    /// Create, lock and fill the pidfile.
    pub fn write(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(path)?;

        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .map_err(|err| Error::os(format!("flock: {}", path.display()), err))?;

        let mut pidfile = Pidfile {
            file,
            path: path.to_path_buf(),
        };
        writeln!(pidfile.file, "{}", getpid())?;
        pidfile.file.flush()?;
        Ok(pidfile)
    }

    /// Refresh the recorded pid, e.g. after daemonizing forked us.
    pub fn update(&mut self) -> Result<()> {
        use std::io::Seek;
        self.file.seek(std::io::SeekFrom::Start(0))?;
        self.file.set_len(0)?;
        writeln!(self.file, "{}", getpid())?;
        self.file.flush()?;
        Ok(())
    }

    pub fn remove(self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pidfile_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        assert!(!check_pid(&path));

        let pidfile = Pidfile::write(&path).unwrap();
        // Our own pid is alive, so the file reports a running daemon.
        assert!(check_pid(&path));

        pidfile.remove();
        assert!(!check_pid(&path));
    }
}
