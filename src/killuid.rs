//! The killuid job: kill every process of the target uid pair and purge
//! their SysV IPC objects.

use crate::{
    config::Target,
    error::{Error, Result},
    MIN_CHANGE_UID,
};
use nix::{
    sys::signal::{kill, Signal},
    unistd::{getuid, Pid, Uid},
};
use std::mem::zeroed;

// Not exposed by the `libc` crate; values from linux/shm.h.
const SHM_STAT: libc::c_int = 13;
const SHM_INFO: libc::c_int = 14;

fn setreuid(ruid: Uid, euid: Uid) -> nix::Result<()> {
    let res = unsafe { libc::setreuid(ruid.as_raw(), euid.as_raw()) };
    nix::errno::Errno::result(res).map(drop)
}

fn raise_rlimit_nproc() -> Result<()> {
    let mut rlim: libc::rlimit = unsafe { zeroed() };
    if unsafe { libc::getrlimit(libc::RLIMIT_NPROC as _, &mut rlim) } < 0 {
        return Err(Error::os("getrlimit", nix::Error::last()));
    }
    rlim.rlim_cur = libc::RLIM_INFINITY;
    rlim.rlim_max = libc::RLIM_INFINITY;
    // Best effort; the hard limit may be capped.
    unsafe { libc::setrlimit(libc::RLIMIT_NPROC as _, &rlim) };
    Ok(())
}

fn purge_sem(uid1: libc::uid_t, uid2: libc::uid_t) {
    let mut info: libc::seminfo = unsafe { zeroed() };
    let maxid = unsafe { libc::semctl(0, 0, libc::SEM_INFO, &mut info) };
    if maxid < 0 {
        hasher_log::error!("SEM_INFO: {}", nix::Error::last());
        return;
    }

    for id in 0..=maxid {
        let mut buf: libc::semid_ds = unsafe { zeroed() };
        let semid = unsafe { libc::semctl(id, 0, libc::SEM_STAT, &mut buf) };
        if semid < 0 {
            continue;
        }
        if buf.sem_perm.uid != uid1 && buf.sem_perm.uid != uid2 {
            continue;
        }
        unsafe { libc::semctl(semid, 0, libc::IPC_RMID, 0) };
    }
}

fn purge_shm(uid1: libc::uid_t, uid2: libc::uid_t) {
    let mut info: libc::shmid_ds = unsafe { zeroed() };
    let maxid = unsafe { libc::shmctl(0, SHM_INFO, &mut info) };
    if maxid < 0 {
        hasher_log::error!("SHM_INFO: {}", nix::Error::last());
        return;
    }

    for id in 0..=maxid {
        let mut buf: libc::shmid_ds = unsafe { zeroed() };
        let shmid = unsafe { libc::shmctl(id, SHM_STAT, &mut buf) };
        if shmid < 0 {
            continue;
        }
        if buf.shm_perm.uid != uid1 && buf.shm_perm.uid != uid2 {
            continue;
        }
        unsafe { libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut()) };
    }
}

fn purge_msg(uid1: libc::uid_t, uid2: libc::uid_t) {
    let mut info: libc::msqid_ds = unsafe { zeroed() };
    let maxid = unsafe { libc::msgctl(0, libc::MSG_INFO, &mut info) };
    if maxid < 0 {
        hasher_log::error!("MSG_INFO: {}", nix::Error::last());
        return;
    }

    for id in 0..=maxid {
        let mut buf: libc::msqid_ds = unsafe { zeroed() };
        let msqid = unsafe { libc::msgctl(id, libc::MSG_STAT, &mut buf) };
        if msqid < 0 {
            continue;
        }
        if buf.msg_perm.uid != uid1 && buf.msg_perm.uid != uid2 {
            continue;
        }
        unsafe { libc::msgctl(msqid, libc::IPC_RMID, std::ptr::null_mut()) };
    }
}

/// Purge all SysV IPC objects owned by either uid.
pub fn purge_ipc(uid1: libc::uid_t, uid2: libc::uid_t) {
    purge_sem(uid1, uid2);
    purge_shm(uid1, uid2);
    purge_msg(uid1, uid2);
}

/// Kill everything the target uid pair can run, in both orientations, and
/// leave no IPC objects behind.  Idempotent.
pub fn do_killuid(target1: &Target, target2: &Target) -> Result<()> {
    let current = getuid();
    let uid1 = target1.uid;
    let uid2 = target2.uid;

    for uid in [uid1, uid2] {
        if uid.as_raw() < MIN_CHANGE_UID || uid == current {
            return Err(Error::config(format!("invalid uid: {}", uid)));
        }
    }

    raise_rlimit_nproc()?;

    // Do not assume that fs.suid_dumpable == 0.
    if unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0) } != 0 {
        return Err(Error::os("prctl PR_SET_DUMPABLE", nix::Error::last()));
    }

    setreuid(uid1, uid2).map_err(|err| Error::os("setreuid", err))?;

    match kill(Pid::from_raw(-1), Signal::SIGKILL) {
        Ok(()) | Err(nix::Error::ESRCH) => {}
        Err(err) => return Err(Error::os("kill", err)),
    }

    purge_ipc(uid1.as_raw(), uid2.as_raw());

    // Swap the pair so objects visible only to the other orientation are
    // covered too.
    setreuid(uid2, uid1).map_err(|err| Error::os("setreuid", err))?;

    purge_ipc(uid1.as_raw(), uid2.as_raw());

    Ok(())
}

/// Run killuid in a forked subprocess and wait for it, so the caller's
/// credentials stay intact.
pub fn spawn_killuid(target1: &Target, target2: &Target) -> Result<()> {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    match unsafe { fork() }.map_err(|err| Error::os("fork", err))? {
        ForkResult::Child => {
            let code = match do_killuid(target1, target2) {
                Ok(()) => 0,
                Err(err) => {
                    hasher_log::error!("killuid: {}", err);
                    1
                }
            };
            unsafe { libc::_exit(code) };
        }
        ForkResult::Parent { child } => loop {
            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, 0)) => return Ok(()),
                Ok(WaitStatus::Exited(_, rc)) => {
                    return Err(Error::config(format!("killuid: exit status {}", rc)));
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    return Err(Error::config(format!(
                        "killuid: terminated by signal {}",
                        signal
                    )));
                }
                Err(nix::Error::EINTR) => continue,
                Ok(_) => continue,
                Err(err) => return Err(Error::os("waitpid", err)),
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{Gid, Uid};

    fn target(name: &str, uid: libc::uid_t) -> Target {
        Target {
            name: name.to_string(),
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(uid),
        }
    }

    #[test]
    fn test_rejects_low_uid() {
        let t1 = target("alpha", MIN_CHANGE_UID - 1);
        let t2 = target("beta", MIN_CHANGE_UID + 1);
        assert!(do_killuid(&t1, &t2).is_err());
    }

    #[test]
    fn test_rejects_own_uid() {
        let own = getuid().as_raw();
        if own < MIN_CHANGE_UID {
            return;
        }
        let t1 = target("alpha", own);
        let t2 = target("beta", own + 1);
        assert!(do_killuid(&t1, &t2).is_err());
    }
}
