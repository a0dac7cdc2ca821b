//! Per-sandbox reference counting through advisory byte-range locks.
//!
//! Every user of a sandbox holds a shared lock on byte 0 of the sandbox's
//! `refs` file; whoever manages a non-blocking exclusive lock at cleanup
//! time is the last user.  The kernel releases advisory locks when a process
//! dies, so a killed session can never strand a count the way an on-disk
//! counter would.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use libc;

use log::debug;

use crate::err::{Error, Result};
use crate::util;

fn lock(typ: libc::c_int) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = typ as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 1;
    fl
}

/// A held reference to a sandbox.  Dropping it releases the count.
#[derive(Debug)]
pub struct Ref {
    file: File,
}

impl Ref {
    /// Open (creating if missing) the lock file and take a blocking shared
    /// lock on its first byte.  The file's content is never touched.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Ref> {
        debug!("ref acquire {:?}", path.as_ref().display());
        let file = util::open(&path, libc::O_RDWR | libc::O_CREAT, 0o644)?;
        let fl = lock(libc::F_RDLCK);
        if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &fl) } != 0 {
            return Err(Error::last_file_error("fcntl F_SETLKW", path));
        }
        Ok(Ref { file })
    }

    /// Probe whether this process is the sandbox's last user.  On success
    /// the exclusive lock is retained, covering the caller's cleanup window.
    pub fn last_user(&self) -> Result<bool> {
        let fl = lock(libc::F_WRLCK);
        if unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_SETLK, &fl) } == 0 {
            return Ok(true);
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EACCES) => Ok(false),
            _ => Err(Error::last_os_error("fcntl F_SETLK")),
        }
    }
}

impl Drop for Ref {
    fn drop(&mut self) {
        let fl = lock(libc::F_UNLCK);
        if unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_SETLK, &fl) } != 0 {
            debug!(
                "ref release: {}",
                std::io::Error::last_os_error()
            );
        }
        // the descriptor closes with self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp::TempDir;

    #[test]
    fn test_acquire_creates_lock_file() {
        let tdir = TempDir::new().unwrap();
        let refs = tdir.path().join("refs");
        let r = Ref::acquire(&refs).unwrap();
        assert!(refs.is_file());
        drop(r);
        // still present, never truncated or removed by release
        assert!(refs.is_file());
    }

    #[test]
    fn test_sole_user_sees_itself_last() {
        let tdir = TempDir::new().unwrap();
        let r = Ref::acquire(tdir.path().join("refs")).unwrap();
        assert!(r.last_user().unwrap());
    }

    #[test]
    fn test_reacquire_after_release() {
        let tdir = TempDir::new().unwrap();
        let refs = tdir.path().join("refs");
        drop(Ref::acquire(&refs).unwrap());
        let r = Ref::acquire(&refs).unwrap();
        assert!(r.last_user().unwrap());
    }
}
