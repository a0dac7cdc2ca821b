//! Wrappers for UID and GID syscalls, and the sudo round trip.
//!
//! The command line tools must run as root but are normally invoked by a
//! user: `sudo_reexec` re-runs them under sudo, and `downgrade` returns a
//! payload child to the invoking user's identity using the `SUDO_*`
//! variables sudo leaves behind.

use std::env;
use std::os::unix::process::CommandExt;
use std::process::Command;

use libc;

use crate::err::{Error, Result};
use crate::util::str2cstr;

pub fn getuid() -> libc::uid_t {
    unsafe { libc::getuid() }
}

pub fn geteuid() -> libc::uid_t {
    unsafe { libc::geteuid() }
}

pub fn setuid(id: libc::uid_t) -> Result<()> {
    unsafe {
        if 0 != libc::setuid(id) {
            return Err(Error::last_os_error("setuid"));
        }
    }
    Ok(())
}

pub fn getgid() -> libc::gid_t {
    unsafe { libc::getgid() }
}

pub fn setgid(id: libc::gid_t) -> Result<()> {
    unsafe {
        if 0 != libc::setgid(id) {
            return Err(Error::last_os_error("setgid"));
        }
    }
    Ok(())
}

pub fn initgroups(user: &str, gid: libc::gid_t) -> Result<()> {
    unsafe {
        if 0 != libc::initgroups(str2cstr(user)?.as_ptr(), gid) {
            return Err(Error::last_os_error("initgroups"));
        }
    }
    Ok(())
}

/// Execute the same program through sudo if we're not root.  Only returns
/// when already root or when sudo could not be run.
pub fn sudo_reexec() {
    if getuid() == 0 {
        return;
    }
    let mut args = env::args();
    let argv0 = match args.next() {
        Some(a) => a,
        None => return,
    };
    let err = Command::new("sudo").arg(argv0).args(args).exec();
    eprintln!("exec sudo: {}", err);
}

/// Downgrade privileges to the actual calling user if this program was
/// invoked through sudo(1).  `setgid` and `initgroups` must come before
/// `setuid` forfeits the right to call them.
pub fn downgrade() -> Result<()> {
    let (user, uid, gid) = match (
        env::var("SUDO_USER"),
        env::var("SUDO_UID"),
        env::var("SUDO_GID"),
    ) {
        (Ok(user), Ok(uid), Ok(gid)) => {
            let uid: libc::uid_t = uid.parse().unwrap_or(0);
            let gid: libc::gid_t = gid.parse().unwrap_or(0);
            if user.is_empty() || uid == 0 || gid == 0 {
                return Ok(());
            }
            (user, uid, gid)
        }
        _ => return Ok(()),
    };

    setgid(gid)?;
    initgroups(&user, gid)?;
    setuid(uid)?;
    env::set_var("LOGNAME", &user);
    env::set_var("USER", &user);
    env::set_var("USERNAME", &user);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_consistent() {
        // the real and effective uid agree in a plain test run
        assert_eq!(getuid(), geteuid());
        let _ = getgid();
    }

    #[test]
    fn test_downgrade_without_sudo_is_a_noop() {
        // guard: only meaningful when the harness itself isn't under sudo
        if env::var("SUDO_UID").is_ok() {
            return;
        }
        let uid = getuid();
        downgrade().unwrap();
        assert_eq!(getuid(), uid);
    }
}
