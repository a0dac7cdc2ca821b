//! Thin wrappers around the syscalls the sandbox engine leans on.
//!
//! Each wrapper logs its arguments at debug level and annotates failures with
//! the operation name, the way the rest of the crate expects to report them.

use std::ffi::CString;
use std::fs;
use std::io::Write;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use libc;

use log::debug;

use crate::err::{Error, Result};

/// Allocate a `CString` from the given string.
pub(crate) fn str2cstr<S: AsRef<str>>(s: S) -> Result<CString> {
    let ret = CString::new(s.as_ref())?;
    Ok(ret)
}

/// Allocate a `CString` from the given path.
pub(crate) fn path2cstr<P: AsRef<Path>>(path: P) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    let ret = CString::new(path.as_ref().as_os_str().as_bytes())?;
    Ok(ret)
}

/// Create a file, and write the provided bytes
pub fn write_file<P: AsRef<Path>, S: AsRef<[u8]>>(name: P, buf: S) -> Result<()> {
    debug!("write_file({:?}, ...)", name.as_ref().display());
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(name.as_ref())
        .map_err(|e| Error::file("open", name.as_ref(), e))?
        .write_all(buf.as_ref())
        .map_err(|e| Error::file("write", name.as_ref(), e))
}

/// Wraps `mkdir()` with an explicit mode.  Only attempts to create the leaf.
pub fn mkdir<S: AsRef<Path>>(name: S, mode: u32) -> Result<PathBuf> {
    debug!("mkdir({:?}, {:#o})", name.as_ref().display(), mode);
    if unsafe { libc::mkdir(path2cstr(&name)?.as_ptr(), mode as libc::mode_t) } == 0 {
        Ok(name.as_ref().to_path_buf())
    } else {
        Err(Error::last_file_error("mkdir", name))
    }
}

/// Wraps `rmdir ...`
pub fn rmdir<S: AsRef<Path>>(name: S) -> Result<()> {
    debug!("rmdir({:?})", name.as_ref().display());
    fs::remove_dir(name.as_ref()).map_err(|e| Error::file("rmdir", name.as_ref(), e))
}

/// Wraps `unlink()`
pub fn unlink<S: AsRef<Path>>(name: S) -> Result<()> {
    debug!("unlink({:?})", name.as_ref().display());
    fs::remove_file(name.as_ref()).map_err(|e| Error::file("unlink", name.as_ref(), e))
}

/// Wraps `lchown()`.  Applies to the link itself, never the target.
pub fn lchown<S: AsRef<Path>>(path: S, uid: libc::uid_t, gid: libc::gid_t) -> Result<()> {
    debug!("lchown({:?}, {}, {})", path.as_ref().display(), uid, gid);
    if unsafe { libc::lchown(path2cstr(&path)?.as_ptr(), uid, gid) } == 0 {
        Ok(())
    } else {
        Err(Error::last_file_error("lchown", path))
    }
}

/// Wraps `chmod()`
pub fn chmod<S: AsRef<Path>>(path: S, mode: u32) -> Result<()> {
    debug!("chmod({:?}, {:#o})", path.as_ref().display(), mode);
    if unsafe { libc::chmod(path2cstr(&path)?.as_ptr(), mode as libc::mode_t) } == 0 {
        Ok(())
    } else {
        Err(Error::last_file_error("chmod", path))
    }
}

/// Wraps `link()`
pub fn link<A: AsRef<Path>, B: AsRef<Path>>(old: A, new: B) -> Result<()> {
    debug!(
        "link({:?}, {:?})",
        old.as_ref().display(),
        new.as_ref().display()
    );
    fs::hard_link(old.as_ref(), new.as_ref()).map_err(|e| Error::file("link", new.as_ref(), e))
}

/// Wraps `utimes()` with second resolution, which is all the replicators
/// preserve.
pub fn utimes<S: AsRef<Path>>(path: S, atime: i64, mtime: i64) -> Result<()> {
    debug!(
        "utimes({:?}, {}, {})",
        path.as_ref().display(),
        atime,
        mtime
    );
    let times = [
        libc::timeval {
            tv_sec: atime as libc::time_t,
            tv_usec: 0,
        },
        libc::timeval {
            tv_sec: mtime as libc::time_t,
            tv_usec: 0,
        },
    ];
    if unsafe { libc::utimes(path2cstr(&path)?.as_ptr(), times.as_ptr()) } == 0 {
        Ok(())
    } else {
        Err(Error::last_file_error("utimes", path))
    }
}

/// Wraps `mount(MS_BIND)`
pub fn bind_mount<A: AsRef<Path>, B: AsRef<Path>>(src: A, target: B) -> Result<()> {
    debug!(
        "mount({:?}, {:?}, MS_BIND)",
        src.as_ref().display(),
        target.as_ref().display()
    );
    if 0 != unsafe {
        libc::mount(
            path2cstr(&src)?.as_ptr(),
            path2cstr(&target)?.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND,
            std::ptr::null(),
        )
    } {
        Err(Error::last_os_error(format!(
            "mount src={:?} target={:?} flags=MS_BIND",
            src.as_ref(),
            target.as_ref()
        )))?;
    }
    Ok(())
}

/// Wraps `umount2(..., MNT_DETACH)` to remove a mount from the current namespace,
/// but not necessarily from others.
pub fn umount_lazy<P: AsRef<Path>>(path: P) -> Result<()> {
    debug!("umount({:?})", path.as_ref().display());
    let ret = unsafe { libc::umount2(path2cstr(&path)?.as_ptr(), libc::MNT_DETACH) };
    if ret == 0 {
        Ok(())
    } else {
        Err(Error::last_file_error("umount2", path))
    }
}

/// Wraps `chroot()`
pub fn chroot<P: AsRef<Path>>(path: P) -> Result<()> {
    debug!("chroot({:?})", path.as_ref().display());
    if unsafe { libc::chroot(path2cstr(&path)?.as_ptr()) } == 0 {
        Ok(())
    } else {
        Err(Error::last_file_error("chroot", path))
    }
}

/// Wraps `chdir()`
pub fn chdir<P: AsRef<Path>>(path: P) -> Result<()> {
    debug!("chdir({:?})", path.as_ref().display());
    std::env::set_current_dir(path.as_ref()).map_err(|e| Error::file("chdir", path.as_ref(), e))
}

/// Wraps `getcwd()`
pub fn getcwd() -> Result<PathBuf> {
    std::env::current_dir().map_err(|e| Error::os("getcwd", e))
}

/// Wraps the `getcwd` syscall directly.
///
/// While escaping a chroot the working directory lies outside the current
/// root; the kernel then prefixes the result with `(unreachable)` and glibc
/// turns that into ENOENT.  The raw syscall hands the path back, and the
/// prefix is stripped here.
pub fn getcwd_raw() -> Result<PathBuf> {
    use std::os::unix::ffi::OsStringExt;

    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let ret = unsafe { libc::syscall(libc::SYS_getcwd, buf.as_mut_ptr(), buf.len()) };
    if ret < 0 {
        return Err(Error::last_os_error("getcwd"));
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    buf.truncate(len);
    const UNREACHABLE: &[u8] = b"(unreachable)";
    if buf.starts_with(UNREACHABLE) {
        buf.drain(..UNREACHABLE.len());
    }
    Ok(PathBuf::from(std::ffi::OsString::from_vec(buf)))
}

/// Wraps `open()` with raw flags, returning an owned `File`.
pub fn open<P: AsRef<Path>>(path: P, flags: libc::c_int, mode: u32) -> Result<fs::File> {
    debug!(
        "open({:?}, {:#x}, {:#o})",
        path.as_ref().display(),
        flags,
        mode
    );
    let fd = unsafe {
        libc::open(
            path2cstr(&path)?.as_ptr(),
            flags,
            mode as libc::mode_t as libc::c_uint,
        )
    };
    if fd < 0 {
        Err(Error::last_file_error("open", path))
    } else {
        Ok(unsafe { fs::File::from_raw_fd(fd as RawFd) })
    }
}

/// Wraps `access()`
pub fn access<P: AsRef<Path>>(path: P, mode: libc::c_int) -> Result<()> {
    if unsafe { libc::access(path2cstr(&path)?.as_ptr(), mode) } == 0 {
        Ok(())
    } else {
        Err(Error::last_file_error("access", path))
    }
}

/// Wraps `mknod()`
pub fn mknod<P: AsRef<Path>>(path: P, mode: u32, dev: u64) -> Result<()> {
    debug!("mknod({:?}, {:#o}, {})", path.as_ref().display(), mode, dev);
    if unsafe {
        libc::mknod(
            path2cstr(&path)?.as_ptr(),
            mode as libc::mode_t,
            dev as libc::dev_t,
        )
    } == 0
    {
        Ok(())
    } else {
        Err(Error::last_file_error("mknod", path))
    }
}

/// Switch the filesystem uid used for permission checks.  `setfsuid()`
/// cannot fail usefully; it returns the previous value.
pub fn setfsuid(uid: libc::uid_t) -> libc::uid_t {
    unsafe { libc::setfsuid(uid) as libc::uid_t }
}

/// Switch the filesystem gid used for permission checks.
pub fn setfsgid(gid: libc::gid_t) -> libc::gid_t {
    unsafe { libc::setfsgid(gid) as libc::gid_t }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp::TempDir;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn test_cstr() {
        let cstr = path2cstr("/some/path").unwrap();
        assert_eq!(cstr.to_str().unwrap(), "/some/path");
    }

    #[test]
    fn test_mkdir_mode() {
        let tdir = TempDir::new().unwrap();
        let dir = tdir.path().join("d");
        mkdir(&dir, 0o750).unwrap();
        assert!(dir.is_dir());
        // umask may clear bits, never add them
        assert_eq!(dir.metadata().unwrap().mode() & 0o7777 & !0o750, 0);
        rmdir(&dir).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_write_file_and_utimes() {
        let tdir = TempDir::new().unwrap();
        let f = tdir.path().join("f");
        write_file(&f, b"x").unwrap();
        utimes(&f, 1_000_000, 2_000_000).unwrap();
        let s = f.metadata().unwrap();
        assert_eq!(s.atime(), 1_000_000);
        assert_eq!(s.mtime(), 2_000_000);
    }

    #[test]
    fn test_open_raw() {
        let tdir = TempDir::new().unwrap();
        let f = tdir.path().join("f");
        let file = open(&f, libc::O_WRONLY | libc::O_CREAT, 0o644).unwrap();
        drop(file);
        assert!(f.is_file());
    }
}
