//! Path and file primitives shared by the replicators.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::err::{Error, Result};
use crate::util;

// like vec!() for a PathBuf
#[macro_export]
macro_rules! path {
    ($root:expr, $( $piece:expr ),*) => {
        {
            let mut temp = PathBuf::from($root);
            $(
                temp.push($piece);
            )*
            temp
        }
    }
}

/// Join `dir` and `base` with exactly one `/` between them.
///
/// Unlike [`PathBuf::push`], an absolute `base` does not replace `dir`; its
/// leading slash is dropped instead.
pub fn join<A: AsRef<Path>, B: AsRef<Path>>(dir: A, base: B) -> PathBuf {
    let dir = dir.as_ref().as_os_str().as_bytes();
    let base = base.as_ref().as_os_str().as_bytes();
    let mut out = Vec::with_capacity(dir.len() + base.len() + 1);
    out.extend_from_slice(dir);
    if !out.ends_with(b"/") {
        out.push(b'/');
    }
    out.extend_from_slice(base.strip_prefix(b"/").unwrap_or(base));
    PathBuf::from(std::ffi::OsString::from_vec(out))
}

/// Buffered copy of a single file, preserving owner, mode and times.
pub fn copy_file<A: AsRef<Path>, B: AsRef<Path>>(src: A, dest: B) -> Result<()> {
    let src = src.as_ref();
    let dest = dest.as_ref();
    let s = src
        .symlink_metadata()
        .map_err(|e| Error::file("lstat", src, e))?;

    let mut from = File::open(src).map_err(|e| Error::file("open", src, e))?;
    let mut to = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(s.mode())
        .open(dest)
        .map_err(|e| Error::file("open", dest, e))?;
    io::copy(&mut from, &mut to).map_err(|e| Error::file("copy", dest, e))?;
    drop(to);

    util::lchown(dest, s.uid(), s.gid())?;
    util::chmod(dest, s.mode() & 0o7777)?;
    util::utimes(dest, s.atime(), s.mtime())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp::TempDir;

    #[test]
    fn test_join() {
        assert_eq!(join("/a", "b"), PathBuf::from("/a/b"));
        assert_eq!(join("/a/", "b"), PathBuf::from("/a/b"));
        assert_eq!(join("/a", "/b"), PathBuf::from("/a/b"));
        assert_eq!(join("/", "etc"), PathBuf::from("/etc"));
        assert_eq!(join("/", "/etc"), PathBuf::from("/etc"));
        assert_eq!(join("/var/sandboxes", "/etc/motd"), PathBuf::from("/var/sandboxes/etc/motd"));
    }

    #[test]
    fn test_path_macro() {
        let p = path!("/var", "sandboxes", "x");
        assert_eq!(p, PathBuf::from("/var/sandboxes/x"));
    }

    #[test]
    fn test_copy_file() {
        let tdir = TempDir::new().unwrap();
        let src = tdir.path().join("src.txt");
        let dest = tdir.path().join("dest.txt");
        std::fs::write(&src, b"payload").unwrap();
        util::chmod(&src, 0o640).unwrap();

        copy_file(&src, &dest).unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
        let s1 = src.symlink_metadata().unwrap();
        let s2 = dest.symlink_metadata().unwrap();
        assert_eq!(s1.mode() & 0o7777, s2.mode() & 0o7777);
        assert_ne!(s1.ino(), s2.ino());
    }
}
