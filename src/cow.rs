//! Lazy promotion of a shared file to a private copy.
//!
//! Sandboxes share unmodified files with the host by hard link.  The first
//! mutation of such a file must allocate a private inode for this sandbox
//! while every other holder of the old inode keeps seeing the original
//! bytes.

use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use log::debug;

use crate::err::{Error, Result};
use crate::temp;
use crate::util;

/// Replace `path` with a freshly-copied inode carrying the same bytes,
/// owner, mode and times.  Skips paths that do not exist, are directories,
/// or are already private (link count 1).  Returns whether a copy was made.
pub fn promote<P: AsRef<Path>>(path: P) -> Result<bool> {
    let path = path.as_ref();

    let s = match path.symlink_metadata() {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::file("lstat", path, e)),
    };
    if s.nlink() == 1 || s.file_type().is_dir() {
        return Ok(false);
    }
    debug!("promoting {}", path.display());

    // Copy into a temporary sibling, then rename it over the original.  The
    // rename is what breaks the hard link; other sandboxes keep their inode.
    let mut template = path.as_os_str().to_os_string();
    template.push("-XXXXXX");
    let (mut tmp, tmpname) = temp::mkstemp(&template)?;

    let result = File::open(path)
        .map_err(|e| Error::file("open", path, e))
        .and_then(|mut from| {
            io::copy(&mut from, &mut tmp).map_err(|e| Error::file("copy", &tmpname, e))
        })
        .and_then(|_| {
            std::fs::rename(&tmpname, path).map_err(|e| Error::file("rename", &tmpname, e))
        });
    if let Err(err) = result {
        let _ = std::fs::remove_file(&tmpname);
        return Err(err);
    }
    drop(tmp);

    util::lchown(path, s.uid(), s.gid())?;
    util::chmod(path, s.mode() & 0o7777)?;
    util::utimes(path, s.atime(), s.mtime())?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp::TempDir;

    #[test]
    fn test_promote_breaks_hard_link() {
        let tdir = TempDir::new().unwrap();
        let shared = tdir.path().join("shared");
        let other = tdir.path().join("other");
        std::fs::write(&shared, b"original").unwrap();
        util::chmod(&shared, 0o640).unwrap();
        std::fs::hard_link(&shared, &other).unwrap();
        let before = shared.symlink_metadata().unwrap();

        assert!(promote(&shared).unwrap());

        let after = shared.symlink_metadata().unwrap();
        assert_ne!(before.ino(), after.ino());
        assert_eq!(after.nlink(), 1);
        assert_eq!(after.mode() & 0o7777, 0o640);
        assert_eq!(std::fs::read(&shared).unwrap(), b"original");
        // the other holder kept the old inode untouched
        let others = other.symlink_metadata().unwrap();
        assert_eq!(others.ino(), before.ino());
        assert_eq!(std::fs::read(&other).unwrap(), b"original");
    }

    #[test]
    fn test_promote_skips_private_files() {
        let tdir = TempDir::new().unwrap();
        let private = tdir.path().join("private");
        std::fs::write(&private, b"x").unwrap();
        let before = private.symlink_metadata().unwrap();

        assert!(!promote(&private).unwrap());
        assert_eq!(private.symlink_metadata().unwrap().ino(), before.ino());
    }

    #[test]
    fn test_promote_skips_directories_and_missing() {
        let tdir = TempDir::new().unwrap();
        assert!(!promote(tdir.path()).unwrap());
        assert!(!promote(tdir.path().join("missing")).unwrap());
    }

    #[test]
    fn test_promote_leaves_no_temp_files() {
        let tdir = TempDir::new().unwrap();
        let shared = tdir.path().join("f");
        let other = tdir.path().join("g");
        std::fs::write(&shared, b"x").unwrap();
        std::fs::hard_link(&shared, &other).unwrap();
        promote(&shared).unwrap();

        let stray: Vec<_> = std::fs::read_dir(tdir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|n| n.to_string_lossy().contains("-"))
            .collect();
        assert!(stray.is_empty(), "{:?}", stray);
    }
}
