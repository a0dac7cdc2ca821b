//! Tree replication strategies over [`walk`](crate::walk::walk).
//!
//! Shallow copies share inodes with the source through hard links wherever
//! that is safe; deep copies allocate new inodes throughout.  Both treat a
//! foreign device as a boundary: shallow copies rebind it, removal unmounts
//! it.

use std::ffi::OsStr;
use std::fs::Metadata;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::err::{Error, Result};
use crate::fs::{copy_file, join};
use crate::mount::{mount_tree, umount_tree};
use crate::util;
use crate::walk::{walk, Action, Visitor};

/// How many directory levels descend in forked children.
pub const FANOUT: u32 = 3;

/// Recreate `dest` as a directory with `src`'s mode and owner.
fn copy_dir_before(dest: &Path, s: &Metadata) -> Result<()> {
    util::mkdir(dest, s.mode() & 0o7777)?;
    util::lchown(dest, s.uid(), s.gid())?;
    util::chmod(dest, s.mode() & 0o7777)?;
    Ok(())
}

/// Restore `dest`'s times once its entries are in place.
fn copy_dir_after(dest: &Path, s: &Metadata) -> Result<()> {
    match util::utimes(dest, s.atime(), s.mtime()) {
        Err(Error::File { ref io, .. }) if io.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

struct ShallowCopy;

impl Visitor for ShallowCopy {
    /// A foreign device is represented by an empty placeholder directory
    /// which the device is then bind-mounted over.
    fn device(&self, src: &Path, dest: &Path, dev: u64, s: &Metadata) -> Result<Action> {
        if dev == s.dev() {
            return Ok(Action::Descend);
        }
        if let Err(err) = copy_dir_before(dest, s)
            .and_then(|_| copy_dir_after(dest, s))
            .and_then(|_| mount_tree(src, dest, s.dev()))
        {
            warn!("rebinding {}: {}", src.display(), err);
        }
        Ok(Action::Prune)
    }

    fn before(&self, _src: &Path, dest: &Path, s: &Metadata) -> Result<()> {
        copy_dir_before(dest, s)
    }

    /// Hard link symbolic links so they remain symbolic links.
    fn symlink(
        &self,
        _src: &Path,
        dest: &Path,
        name: &OsStr,
        path: &Path,
        _s: &Metadata,
    ) -> Result<()> {
        util::link(path, join(dest, name))
    }

    /// Hard link normal files unless they carry set-uid, set-gid or sticky
    /// bits, or are of a kind hard links cannot represent safely.
    ///
    /// The mode exclusions respond to dpkg's upgrade procedure: before
    /// unlinking the old version of a privileged file it narrows the old
    /// inode's mode to 0600 and swaps a fresh inode into place.  A hard link
    /// would carry that downgrade (or worse, a still-privileged stale
    /// binary) into every other sandbox, so such files get their own inode.
    /// See chmodsafe_unlink_statted in src/help.c in the dpkg source.
    fn file(
        &self,
        _src: &Path,
        dest: &Path,
        name: &OsStr,
        path: &Path,
        s: &Metadata,
    ) -> Result<()> {
        let kind = s.file_type();
        let linkable = kind.is_file()
            || kind.is_fifo()
            || kind.is_socket()
            || kind.is_block_device()
            || kind.is_char_device();
        if s.mode() & 0o7000 != 0 || !linkable {
            return copy_file(path, join(dest, name));
        }

        // Don't shallow copy `ssh-agent`(1) sockets.
        if kind.is_socket()
            && path.as_os_str().as_bytes().starts_with(b"/tmp/ssh-")
            && name.as_bytes().starts_with(b"agent.")
        {
            let _ = std::fs::remove_dir(dest);
            return Ok(());
        }

        util::link(path, join(dest, name))
    }

    fn after(&self, _src: &Path, dest: &Path, s: &Metadata) -> Result<()> {
        copy_dir_after(dest, s)
    }
}

/// Shallow copy a directory tree, rebinding foreign devices.  Excluded
/// directories are not copied.
pub fn shallow_copy<A: AsRef<Path>, B: AsRef<Path>>(
    src: A,
    dest: B,
    dev: u64,
    exclude: &[PathBuf],
) -> Result<()> {
    debug!(
        "shallow copying {} to {}",
        src.as_ref().display(),
        dest.as_ref().display()
    );
    walk(src.as_ref(), dest.as_ref(), exclude, dev, &ShallowCopy, FANOUT)
}

struct DeepCopy;

impl Visitor for DeepCopy {
    fn before(&self, _src: &Path, dest: &Path, s: &Metadata) -> Result<()> {
        copy_dir_before(dest, s)
    }

    /// Create new symbolic links that look just like the old ones.
    fn symlink(
        &self,
        _src: &Path,
        dest: &Path,
        name: &OsStr,
        path: &Path,
        s: &Metadata,
    ) -> Result<()> {
        let target = std::fs::read_link(path).map_err(|e| Error::file("readlink", path, e))?;
        let link = join(dest, name);
        std::os::unix::fs::symlink(&target, &link)
            .map_err(|e| Error::file("symlink", &link, e))?;
        util::lchown(&link, s.uid(), s.gid())
    }

    fn file(
        &self,
        _src: &Path,
        dest: &Path,
        name: &OsStr,
        path: &Path,
        _s: &Metadata,
    ) -> Result<()> {
        copy_file(path, join(dest, name))
    }

    fn after(&self, _src: &Path, dest: &Path, s: &Metadata) -> Result<()> {
        copy_dir_after(dest, s)
    }
}

/// Deep copy a directory tree.  Excluded directories are not copied.
pub fn deep_copy<A: AsRef<Path>, B: AsRef<Path>>(src: A, dest: B, exclude: &[PathBuf]) -> Result<()> {
    debug!(
        "deep copying {} to {}",
        src.as_ref().display(),
        dest.as_ref().display()
    );
    walk(src.as_ref(), dest.as_ref(), exclude, 0, &DeepCopy, FANOUT)
}

struct Remount;

impl Visitor for Remount {
    /// A device mounted in the source but absent at the destination gets
    /// rebound.  This only has real work to do the first time a sandbox is
    /// used after a reboot.
    fn device(&self, src: &Path, dest: &Path, dev: u64, s: &Metadata) -> Result<Action> {
        if dev == s.dev() {
            return Ok(Action::Descend);
        }
        let s2 = dest
            .symlink_metadata()
            .map_err(|e| Error::file("lstat", dest, e))?;
        if s.dev() != s2.dev() {
            debug!("mounting {}", dest.display());
            if let Err(err) = mount_tree(src, dest, s.dev()) {
                warn!("rebinding {}: {}", dest.display(), err);
            }
        }
        Ok(Action::Prune)
    }
}

/// Rebind every device mounted under `src` at the same spot under `dest`.
pub fn remount<A: AsRef<Path>, B: AsRef<Path>>(
    src: A,
    dest: B,
    dev: u64,
    exclude: &[PathBuf],
) -> Result<()> {
    walk(src.as_ref(), dest.as_ref(), exclude, dev, &Remount, FANOUT)
}

struct Unlink;

impl Visitor for Unlink {
    fn device(&self, src: &Path, _dest: &Path, dev: u64, s: &Metadata) -> Result<Action> {
        if dev == s.dev() {
            return Ok(Action::Descend);
        }
        umount_tree(src, s.dev())?;
        util::rmdir(src)?;
        Ok(Action::Prune)
    }

    fn symlink(
        &self,
        _src: &Path,
        _dest: &Path,
        _name: &OsStr,
        path: &Path,
        _s: &Metadata,
    ) -> Result<()> {
        util::unlink(path)
    }

    fn file(
        &self,
        _src: &Path,
        _dest: &Path,
        _name: &OsStr,
        path: &Path,
        _s: &Metadata,
    ) -> Result<()> {
        util::unlink(path)
    }

    fn after(&self, src: &Path, _dest: &Path, _s: &Metadata) -> Result<()> {
        util::rmdir(src)
    }
}

/// `rm -rf` for a sandbox tree: lazily unmounts any foreign device on the
/// way down, then unlinks everything else.
pub fn remove_tree<P: AsRef<Path>>(dir: P, dev: u64) -> Result<()> {
    debug!("unlinking {}", dir.as_ref().display());
    walk(dir.as_ref(), dir.as_ref(), &[], dev, &Unlink, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp::TempDir;
    use std::os::unix::fs::symlink;
    use std::os::unix::net::UnixListener;

    fn fixture() -> TempDir {
        let tdir = TempDir::new().unwrap();
        let root = tdir.path();
        std::fs::create_dir(root.join("src")).unwrap();
        std::fs::write(root.join("src").join("shared"), b"shared").unwrap();
        symlink("shared", root.join("src").join("alias")).unwrap();
        std::fs::create_dir(root.join("src").join("sub")).unwrap();
        std::fs::write(root.join("src").join("sub").join("nested"), b"nested").unwrap();
        tdir
    }

    #[test]
    fn test_deep_copy_new_inodes() {
        let tdir = fixture();
        let src = tdir.path().join("src");
        let dest = tdir.path().join("dest");
        walk(&src, &dest, &[], 0, &DeepCopy, 0).unwrap();

        assert_eq!(std::fs::read(dest.join("shared")).unwrap(), b"shared");
        assert_eq!(std::fs::read(dest.join("sub").join("nested")).unwrap(), b"nested");
        assert_eq!(
            std::fs::read_link(dest.join("alias")).unwrap(),
            PathBuf::from("shared")
        );
        let s1 = src.join("shared").symlink_metadata().unwrap();
        let s2 = dest.join("shared").symlink_metadata().unwrap();
        assert_ne!(s1.ino(), s2.ino());
    }

    #[test]
    fn test_shallow_copy_shares_inodes() {
        let tdir = fixture();
        let src = tdir.path().join("src");
        let dest = tdir.path().join("dest");
        walk(&src, &dest, &[], src.symlink_metadata().unwrap().dev(), &ShallowCopy, 0).unwrap();

        let s1 = src.join("shared").symlink_metadata().unwrap();
        let s2 = dest.join("shared").symlink_metadata().unwrap();
        assert_eq!(s1.ino(), s2.ino());
        // the symlink itself was hard linked, not its target
        let l2 = dest.join("alias").symlink_metadata().unwrap();
        assert!(l2.file_type().is_symlink());
    }

    #[test]
    fn test_shallow_copy_privileged_files_get_own_inode() {
        let tdir = fixture();
        let src = tdir.path().join("src");
        let dest = tdir.path().join("dest");
        let sgid = src.join("sgid");
        std::fs::write(&sgid, b"sgid").unwrap();
        util::chmod(&sgid, 0o2755).unwrap();

        walk(&src, &dest, &[], src.symlink_metadata().unwrap().dev(), &ShallowCopy, 0).unwrap();

        let s1 = sgid.symlink_metadata().unwrap();
        let s2 = dest.join("sgid").symlink_metadata().unwrap();
        assert_ne!(s1.ino(), s2.ino());
        assert_eq!(std::fs::read(dest.join("sgid")).unwrap(), b"sgid");
    }

    #[test]
    fn test_shallow_copy_skips_agent_sockets() {
        // the skip matches on the literal /tmp/ssh- prefix
        let agents = TempDir::with_prefix("ssh-").unwrap();
        if !agents.path().starts_with("/tmp") {
            return; // $TMPDIR moved us; the convention cannot match
        }
        UnixListener::bind(agents.path().join("agent.1")).unwrap();

        let out = TempDir::new().unwrap();
        let dest = out.path().join("copy");
        walk(
            agents.path(),
            &dest,
            &[],
            agents.path().symlink_metadata().unwrap().dev(),
            &ShallowCopy,
            0,
        )
        .unwrap();

        // the placeholder directory was removed along with the socket
        assert!(!dest.exists());
    }

    #[test]
    fn test_remove_tree() {
        let tdir = fixture();
        let src = tdir.path().join("src");
        let dev = src.symlink_metadata().unwrap().dev();
        remove_tree(&src, dev).unwrap();
        assert!(!src.exists());
    }

    #[test]
    fn test_deep_copy_excludes() {
        let tdir = fixture();
        let src = tdir.path().join("src");
        let dest = tdir.path().join("dest");
        let exclude = vec![src.join("sub")];
        walk(&src, &dest, &exclude, 0, &DeepCopy, 0).unwrap();
        assert!(dest.join("shared").is_file());
        assert!(!dest.join("sub").exists());
    }
}
