//! Recursive directory traversal with per-node hooks.
//!
//! The replication, mount and teardown strategies are all expressed as
//! [`Visitor`] implementations over a single [`walk`].  Hooks default to
//! no-ops so a strategy only writes the callbacks it cares about.

use std::ffi::OsStr;
use std::fs::Metadata;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::err::{Error, Result};
use crate::fs::join;
use crate::proc::{self, Fork};

/// What the device hook decided about a node.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// Keep walking into this subtree.
    Descend,
    /// The hook consumed this subtree; do not descend.
    Prune,
}

#[allow(unused_variables)]
pub trait Visitor {
    /// Called on every directory with the device number the walk started
    /// from, before anything else happens to it.
    fn device(&self, src: &Path, dest: &Path, dev: u64, s: &Metadata) -> Result<Action> {
        Ok(Action::Descend)
    }

    /// Called on a directory before its entries are visited.
    fn before(&self, src: &Path, dest: &Path, s: &Metadata) -> Result<()> {
        Ok(())
    }

    /// Called on each symbolic link entry.
    fn symlink(&self, src: &Path, dest: &Path, name: &OsStr, path: &Path, s: &Metadata) -> Result<()> {
        Ok(())
    }

    /// Called on each non-directory, non-symlink entry.
    fn file(&self, src: &Path, dest: &Path, name: &OsStr, path: &Path, s: &Metadata) -> Result<()> {
        Ok(())
    }

    /// Called on a directory after all entries (and forked children) have
    /// been handled.  Runs even when an entry failed.
    fn after(&self, src: &Path, dest: &Path, s: &Metadata) -> Result<()> {
        Ok(())
    }
}

/// Walk `src` (mirrored at `dest`) recursively.
///
/// Skips `src` when it is the destination being written (the concatenation
/// test below) or listed in `exclude` verbatim.  When `forks` is positive
/// each subdirectory is processed in a forked child, and `forks` shrinks by
/// one per level; children confine their effects to disjoint subtrees, so no
/// state needs to be shared back.
pub fn walk(
    src: &Path,
    dest: &Path,
    exclude: &[PathBuf],
    dev: u64,
    visitor: &dyn Visitor,
    forks: u32,
) -> Result<()> {
    // Walking src into a dest underneath itself would recurse forever; that
    // case always shows up as dest == src twice concatenated.
    let bytes = src.as_os_str().as_bytes();
    let mut twice = Vec::with_capacity(2 * bytes.len());
    twice.extend_from_slice(bytes);
    twice.extend_from_slice(bytes);
    if twice == dest.as_os_str().as_bytes() {
        return Ok(());
    }
    if exclude.iter().any(|e| e.as_path() == src) {
        return Ok(());
    }

    let s = src
        .symlink_metadata()
        .map_err(|e| Error::file("lstat", src, e))?;

    match visitor.device(src, dest, dev, &s)? {
        Action::Prune => return Ok(()),
        Action::Descend => (),
    }

    let mut children = 0;
    let result = walk_entries(src, dest, exclude, dev, visitor, forks, &s, &mut children);

    for _ in 0..children {
        if let Err(err) = proc::wait_any() {
            warn!("reaping walk child: {}", err);
        }
    }

    match visitor.after(src, dest, &s) {
        Err(err) if result.is_ok() => Err(err),
        _ => result,
    }
}

#[allow(clippy::too_many_arguments)]
fn walk_entries(
    src: &Path,
    dest: &Path,
    exclude: &[PathBuf],
    dev: u64,
    visitor: &dyn Visitor,
    forks: u32,
    s: &Metadata,
    children: &mut u32,
) -> Result<()> {
    visitor.before(src, dest, s)?;

    let entries = std::fs::read_dir(src).map_err(|e| Error::file("opendir", src, e))?;
    let mut result = Ok(());
    for entry in entries {
        let entry = entry.map_err(|e| Error::file("readdir", src, e))?;
        let name = entry.file_name();
        let pathname = join(src, &name);
        let s2 = pathname
            .symlink_metadata()
            .map_err(|e| Error::file("lstat", &pathname, e))?;

        if s2.file_type().is_symlink() {
            visitor.symlink(src, dest, &name, &pathname, &s2)?;
        } else if s2.file_type().is_dir() {
            let dest2 = join(dest, &name);
            if forks > 0 {
                match proc::fork()? {
                    Fork::Parent(child) => {
                        // reaped in bulk by the caller
                        std::mem::forget(child);
                        *children += 1;
                    }
                    Fork::Child => {
                        if let Err(err) =
                            walk(&pathname, &dest2, exclude, dev, visitor, forks - 1)
                        {
                            warn!("walking {}: {}", pathname.display(), err);
                        }
                        std::process::exit(0);
                    }
                }
            } else {
                debug!("walking {}", pathname.display());
                match walk(&pathname, &dest2, exclude, dev, visitor, 0) {
                    Ok(()) => (),
                    Err(err) => {
                        warn!("walking {}: {}", pathname.display(), err);
                        if result.is_ok() {
                            result = Err(err);
                        }
                    }
                }
            }
        } else {
            visitor.file(src, dest, &name, &pathname, &s2)?;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp::TempDir;
    use std::cell::RefCell;
    use std::os::unix::fs::symlink;

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, kind: &str, path: &Path) {
            let base = path.file_name().unwrap_or_default().to_string_lossy();
            self.events.borrow_mut().push(format!("{}:{}", kind, base));
        }
    }

    impl Visitor for Recorder {
        fn before(&self, src: &Path, _dest: &Path, _s: &Metadata) -> Result<()> {
            self.push("before", src);
            Ok(())
        }
        fn symlink(
            &self,
            _src: &Path,
            _dest: &Path,
            _name: &OsStr,
            path: &Path,
            _s: &Metadata,
        ) -> Result<()> {
            self.push("symlink", path);
            Ok(())
        }
        fn file(
            &self,
            _src: &Path,
            _dest: &Path,
            _name: &OsStr,
            path: &Path,
            _s: &Metadata,
        ) -> Result<()> {
            self.push("file", path);
            Ok(())
        }
        fn after(&self, src: &Path, _dest: &Path, _s: &Metadata) -> Result<()> {
            self.push("after", src);
            Ok(())
        }
    }

    fn fixture() -> TempDir {
        let tdir = TempDir::new().unwrap();
        let root = tdir.path();
        std::fs::write(root.join("file"), b"1").unwrap();
        symlink("file", root.join("sym")).unwrap();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("sub").join("nested"), b"2").unwrap();
        tdir
    }

    #[test]
    fn test_dispatch_and_order() {
        let tdir = fixture();
        let rec = Recorder::default();
        let dest = PathBuf::from("/nonexistent-dest");
        walk(tdir.path(), &dest, &[], 0, &rec, 0).unwrap();
        let events = rec.events.borrow();

        let top = tdir.path().file_name().unwrap().to_string_lossy();
        assert_eq!(events.first().unwrap(), &format!("before:{}", top));
        assert_eq!(events.last().unwrap(), &format!("after:{}", top));
        assert!(events.contains(&"file:file".to_string()));
        assert!(events.contains(&"symlink:sym".to_string()));
        assert!(events.contains(&"file:nested".to_string()));
        // parent before precedes child's; child's after precedes parent's
        let b_sub = events.iter().position(|e| e == "before:sub").unwrap();
        let a_sub = events.iter().position(|e| e == "after:sub").unwrap();
        assert!(b_sub > 0 && a_sub > b_sub && a_sub < events.len() - 1);
    }

    #[test]
    fn test_exclude() {
        let tdir = fixture();
        let rec = Recorder::default();
        let dest = PathBuf::from("/nonexistent-dest");
        let exclude = vec![join(tdir.path(), "sub")];
        walk(tdir.path(), &dest, &exclude, 0, &rec, 0).unwrap();
        let events = rec.events.borrow();
        assert!(!events.iter().any(|e| e.contains("nested")));
        assert!(!events.iter().any(|e| e == "before:sub"));
    }

    #[test]
    fn test_self_destination_skipped() {
        let tdir = fixture();
        let rec = Recorder::default();
        // dest equal to src concatenated with itself marks "descending into
        // the copy being written"
        let mut doubled = tdir.path().as_os_str().to_os_string();
        doubled.push(tdir.path().as_os_str());
        walk(tdir.path(), Path::new(&doubled), &[], 0, &rec, 0).unwrap();
        assert!(rec.events.borrow().is_empty());
    }

    struct Pruner {
        inner: Recorder,
    }

    impl Visitor for Pruner {
        fn device(&self, src: &Path, _dest: &Path, _dev: u64, _s: &Metadata) -> Result<Action> {
            if src.file_name() == Some(OsStr::new("sub")) {
                return Ok(Action::Prune);
            }
            Ok(Action::Descend)
        }
        fn before(&self, src: &Path, dest: &Path, s: &Metadata) -> Result<()> {
            self.inner.before(src, dest, s)
        }
        fn file(&self, src: &Path, dest: &Path, name: &OsStr, path: &Path, s: &Metadata) -> Result<()> {
            self.inner.file(src, dest, name, path, s)
        }
    }

    #[test]
    fn test_prune() {
        let tdir = fixture();
        let rec = Pruner {
            inner: Recorder::default(),
        };
        let dest = PathBuf::from("/nonexistent-dest");
        walk(tdir.path(), &dest, &[], 0, &rec, 0).unwrap();
        let events = rec.inner.events.borrow();
        assert!(!events.iter().any(|e| e.contains("nested")));
        assert!(events.contains(&"file:file".to_string()));
    }
}
