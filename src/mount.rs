//! Recursive bind mounting and lazy unmounting across device boundaries.
//!
//! Equivalent to `mount --rbind` and `umount -l`, except that only one level
//! of child devices is followed.  `/proc` contents change underneath a
//! traversal, so subtrees ending there are never walked.

use std::fs::Metadata;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use log::debug;

use crate::err::Result;
use crate::util;
use crate::walk::{walk, Action, Visitor};

pub(crate) fn ends_with_proc(path: &Path) -> bool {
    path.as_os_str().as_bytes().ends_with(b"/proc")
}

struct Mount;

impl Visitor for Mount {
    fn device(&self, src: &Path, dest: &Path, dev: u64, s: &Metadata) -> Result<Action> {
        if dev == s.dev() {
            return Ok(Action::Descend);
        }
        debug!("recursively mounting {}", src.display());
        util::bind_mount(src, dest)?;
        Ok(Action::Prune)
    }
}

/// Bind-mount `src` at `dest`, then rebind any directly nested foreign
/// devices.  `dev` is the device `src` itself lives on.
pub fn mount_tree<A: AsRef<Path>, B: AsRef<Path>>(src: A, dest: B, dev: u64) -> Result<()> {
    let src = src.as_ref();
    let dest = dest.as_ref();
    debug!("mounting {}", src.display());
    util::bind_mount(src, dest)?;
    if ends_with_proc(src) {
        return Ok(());
    }
    walk(src, dest, &[], dev, &Mount, 0)
}

struct Umount;

impl Visitor for Umount {
    fn device(&self, src: &Path, _dest: &Path, dev: u64, s: &Metadata) -> Result<Action> {
        if dev == s.dev() {
            return Ok(Action::Descend);
        }
        debug!("recursively unmounting {}", src.display());
        util::umount_lazy(src)?;
        Ok(Action::Prune)
    }
}

/// Lazily unmount `dir`.  Subtrees ending in `/proc` first have their
/// foreign-device children detached one by one.
pub fn umount_tree<P: AsRef<Path>>(dir: P, dev: u64) -> Result<()> {
    let dir = dir.as_ref();
    debug!("unmounting {}", dir.display());
    if ends_with_proc(dir) {
        walk(dir, dir, &[], dev, &Umount, 0)?;
    }
    util::umount_lazy(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ends_with_proc() {
        assert!(ends_with_proc(Path::new("/proc")));
        assert!(ends_with_proc(Path::new("/var/sandboxes/x/proc")));
        assert!(!ends_with_proc(Path::new("/var/sandboxes/x/process")));
        assert!(!ends_with_proc(Path::new("/proc/sys")));
    }
}
