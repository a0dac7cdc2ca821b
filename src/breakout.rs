//! Escaping a chroot.
//!
//! Every lifecycle operation starts by returning the process to the real
//! root, wherever it was invoked.  The escape works by creating a chroot the
//! process is *not* in and ascending out of it, which Linux permits; it is
//! also why a sandbox must never be mistaken for a security boundary.

use std::path::{Path, PathBuf};

use log::debug;

use crate::err::Result;
use crate::fs::join;
use crate::temp;
use crate::util;

/// The sandbox name encoded in a root directory path: the final component,
/// or `/` for the real root.
pub(crate) fn name_from_root(root: &Path) -> String {
    if root == Path::new("/") {
        return "/".to_string();
    }
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string())
}

/// Break the current process and all its future children out of whatever
/// chroot they are in.  Returns the name of the sandbox this process was
/// inside, or `/` if it was not sandboxed.
pub fn breakout() -> Result<String> {
    // Create a temporary directory, change to a directory outside it, and
    // chroot into the temporary directory.
    let tmpdir = temp::mkdtemp("/tmp/sandbox_breakout-XXXXXX")?;
    util::chdir("/")?;
    util::chroot(&tmpdir)?;

    // The working directory is now the root of the sandbox we just left, as
    // seen from outside it.
    let prior: PathBuf = util::getcwd_raw()?;
    let name = name_from_root(&prior);
    debug!("breaking out of {}", prior.display());

    // Remember where the temporary directory ends up in the real tree, then
    // ascend to the real root and chroot into it.
    let debris = join(&prior, &tmpdir);
    let mut cwd = prior;
    while cwd != Path::new("/") {
        util::chdir("..")?;
        cwd = util::getcwd_raw()?;
    }
    util::chroot(".")?;

    util::rmdir(debris)?;
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_from_root() {
        assert_eq!(name_from_root(Path::new("/")), "/");
        assert_eq!(name_from_root(Path::new("/var/sandboxes/lucid")), "lucid");
        assert_eq!(name_from_root(Path::new("/var/sandboxes/a.b")), "a.b");
    }

    #[test]
    fn test_debris_location() {
        // the temporary directory reappears under the prior root
        let debris = join("/var/sandboxes/x", "/tmp/sandbox_breakout-abc123");
        assert_eq!(
            debris,
            PathBuf::from("/var/sandboxes/x/tmp/sandbox_breakout-abc123")
        );
    }
}
