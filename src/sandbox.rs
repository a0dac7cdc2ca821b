//! Sandbox lifecycle: create, clone, list, use, destroy.
//!
//! A sandbox `<name>` is two sibling directories:
//!
//! - `/var/sandboxes/<name>` — the chroot target, shallow-copied from its
//!   parent so nearly every file shares an inode with the host;
//! - `/var/sandboxes/.<name>` — the shadow: the private `/etc` tree backing
//!   the COW filesystem, a `parent` file naming the clone source, and the
//!   `refs` lock file.
//!
//! The base sandbox is the host itself, named `/`.  Every operation begins
//! with a [`breakout`] so it runs against the real root no matter where it
//! was invoked.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use libc;

use log::{debug, info, warn};

use crate::breakout::breakout;
use crate::copy;
use crate::cow;
use crate::err::{Error, Result};
use crate::fs::join;
use crate::proc::{self, Fork};
use crate::refs::Ref;
use crate::services;
use crate::user;
use crate::util;

/// Root of the sandbox store.
pub const STORE: &str = "/var/sandboxes";

/// The base sandbox: the host root itself.
pub const BASE: &str = "/";

/// Group handed marked files, recognized by the blueprint tooling ("BEEF").
pub const MARKER_GID: libc::gid_t = 48879;

const NAME_MAX: usize = 255;

/// Directories snapshotted for the service diff around interactive use.
fn service_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/etc/init"), PathBuf::from("/etc/init.d")]
}

/// A name is valid if it could be a single, non-hidden directory entry:
/// non-empty, within NAME_MAX, not starting with `.`, free of `/` and
/// whitespace.  The literal `/` names the base sandbox and is also valid.
pub fn valid(name: &str) -> bool {
    if name == BASE {
        return true;
    }
    if name.is_empty() || name.len() > NAME_MAX {
        return false;
    }
    if name.starts_with('.') {
        return false;
    }
    !name
        .chars()
        .any(|c| matches!(c, '/' | ' ' | '\t' | '\r' | '\n'))
}

/// The sandbox's root directory (the chroot target).
pub fn root(name: &str) -> PathBuf {
    if name == BASE {
        PathBuf::from(BASE)
    } else {
        join(STORE, name)
    }
}

/// The sandbox's shadow directory.  The base sandbox has none.
pub fn shadow(name: &str) -> PathBuf {
    join(STORE, format!(".{}", name))
}

/// A sandbox exists if its root directory exists and is a directory.  This
/// requires a prior breakout to be meaningful.
pub fn exists(name: &str) -> bool {
    if name == BASE {
        return true;
    }
    root(name)
        .symlink_metadata()
        .map(|s| s.file_type().is_dir())
        .unwrap_or(false)
}

/// List all sandboxes, the base sandbox first, the rest sorted by name.
/// Fails when the store directory cannot be read, a missing store included.
pub fn list() -> Result<Vec<String>> {
    breakout()?;
    let mut names = vec![BASE.to_string()];
    let entries = std::fs::read_dir(STORE).map_err(|e| Error::file("opendir", STORE, e))?;
    let mut found = vec![];
    for entry in entries {
        let entry = entry.map_err(|e| Error::file("readdir", STORE, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // dotted entries are shadow directories
        if name.starts_with('.') {
            continue;
        }
        found.push(name);
    }
    found.sort();
    names.extend(found);
    Ok(names)
}

/// The name of the current sandbox.
pub fn which() -> Result<String> {
    breakout()
}

enum Announce {
    Create,
    Clone,
}

/// Create a sandbox by cloning the base sandbox.
pub fn create(name: &str) -> Result<()> {
    clone_internal(Some(BASE), name, Announce::Create)
}

/// Clone a sandbox.  With no source, clones the sandbox this process is in.
pub fn clone(srcname: Option<&str>, destname: &str) -> Result<()> {
    clone_internal(srcname, destname, Announce::Clone)
}

fn clone_internal(srcname: Option<&str>, destname: &str, announce: Announce) -> Result<()> {
    let current = breakout()?;
    let srcname = srcname.unwrap_or(current.as_str());

    if !exists(srcname) {
        return Err(Error::NotFound {
            name: srcname.to_string(),
        });
    }
    if exists(destname) {
        return Err(Error::Exists {
            name: destname.to_string(),
        });
    }
    match announce {
        Announce::Create => info!("creating sandbox {}", destname),
        Announce::Clone => info!("cloning sandbox {} to {}", srcname, destname),
    }

    // Make sure the store exists and is a directory.
    match Path::new(STORE).symlink_metadata() {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            util::mkdir(STORE, 0o755)?;
        }
        Err(e) => return Err(Error::file("lstat", STORE, e)),
        Ok(s) if !s.file_type().is_dir() => {
            return Err(Error::refused(format!("{} is not a directory", STORE)))
        }
        Ok(_) => (),
    }

    let src = root(srcname);
    let dest = root(destname);

    // Shallow copy most of the filesystem.
    {
        use std::os::unix::fs::MetadataExt;
        let s = src
            .symlink_metadata()
            .map_err(|e| Error::file("lstat", &src, e))?;
        let exclude: Vec<PathBuf> = ["/etc", STORE, "/root", "/home"]
            .iter()
            .map(|sub| join(&src, sub))
            .collect();
        if let Err(err) = copy::shallow_copy(&src, &dest, s.dev(), &exclude) {
            warn!("shallow copying {}: {}", src.display(), err);
        }
    }

    // Shallow copy /etc from the appropriate source into the shadow
    // directory, and leave an empty /etc for the COW filesystem to take
    // over.
    {
        use std::os::unix::fs::MetadataExt;
        util::mkdir(join(&dest, "etc"), 0o755)?;
        let shadowsrc = if srcname == BASE {
            PathBuf::from("/etc")
        } else {
            join(shadow(srcname), "etc")
        };
        let s = shadowsrc
            .symlink_metadata()
            .map_err(|e| Error::file("lstat", &shadowsrc, e))?;
        util::mkdir(shadow(destname), 0o755)?;
        let shadowdest = join(shadow(destname), "etc");
        if let Err(err) = copy::shallow_copy(&shadowsrc, &shadowdest, s.dev(), &[]) {
            warn!("shallow copying {}: {}", shadowsrc.display(), err);
        }
    }

    // Deep copy /root and /home.
    {
        let exclude = vec![join(&src, STORE)];
        for sub in ["/root", "/home"] {
            let deepsrc = join(&src, sub);
            let deepdest = join(&dest, sub);
            if let Err(err) = copy::deep_copy(&deepsrc, &deepdest, &exclude) {
                warn!("deep copying {}: {}", deepsrc.display(), err);
            }
        }
    }

    // Record the parent, and seed the lock file the reference count uses.
    let parent = if srcname == BASE {
        String::new()
    } else {
        format!("{}\n", srcname)
    };
    util::write_file(join(shadow(destname), "parent"), parent)?;
    util::write_file(join(shadow(destname), "refs"), "")?;
    Ok(())
}

/// Destroy a sandbox.  The base sandbox and the sandbox this process is in
/// are refused.
pub fn destroy(name: &str) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let current = breakout()?;
    if !exists(name) {
        return Err(Error::NotFound {
            name: name.to_string(),
        });
    }
    if name == BASE {
        return Err(Error::refused("won't destroy the base sandbox"));
    }
    if name == current {
        return Err(Error::refused("won't destroy the current sandbox"));
    }
    info!("destroying sandbox {}", name);

    let dirname = root(name);
    let s1 = dirname
        .symlink_metadata()
        .map_err(|e| Error::file("lstat", &dirname, e))?;

    // The COW filesystem may still be mounted over /etc; a device mismatch
    // against the sandbox root says so.
    let fuse = join(&dirname, "etc");
    let s2 = fuse
        .symlink_metadata()
        .map_err(|e| Error::file("lstat", &fuse, e))?;
    if s1.dev() != s2.dev() {
        info!("unmounting special /etc");
        let status = Command::new("/bin/umount").arg(&fuse).status();
        match status {
            Ok(sts) if sts.success() => (),
            _ => warn!("sandboxfs misbehaving, skipping"),
        }
    }

    let shadowdir = shadow(name);
    if let Ok(s) = shadowdir.symlink_metadata() {
        copy::remove_tree(&shadowdir, s.dev())?;
    }
    copy::remove_tree(&dirname, s1.dev())?;
    Ok(())
}

/// Run the user's preferred shell or an arbitrary command in a sandbox.
/// Returns the payload's exit code once the lifecycle itself succeeded.
pub fn use_(name: &str, command: Option<&str>, callback: Option<&str>) -> Result<i32> {
    let current = breakout()?;
    if !exists(name) {
        return Err(Error::NotFound {
            name: name.to_string(),
        });
    }
    info!("using sandbox {}", name);

    let reference = if name == BASE {
        None
    } else {
        Some(Ref::acquire(join(shadow(name), "refs"))?)
    };

    let mut forwarded: Option<ForwardedAgent> = None;
    let result = enter(name, &current, command, callback, &mut forwarded);

    // If this process is the last one using the link to the ssh-agent
    // socket, remove it along with its directory.
    if let (Some(reference), Some(agent)) = (&reference, &forwarded) {
        match reference.last_user() {
            Ok(true) => agent.remove(),
            Ok(false) => (),
            Err(err) => warn!("reference check: {}", err),
        }
    }
    drop(reference);
    result
}

/// A forwarded ssh-agent socket link, with the path it is reachable at from
/// wherever the process currently is (the link is made before the chroot,
/// the cleanup happens after it).
struct ForwardedAgent {
    sock: PathBuf,
}

impl ForwardedAgent {
    fn remove(&self) {
        debug!("removing forwarded agent {}", self.sock.display());
        if let Err(err) = std::fs::remove_file(&self.sock) {
            warn!("unlink {}: {}", self.sock.display(), err);
        }
        if let Some(dir) = self.sock.parent() {
            let _ = std::fs::remove_dir(dir);
        }
    }
}

fn enter(
    name: &str,
    current: &str,
    command: Option<&str>,
    callback: Option<&str>,
    forwarded: &mut Option<ForwardedAgent>,
) -> Result<i32> {
    use std::os::unix::fs::MetadataExt;

    let dirname = root(name);

    // If the user's home directory doesn't exist in this sandbox, deep copy
    // it from the base sandbox.
    if let Ok(home) = env::var("HOME") {
        let homedest = join(&dirname, &home);
        if homedest.symlink_metadata().is_err() {
            if let Err(err) = copy::deep_copy(&home, &homedest, &[]) {
                warn!("deep copying {}: {}", home, err);
            }
        }
    }

    // Recursively rebind mounted devices.  This only has real work to do
    // the first time a sandbox is used after a reboot.  Walking the whole
    // filesystem is slow, so guess that if /dev is mounted correctly, so is
    // everything else.
    let s1 = Path::new("/dev")
        .symlink_metadata()
        .map_err(|e| Error::file("lstat", "/dev", e))?;
    let devdir = join(&dirname, "dev");
    let s2 = devdir
        .symlink_metadata()
        .map_err(|e| Error::file("lstat", &devdir, e))?;
    if s1.dev() != s2.dev() {
        let s = dirname
            .symlink_metadata()
            .map_err(|e| Error::file("lstat", &dirname, e))?;
        info!("remounting devices");
        let exclude = vec![
            PathBuf::from(STORE),
            PathBuf::from("/root"),
            PathBuf::from("/home"),
        ];
        copy::remount(BASE, &dirname, s.dev(), &exclude)?;
    }

    // Mount the COW filesystem in front of /etc if that hasn't already
    // been done.
    let s1 = Path::new("/etc")
        .symlink_metadata()
        .map_err(|e| Error::file("lstat", "/etc", e))?;
    let etc = join(&dirname, "etc");
    let s2 = etc
        .symlink_metadata()
        .map_err(|e| Error::file("lstat", &etc, e))?;
    if s1.dev() == s2.dev() && name != BASE {
        info!("mounting special /etc");
        let status = Command::new("sandboxfs")
            .arg("-oallow_other")
            .arg(&etc)
            .status();
        match status {
            Ok(sts) if sts.success() => (),
            _ => warn!("sandboxfs misbehaving, skipping"),
        }
    }

    // If there's an `ssh-agent`(1) reachable from the current sandbox,
    // hard-link its socket into the one being used.
    if let Ok(sock) = env::var("SSH_AUTH_SOCK") {
        let outside = if current == BASE {
            PathBuf::from(&sock)
        } else {
            join(root(current), &sock)
        };
        if let Ok(s) = outside.symlink_metadata() {
            let sockdest = join(&dirname, &sock);
            if let Some(sockdir) = sockdest.parent() {
                match util::mkdir(sockdir, 0o700) {
                    Ok(_) => (),
                    Err(Error::File { ref io, .. })
                        if io.raw_os_error() == Some(libc::EEXIST) => {}
                    Err(err) => warn!("{}", err),
                }
                if let Err(err) = util::lchown(sockdir, s.uid(), s.gid()) {
                    warn!("{}", err);
                }
            }
            // EEXIST means a concurrent use already forwarded the socket;
            // the reference count decides who cleans it up either way
            match util::link(&outside, &sockdest) {
                Ok(()) => *forwarded = Some(ForwardedAgent { sock: sockdest }),
                Err(Error::File { ref io, .. }) if io.raw_os_error() == Some(libc::EEXIST) => {
                    *forwarded = Some(ForwardedAgent { sock: sockdest })
                }
                Err(err) => warn!("{}", err),
            }
        }
    }

    // Note services that exist before we enter, if we're starting an
    // interactive shell.
    let snapshot = if command.is_none() {
        Some(services::services_list(&service_dirs())?)
    } else {
        None
    };

    // Use the sandbox.
    util::chroot(&dirname)?;
    // the forwarded socket is now reachable at its in-sandbox path
    if let Some(agent) = forwarded.as_mut() {
        if let Ok(sock) = env::var("SSH_AUTH_SOCK") {
            agent.sock = PathBuf::from(sock);
        }
    }
    match env::var("HOME") {
        Ok(home) => util::chdir(home)?,
        Err(_) => util::chdir("/")?,
    }

    // Put the name of the sandbox in the environment for children.
    env::set_var("SANDBOX", name);

    // Execute the command (or the user's shell) followed by the callback,
    // as the invoking user.
    let argv: Vec<String> = match command {
        Some(command) => vec!["/bin/sh".into(), "-c".into(), command.into()],
        None => {
            let shell = env::var("SHELL").unwrap_or_else(|_| "/bin/sh".into());
            vec![shell, "-i".into(), "-l".into()]
        }
    };
    let status = run_payload(&argv)?;

    if let Some(callback) = callback {
        let argv: Vec<String> = vec!["/bin/sh".into(), "-c".into(), callback.into()];
        run_payload(&argv)?;
    }

    // Offer to stop services this session left running, if it was an
    // interactive shell.
    if let Some(snapshot) = snapshot {
        services::services_stop(&service_dirs(), &snapshot)?;
    }

    Ok(status)
}

fn run_payload(argv: &[String]) -> Result<i32> {
    debug!("exec {:?}", argv);
    match proc::fork()? {
        Fork::Parent(mut child) => child.park(),
        Fork::Child => {
            if let Err(err) = user::downgrade() {
                warn!("downgrade: {}", err);
            }
            warn!("{}", exec_argv(argv));
            std::process::exit(255);
        }
    }
}

fn exec_argv(argv: &[String]) -> Error {
    let mut exec = match proc::Exec::new(&argv[0]) {
        Ok(exec) => exec,
        Err(err) => return err,
    };
    if let Err(err) = exec.args(argv) {
        return err;
    }
    exec.exec()
}

/// Promote a file inside a sandbox to a private inode and hand it to the
/// blueprint group with group write permission.
pub fn mark(name: Option<&str>, file: &str) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let current = breakout()?;
    let name = name.unwrap_or(current.as_str());
    if !exists(name) {
        return Err(Error::NotFound {
            name: name.to_string(),
        });
    }
    info!("marking {} in sandbox {}", file, name);

    let target = mark_target(name, file);
    cow::promote(&target)?;
    let s = target
        .symlink_metadata()
        .map_err(|e| Error::file("lstat", &target, e))?;
    util::lchown(&target, s.uid(), MARKER_GID)?;
    util::chmod(&target, (s.mode() & 0o7777) | 0o020)?;
    Ok(())
}

/// Where a path inside a sandbox really lives.  `/etc` is served from the
/// shadow; everything else sits in the root tree.
fn mark_target(name: &str, file: &str) -> PathBuf {
    if name == BASE {
        return PathBuf::from(file);
    }
    match Path::new(file).strip_prefix("/etc") {
        Ok(rest) => join(join(shadow(name), "etc"), rest),
        Err(_) => join(root(name), file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(valid("/"));
        assert!(valid("a"));
        assert!(valid("lucid"));
        assert!(valid("a.b"));
        assert!(valid("with-dash_and.dot"));

        assert!(!valid(""));
        assert!(!valid(".hidden"));
        assert!(!valid("a/b"));
        assert!(!valid("/a"));
        assert!(!valid("a b"));
        assert!(!valid("a\tb"));
        assert!(!valid("a\nb"));
        assert!(!valid(" a"));
        assert!(!valid(&"x".repeat(256)));
        assert!(valid(&"x".repeat(255)));
    }

    #[test]
    fn test_layout_paths() {
        assert_eq!(root("/"), PathBuf::from("/"));
        assert_eq!(root("lucid"), PathBuf::from("/var/sandboxes/lucid"));
        assert_eq!(shadow("lucid"), PathBuf::from("/var/sandboxes/.lucid"));
    }

    #[test]
    fn test_exists_base() {
        assert!(exists("/"));
    }

    #[test]
    fn test_mark_target_resolution() {
        assert_eq!(
            mark_target("lucid", "/etc/motd"),
            PathBuf::from("/var/sandboxes/.lucid/etc/motd")
        );
        assert_eq!(
            mark_target("lucid", "/usr/bin/tool"),
            PathBuf::from("/var/sandboxes/lucid/usr/bin/tool")
        );
        // /etcetera is not /etc
        assert_eq!(
            mark_target("lucid", "/etcetera"),
            PathBuf::from("/var/sandboxes/lucid/etcetera")
        );
        assert_eq!(mark_target("/", "/etc/motd"), PathBuf::from("/etc/motd"));
    }
}
