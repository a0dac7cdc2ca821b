//! Offering to stop services that only exist inside a sandbox.
//!
//! Before an interactive `use` the service directories are snapshotted from
//! the host; afterwards, anything new is a service the session installed.
//! Each one that reports itself running is offered for stopping, because it
//! would otherwise keep running on shared host resources after the session
//! ends.

use std::collections::HashSet;
use std::ffi::OsString;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{debug, warn};

use crate::err::{Error, Result};
use crate::fs::join;

#[derive(Debug, PartialEq, Eq)]
enum Kind {
    /// an upstart job: `<name>.conf`, managed by /sbin/status and /sbin/stop
    Upstart,
    /// a sysv init script, managed by running it with `status` and `stop`
    SysV,
}

fn classify(filename: &str) -> (Kind, String) {
    match filename.strip_suffix(".conf") {
        Some(name) => (Kind::Upstart, name.to_string()),
        None => (Kind::SysV, filename.to_string()),
    }
}

fn status_command(kind: &Kind, dir: &Path, filename: &str, name: &str) -> Command {
    let mut cmd = match kind {
        Kind::Upstart => {
            let mut cmd = Command::new("/sbin/status");
            cmd.arg(name);
            cmd
        }
        Kind::SysV => {
            let mut cmd = Command::new(join(dir, filename));
            cmd.arg("status");
            cmd
        }
    };
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

fn stop_command(kind: &Kind, dir: &Path, filename: &str, name: &str) -> Command {
    let mut cmd = match kind {
        Kind::Upstart => {
            let mut cmd = Command::new("/sbin/stop");
            cmd.arg(name);
            cmd
        }
        Kind::SysV => {
            let mut cmd = Command::new(join(dir, filename));
            cmd.arg("stop");
            cmd
        }
    };
    cmd.stdin(Stdio::null());
    cmd
}

fn list_dir(dir: &Path) -> Result<Vec<OsString>> {
    let mut names = vec![];
    for entry in std::fs::read_dir(dir).map_err(|e| Error::file("scandir", dir, e))? {
        let entry = entry.map_err(|e| Error::file("scandir", dir, e))?;
        names.push(entry.file_name());
    }
    names.sort();
    Ok(names)
}

/// Snapshot the service names present in the given directories.
pub fn services_list(dirs: &[PathBuf]) -> Result<HashSet<OsString>> {
    let mut services = HashSet::new();
    for dir in dirs {
        match list_dir(dir) {
            Ok(names) => services.extend(names),
            Err(err) => {
                warn!("{}", err);
                return Err(err);
            }
        }
    }
    Ok(services)
}

/// Re-enumerate the directories and offer to stop each running service not
/// present in `prior`.
pub fn services_stop(dirs: &[PathBuf], prior: &HashSet<OsString>) -> Result<()> {
    for dir in dirs {
        for filename in list_dir(dir)? {
            if prior.contains(&filename) {
                continue;
            }
            let filename = match filename.to_str() {
                Some(f) => f.to_string(),
                None => continue,
            };
            let (kind, name) = classify(&filename);

            // Check the status of services that only exist in the sandbox.
            let running = status_command(&kind, dir, &filename, &name)
                .status()
                .map(|s| s.success())
                .unwrap_or(false);
            if !running {
                debug!("{} not running", name);
                continue;
            }

            if offer(&name)? {
                let stopped = stop_command(&kind, dir, &filename, &name).status();
                if let Err(err) = stopped {
                    warn!("stopping {}: {}", name, err);
                }
            }
        }
    }
    Ok(())
}

/// Prompt on stderr and read the answer from stdin.  Empty, `y` and `yes`
/// accept; `n` and `no` decline; anything else asks again.
fn offer(name: &str) -> Result<bool> {
    let stdin = std::io::stdin();
    loop {
        eprint!("stop service {}? [Yn] ", name);
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                eprintln!();
                return Ok(false);
            }
            Ok(_) => (),
            Err(e) => return Err(Error::os("read stdin", e)),
        }
        match line.trim_end_matches('\n').to_ascii_lowercase().as_str() {
            "" | "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp::TempDir;

    #[test]
    fn test_classify() {
        assert_eq!(classify("cron.conf"), (Kind::Upstart, "cron".to_string()));
        assert_eq!(classify("ssh"), (Kind::SysV, "ssh".to_string()));
        assert_eq!(classify("rc.local"), (Kind::SysV, "rc.local".to_string()));
    }

    #[test]
    fn test_commands() {
        use std::ffi::OsStr;
        let dir = Path::new("/etc/init.d");
        let status = status_command(&Kind::SysV, dir, "ssh", "ssh");
        assert_eq!(status.get_program(), OsStr::new("/etc/init.d/ssh"));
        let stop = stop_command(&Kind::Upstart, dir, "cron.conf", "cron");
        assert_eq!(stop.get_program(), OsStr::new("/sbin/stop"));
    }

    #[test]
    fn test_snapshot_and_diff() {
        let tdir = TempDir::new().unwrap();
        let init = tdir.path().join("init");
        std::fs::create_dir(&init).unwrap();
        std::fs::write(init.join("cron.conf"), b"").unwrap();

        let dirs = vec![init.clone()];
        let prior = services_list(&dirs).unwrap();
        assert!(prior.contains(&OsString::from("cron.conf")));

        std::fs::write(init.join("mysql.conf"), b"").unwrap();
        let after = services_list(&dirs).unwrap();
        let fresh: Vec<_> = after.difference(&prior).collect();
        assert_eq!(fresh, vec![&OsString::from("mysql.conf")]);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let tdir = TempDir::new().unwrap();
        let dirs = vec![tdir.path().join("absent")];
        assert!(services_list(&dirs).is_err());
    }
}
