use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, process};

use log::{error, warn};

use sandbox::cowfs;
use sandbox::proc::{self, Fork, TryWait};
use sandbox::{logging, user};

fn usage(argv0: &str) {
    eprintln!("Usage: {} [-oallow_other] [-f] <mountpoint>", argv0);
}

fn help() {
    eprintln!("  <mountpoint>    a sandbox's /etc directory");
    eprintln!("  -o <options>    mount options; only allow_other is honored");
    eprintln!("  -f              stay in the foreground");
    eprintln!("  -h, --help      show this help message");
}

fn main() {
    user::sudo_reexec();
    let argv0 = env::args().next().unwrap_or_else(|| "sandboxfs".into());
    logging::init(&argv0).expect("logger");

    let mut allow_other = false;
    let mut foreground = false;
    let mut mountpoint: Option<PathBuf> = None;
    let mut iargs = env::args().skip(1);
    while let Some(arg) = iargs.next() {
        if arg == "-h" || arg == "--help" {
            usage(&argv0);
            help();
            process::exit(0);
        } else if arg == "-f" {
            foreground = true;
        } else if arg.starts_with("-o") {
            let opts = if arg == "-o" {
                match iargs.next() {
                    Some(opts) => opts,
                    None => {
                        usage(&argv0);
                        process::exit(1);
                    }
                }
            } else {
                arg[2..].to_string()
            };
            for opt in opts.split(',') {
                match opt {
                    "allow_other" => allow_other = true,
                    "" => (),
                    other => warn!("ignoring mount option {}", other),
                }
            }
        } else if arg.starts_with('-') {
            usage(&argv0);
            process::exit(1);
        } else if mountpoint.is_none() {
            mountpoint = Some(PathBuf::from(arg));
        } else {
            usage(&argv0);
            process::exit(1);
        }
    }
    let mountpoint = match mountpoint {
        Some(m) => m,
        None => {
            usage(&argv0);
            process::exit(1);
        }
    };

    if foreground {
        if let Err(err) = cowfs::serve(&mountpoint, allow_other) {
            error!("{}", err);
            process::exit(1);
        }
        return;
    }

    // Background: the child serves the filesystem; this process sticks
    // around only until the mount is observable, so callers may wait on it
    // before chrooting.
    let before = match mountpoint.symlink_metadata() {
        Ok(s) => s.dev(),
        Err(err) => {
            error!("lstat {}: {}", mountpoint.display(), err);
            process::exit(1);
        }
    };
    match proc::fork() {
        Ok(Fork::Child) => {
            if let Err(err) = cowfs::serve(&mountpoint, allow_other) {
                error!("{}", err);
                process::exit(1);
            }
            process::exit(0);
        }
        Ok(Fork::Parent(server)) => wait_for_mount(&mountpoint, before, server),
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    }
}

fn wait_for_mount(mountpoint: &Path, before: u64, server: proc::Proc) -> ! {
    for _ in 0..200 {
        if let Ok(s) = mountpoint.symlink_metadata() {
            if s.dev() != before {
                // mounted; leave the server running
                std::mem::forget(server);
                process::exit(0);
            }
        }
        match proc::trywaitpid(server.id()) {
            Ok(TryWait::Done(_, code)) => {
                error!("server exited with {}", code);
                std::mem::forget(server);
                process::exit(if code == 0 { 1 } else { code });
            }
            Ok(TryWait::Busy) => (),
            Err(err) => {
                error!("{}", err);
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    error!("mount did not appear on {}", mountpoint.display());
    drop(server); // kills the stuck server
    process::exit(1);
}
