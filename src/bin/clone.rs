use std::{env, process};

use log::error;

use sandbox::{logging, sandbox as lifecycle, user};

fn usage(argv0: &str) {
    eprintln!("Usage: {} [<sandbox-src>] <sandbox-dest> [-q] [-h]", argv0);
}

fn help() {
    eprintln!("  <sandbox-src>  name of an existing sandbox");
    eprintln!("  <sandbox-dest> name of a nonexistent sandbox");
    eprintln!("  -q, --quiet    operate quietly");
    eprintln!("  -h, --help     show this help message");
}

fn main() {
    user::sudo_reexec();
    let argv0 = env::args().next().unwrap_or_else(|| "sandbox-clone".into());
    logging::init(&argv0).expect("logger");

    let mut names = vec![];
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "-q" | "--quiet" => logging::quiet(),
            "-h" | "--help" => {
                usage(&argv0);
                help();
                process::exit(0);
            }
            _ if arg.starts_with('-') => {
                usage(&argv0);
                process::exit(1);
            }
            _ => names.push(arg),
        }
    }
    let (srcname, destname) = match names.as_slice() {
        [dest] => (None, dest.clone()),
        [src, dest] => (Some(src.clone()), dest.clone()),
        _ => {
            usage(&argv0);
            process::exit(1);
        }
    };
    if let Some(srcname) = &srcname {
        if !lifecycle::valid(srcname) {
            error!("invalid sandbox name {}", srcname);
            process::exit(1);
        }
    }
    if !lifecycle::valid(&destname) {
        error!("invalid sandbox name {}", destname);
        process::exit(1);
    }

    if let Err(err) = lifecycle::clone(srcname.as_deref(), &destname) {
        error!("{}", err);
        process::exit(1);
    }
}
