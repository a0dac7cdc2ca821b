use std::{env, process};

use log::error;

use sandbox::{logging, sandbox as lifecycle, user};

fn usage(argv0: &str) {
    eprintln!("Usage: {} [<sandbox>] <path> [-q] [-h]", argv0);
}

fn help() {
    eprintln!("  <sandbox>   name of a sandbox (defaults to the current one)");
    eprintln!("  <path>      file to promote and hand to the blueprint group");
    eprintln!("  -q, --quiet operate quietly");
    eprintln!("  -h, --help  show this help message");
}

fn main() {
    user::sudo_reexec();
    let argv0 = env::args().next().unwrap_or_else(|| "sandbox-mark".into());
    logging::init(&argv0).expect("logger");

    let mut positional = vec![];
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
            _ => positional.push(arg),
        }
    }
    let (name, path) = match positional.as_slice() {
        [path] => (None, path.clone()),
        [name, path] => (Some(name.clone()), path.clone()),
        _ => {
            usage(&argv0);
            process::exit(1);
        }
    };
    if let Some(name) = &name {
        if !lifecycle::valid(name) {
            error!("invalid sandbox name {}", name);
            process::exit(1);
        }
    }

    if let Err(err) = lifecycle::mark(name.as_deref(), &path) {
        error!("{}", err);
        process::exit(1);
    }
}
