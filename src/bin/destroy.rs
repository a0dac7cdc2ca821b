use std::{env, process};

use log::error;

use sandbox::{logging, sandbox as lifecycle, user};

fn usage(argv0: &str) {
    eprintln!("Usage: {} [-q] <name>", argv0);
}

fn help() {
    eprintln!("  -q, --quiet operate quietly");
    eprintln!("  -h, --help  show this help message");
}

fn main() {
    user::sudo_reexec();
    let argv0 = env::args().next().unwrap_or_else(|| "sandbox-destroy".into());
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
    let name = match names.as_slice() {
        [name] => name.clone(),
        _ => {
            usage(&argv0);
            process::exit(1);
        }
    };
    if !lifecycle::valid(&name) {
        error!("invalid sandbox name {}", name);
        process::exit(1);
    }

    if let Err(err) = lifecycle::destroy(&name) {
        error!("{}", err);
        process::exit(1);
    }
}
