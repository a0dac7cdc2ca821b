use std::{env, process};

use log::error;

use sandbox::{logging, sandbox as lifecycle, user};

fn usage(argv0: &str) {
    eprintln!("Usage: {} [-q]", argv0);
}

fn help() {
    eprintln!("  -q, --quiet operate quietly");
    eprintln!("  -h, --help  show this help message");
}

fn main() {
    user::sudo_reexec();
    let argv0 = env::args().next().unwrap_or_else(|| "sandbox-which".into());
    logging::init(&argv0).expect("logger");

    for arg in env::args().skip(1) {
        match arg.as_str() {
            "-q" | "--quiet" => logging::quiet(),
            "-h" | "--help" => {
                usage(&argv0);
                help();
                process::exit(0);
            }
            _ => {
                usage(&argv0);
                process::exit(1);
            }
        }
    }

    match lifecycle::which() {
        Ok(name) => {
            if name != lifecycle::BASE {
                println!("{}", name);
            }
        }
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    }
}
