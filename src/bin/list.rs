use std::{env, process};

use log::error;

use sandbox::{logging, sandbox as lifecycle, user};

fn usage(argv0: &str) {
    eprintln!("Usage: {} [-n] [-q]", argv0);
}

fn help() {
    eprintln!("  -n, --names show names only; do not indicate the current sandbox");
    eprintln!("  -q, --quiet operate quietly");
    eprintln!("  -h, --help  show this help message");
}

fn main() {
    user::sudo_reexec();
    let argv0 = env::args().next().unwrap_or_else(|| "sandbox-list".into());
    logging::init(&argv0).expect("logger");

    let mut names_only = false;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "-n" | "--names" => names_only = true,
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

    // Get the name of the current sandbox before we start breaking out.
    let current = match lifecycle::which() {
        Ok(name) => name,
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    };
    let names = match lifecycle::list() {
        Ok(names) => names,
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    };

    for name in &names {
        if names_only {
            println!("{}", name);
        } else {
            let marker = if *name == current { '*' } else { ' ' };
            println!("{} {}", marker, name);
        }
    }
}
