use std::{env, process};

use log::error;

use sandbox::{logging, sandbox as lifecycle, user};

fn usage(argv0: &str) {
    eprintln!(
        "Usage: {} <sandbox> [-c <command>] [--callback=<callback>] [-q] [-h]",
        argv0
    );
}

fn help() {
    eprintln!("  <sandbox>                       name of a sandbox");
    eprintln!("-c <command>, --command=<command> command to run (defaults to your shell)");
    eprintln!("--callback=<callback>             command to run when <command> exits");
    eprintln!("  -q, --quiet                     operate quietly");
    eprintln!("  -h, --help                      show this help message");
}

fn main() {
    user::sudo_reexec();
    let argv0 = env::args().next().unwrap_or_else(|| "sandbox-use".into());
    logging::init(&argv0).expect("logger");

    let mut command = None;
    let mut callback = None;
    let mut names = vec![];
    let mut iargs = env::args().skip(1);
    while let Some(arg) = iargs.next() {
        match arg.as_str() {
            "-c" | "--command" => match iargs.next() {
                Some(value) => command = Some(value),
                None => {
                    usage(&argv0);
                    process::exit(1);
                }
            },
            "--callback" => match iargs.next() {
                Some(value) => callback = Some(value),
                None => {
                    usage(&argv0);
                    process::exit(1);
                }
            },
            _ if arg.starts_with("--command=") => {
                command = Some(arg["--command=".len()..].to_string())
            }
            _ if arg.starts_with("--callback=") => {
                callback = Some(arg["--callback=".len()..].to_string())
            }
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

    match lifecycle::use_(&name, command.as_deref(), callback.as_deref()) {
        Ok(status) => process::exit(status),
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    }
}
