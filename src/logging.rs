use log::{self, LevelFilter, Log, SetLoggerError};
/// Diagnostic channel shared by the command line tools.
///
/// Every line is prefixed `# [<progname>] ` and written to stderr so the
/// tools can be used in pipelines without corrupting stdout.  `info!` is the
/// progress channel and is silenced by `--quiet`; `warn!` and `error!` always
/// print.
use std::str::FromStr;

struct Logger {
    prefix: String,
}

impl Log for Logger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true // log::set_max_level() is sufficient
    }

    fn log(&self, record: &log::Record) {
        eprintln!("{}{}", self.prefix, record.args());
    }

    fn flush(&self) {}
}

/// Install the logger.  `progname` is usually `argv[0]` with its directory
/// stripped.
pub fn init<S: AsRef<str>>(progname: S) -> Result<(), SetLoggerError> {
    let base = progname
        .as_ref()
        .rsplit('/')
        .next()
        .unwrap_or(progname.as_ref())
        .to_string();

    let lvl = std::env::var("RUST_LOG")
        .ok()
        .as_deref()
        .map(LevelFilter::from_str)
        .and_then(Result::ok)
        .unwrap_or(LevelFilter::Info);

    log::set_max_level(lvl);
    log::set_boxed_logger(Box::new(Logger {
        prefix: format!("# [{}] ", base),
    }))
}

/// Suppress informational messages.  Warnings and errors still print.
pub fn quiet() {
    if log::max_level() > LevelFilter::Warn {
        log::set_max_level(LevelFilter::Warn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_strips_directory() {
        // init() may only run once per process, so test the stripping inline
        let progname = "/usr/bin/sandbox-use";
        let base = progname.rsplit('/').next().unwrap();
        assert_eq!(base, "sandbox-use");
    }

    #[test]
    fn test_quiet_lowers_level() {
        log::set_max_level(LevelFilter::Info);
        quiet();
        assert_eq!(log::max_level(), LevelFilter::Warn);
        // never raises
        log::set_max_level(LevelFilter::Error);
        quiet();
        assert_eq!(log::max_level(), LevelFilter::Error);
    }
}
