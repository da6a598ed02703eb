//! Process-wide logging setup over `env_logger`.
//!
//! `RUST_LOG` takes precedence over the defaults passed here. The logger can
//! be replaced at any time, e.g. after the validator has parsed `--log`.

use {
    parking_lot::RwLock,
    std::{fs::OpenOptions, io, path::Path, sync::OnceLock},
};

static LOGGER: OnceLock<RwLock<env_logger::Logger>> = OnceLock::new();

/// Forwards to whichever `env_logger::Logger` is currently installed.
struct LoggerShim;

impl log::Log for LoggerShim {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        current(|logger| logger.enabled(metadata)).unwrap_or(false)
    }

    fn log(&self, record: &log::Record) {
        current(|logger| logger.log(record));
    }

    fn flush(&self) {
        current(|logger| logger.flush());
    }
}

fn current<T>(f: impl FnOnce(&env_logger::Logger) -> T) -> Option<T> {
    LOGGER.get().map(|lock| f(&lock.read()))
}

fn replace_logger(logger: env_logger::Logger) {
    log::set_max_level(logger.filter());
    match LOGGER.get() {
        Some(lock) => *lock.write() = logger,
        None => {
            let _ = LOGGER.set(RwLock::new(logger));
        }
    }
    // Fails harmlessly if the shim is already installed
    let _ = log::set_boxed_logger(Box::new(LoggerShim));
}

fn builder(filter: &str, overrides: bool) -> env_logger::Builder {
    let env = if overrides {
        env_logger::Env::new().filter_or("_RUST_LOG", filter)
    } else {
        env_logger::Env::new().default_filter_or(filter)
    };
    let mut builder = env_logger::Builder::from_env(env);
    builder.format_timestamp_micros();
    builder
}

/// Log with `filter` regardless of `RUST_LOG`.
pub fn setup_with(filter: &str) {
    replace_logger(builder(filter, true).build());
}

/// Log with `RUST_LOG`, falling back to `filter`.
pub fn setup_with_default(filter: &str) {
    replace_logger(builder(filter, false).build());
}

/// Log errors only unless `RUST_LOG` says otherwise.
pub fn setup() {
    setup_with_default("error");
}

/// Like [`setup_with_default`], but append to `logfile`.
pub fn setup_file_with_default(logfile: &Path, filter: &str) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(logfile)?;
    let mut builder = builder(filter, false);
    builder.target(env_logger::Target::Pipe(Box::new(file)));
    replace_logger(builder.build());
    Ok(())
}
