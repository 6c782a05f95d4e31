//! Synchronous logging for the hasher-priv daemon, inspired by OpenBSD's
//! `log.c`.
//!
//! Every process of the privilege ladder is a single-threaded event loop
//! that forks, so logging is strictly synchronous: a message is written to
//! its target before the logging call returns.  The daemon logs to syslog
//! once daemonized and to stderr otherwise; short-lived helpers re-init
//! logging to their own stderr after fork.

use derive_more::{Display, From, Into};
use libc::openlog;
use serde_derive::{Deserialize, Serialize};
use slog::{Drain, Level, Logger, OwnedKVList, Record, KV};
use slog_envlogger::LogBuilder;
use slog_scope::GlobalLoggerGuard;
use std::{
    env,
    ffi::{CStr, CString},
    fmt,
    io::{self, Write},
    pin::Pin,
    sync::{Mutex, Once},
};

/// Re-export the scoped logging macros.
pub use slog_scope::{debug, error, info, trace, warn};

static LOG_BRIDGE: Once = Once::new();

lazy_static::lazy_static! {
    /// Default logger global guard.
    ///
    /// This is used before a logger context is initialized.
    pub static ref GLOBAL_LOGGER_GUARD: (Logger, GlobalLoggerGuard) = {
        new(
            Box::new(Stderr::new("").unwrap().fuse()),
            Config {
                foreground: true,
                level: Some("info".to_string()),
            }
        )
    };

    /// Default global logger scope.
    static ref GLOBAL_LOGGER: Logger = GLOBAL_LOGGER_GUARD.0.clone();
}

/// Configuration for the logging crate.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// Log to the foreground or to syslog (default: syslog).
    pub foreground: bool,
    /// The log filter if RUST_LOG is not set.
    pub level: Option<String>,
}

impl From<bool> for Config {
    #[inline]
    fn from(foreground: bool) -> Self {
        Self {
            foreground,
            ..Default::default()
        }
    }
}

/// Logging errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "{}", "_0")]
    NulError(std::ffi::NulError),
    #[display(fmt = "{}", "_0")]
    IoError(io::Error),
}

impl std::error::Error for Error {}

/// Translate a `loglevel` config value into a log filter.
///
/// The daemon config uses syslog-style level names; `notice` has no slog
/// counterpart and maps to `info`.
pub fn filter_from_level_name(name: &str) -> Option<&'static str> {
    match name {
        "debug" => Some("debug"),
        "info" | "notice" => Some("info"),
        "warning" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

/// Initialize the global logger context.
///
/// This is also called by `sync_logger`.
pub fn init() {
    lazy_static::initialize(&GLOBAL_LOGGER);
    LOG_BRIDGE.call_once(|| {
        if let Err(err) = slog_stdlog::init() {
            error!("Failed to initialize log bridge: {}", err);
        }
    });
}

fn new(
    drain: Box<dyn Drain<Err = slog::Never, Ok = ()> + Send>,
    config: Config,
) -> (Logger, GlobalLoggerGuard) {
    let kv = slog::o!();

    // Build log filter
    let mut builder = LogBuilder::new(drain);
    let log = env::var("RUST_LOG")
        .ok()
        .or(config.level)
        .unwrap_or_else(|| "info".to_string());
    builder = builder.parse(&log);
    let drain = builder.build();

    // This is required to make the drain `UnwindSafe`.
    let drain = Mutex::new(drain.fuse());

    let logger = slog::Logger::root(drain.fuse(), kv).into_erased();
    let guard = slog_scope::set_global_logger(logger.clone());

    (logger, guard)
}

/// Return a new global synchronous logger.
pub fn sync_logger<C: Into<Config>>(name: &str, config: C) -> Result<LoggerGuard, Error> {
    let config = config.into();

    init();

    let guard = if config.foreground {
        new(Box::new(Stderr::new(name)?.fuse()), config)
    } else {
        new(Box::new(Syslog::new(name)?.fuse()), config)
    };

    Ok(guard.into())
}

/// Wrapper for the global logger guard.
#[derive(From)]
pub struct LoggerGuard {
    _logger: Logger,
    _guard: GlobalLoggerGuard,
}

impl Drop for LoggerGuard {
    fn drop(&mut self) {
        let guard = slog_scope::set_global_logger(GLOBAL_LOGGER.clone());
        guard.cancel_reset();
    }
}

/// Local trait implemented by the supported log targets.
pub trait Target: Send + Sync {
    fn new(name: &str) -> Result<Self, Error>
    where
        Self: Sized;
    fn log_entry(&self, level: Level, message: &str) -> Result<(), Error>;
}

/// Foreground logger that logs to stderr.
pub struct Stderr {
    name: String,
}

impl Target for Stderr {
    fn new(name: &str) -> Result<Self, Error> {
        Ok(Self {
            name: name.to_string(),
        })
    }

    fn log_entry(&self, _level: Level, message: &str) -> Result<(), Error> {
        let message = if !self.name.is_empty() {
            format!("{}: {}\n", self.name, message)
        } else {
            format!("{}\n", message)
        };
        io::stderr()
            .write_all(message.as_bytes())
            .map_err(Into::into)
    }
}

impl Drain for Stderr {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        let message = format_log(record, values);
        self.log_entry(record.level(), &message)
    }
}

/// Background logger that logs to syslog.
pub struct Syslog {
    /// We need to keep a reference to the const char * around.
    _name: Pin<CString>,
}

impl Target for Syslog {
    fn new(name: &str) -> Result<Self, Error> {
        let name = name.to_string();
        let _name = CString::new(&name[..name.find('(').unwrap_or_else(|| name.len())])?;
        let c_str: &CStr = _name.as_c_str();

        unsafe {
            openlog(
                c_str.as_ptr(),
                libc::LOG_PID | libc::LOG_NDELAY,
                libc::LOG_DAEMON,
            )
        };

        Ok(Self {
            _name: Pin::new(_name),
        })
    }

    fn log_entry(&self, level: Level, message: &str) -> Result<(), Error> {
        let c_string: CString = CString::new(message.as_bytes())?;
        let c_message: &CStr = c_string.as_c_str();

        let level = match level {
            Level::Critical => libc::LOG_CRIT,
            Level::Error => libc::LOG_ERR,
            Level::Warning => libc::LOG_WARNING,
            Level::Info => libc::LOG_INFO,
            Level::Debug | Level::Trace => libc::LOG_DEBUG,
        };

        unsafe {
            libc::syslog(level, b"%s\0".as_ptr().cast(), c_message.as_ptr());
        }

        Ok(())
    }
}

impl Drop for Syslog {
    /// Close syslog on shutdown.
    fn drop(&mut self) {
        unsafe {
            libc::closelog();
        }
    }
}

impl Drain for Syslog {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        let message = format_log(record, values);
        self.log_entry(record.level(), &message)
    }
}

/// Format the log message to a string.
#[inline]
fn format_log(record: &Record<'_>, values: &OwnedKVList) -> String {
    let mut formatter = Formatter::new(record);
    let _ = record.kv().serialize(record, &mut formatter);
    let _ = values.serialize(record, &mut formatter);
    formatter.into()
}

/// Formatter to create a log message from a record.
#[derive(Into)]
struct Formatter {
    #[into]
    buf: String,
}

impl Formatter {
    fn new(record: &Record<'_>) -> Self {
        let mut buf = format!("{}", record.msg());

        if record.level() >= Level::Debug {
            buf.push_str(&format!(
                ", source: {}:{}, module: {}",
                record.file(),
                record.line(),
                record.module()
            ));
        };

        Self { buf }
    }
}

/// Serializer for key-value fields.
impl slog::Serializer for Formatter {
    fn emit_arguments(&mut self, key: &str, val: &fmt::Arguments<'_>) -> slog::Result {
        self.buf.push_str(&format!(", {}: {}", key, val));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{filter_from_level_name, info, init, sync_logger, Config};

    #[test]
    fn test_default_log() {
        init();
        info!("default log");
    }

    #[test]
    fn test_level_names() {
        assert_eq!(filter_from_level_name("debug"), Some("debug"));
        assert_eq!(filter_from_level_name("notice"), Some("info"));
        assert_eq!(filter_from_level_name("warning"), Some("warn"));
        assert_eq!(filter_from_level_name("verbose"), None);
    }

    #[test]
    fn test_log_stderr() {
        let _guard = sync_logger(
            "test",
            Config {
                foreground: true,
                level: Some("debug".to_string()),
            },
        )
        .unwrap();

        info!("Hello, World!");
    }
}
