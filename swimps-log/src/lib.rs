use std::fmt;
use std::str::FromStr;

use log::LevelFilter;

/// The verbosity levels swimps understands, in descending order of severity.
///
/// This is swimps' own taxonomy rather than the `log` crate's because it
/// travels across the exec boundary in the serialised options, and because
/// fatal messages are a distinct concept: they are always followed by a
/// non-zero exit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    /// The closest `log` crate filter. Fatal has no equivalent there, so it
    /// maps onto `Error`.
    pub fn level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warning => LevelFilter::Warn,
            LogLevel::Error | LogLevel::Fatal => LevelFilter::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        };

        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            other => Err(format!(
                "unknown log level {other:?}, expected one of debug, info, warning, error, fatal"
            )),
        }
    }
}

/// Installs the logger at the requested level.
///
/// The serialised options are the single source of truth for verbosity on
/// both sides of the exec boundary, so `RUST_LOG` is deliberately ignored.
/// Calling this twice is harmless; the second call is a no-op.
pub fn init(level: LogLevel) {
    let _ = env_logger::Builder::new()
        .filter_level(level.level_filter())
        .format_timestamp(None)
        .try_init();
}
