//! Logging utilities.
//!
//! Ferry logs through the `log` facade and leaves the choice of backend to
//! the binary. This module defines the runtime log level used by
//! [`log_event!`](crate::log_event) and the verbosity switch that pools and
//! runners expose as their `debug` flag.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Log level, ordered by increasing severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Verbose debug information.
    Trace,

    /// Debug information.
    Debug,

    /// Informational messages.
    Info,

    /// Warning messages.
    Warning,

    /// Error messages.
    Error,
}

impl LogLevel {
    /// Get the name of this log level.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }

    /// Level for per-operation detail records of a component.
    ///
    /// Components built with `debug = true` emit their claim/run detail at
    /// `Debug`; otherwise the same records go out at `Trace`.
    pub fn verbosity(debug: bool) -> Self {
        if debug {
            Self::Debug
        } else {
            Self::Trace
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" | "err" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => log::Level::Trace,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

/// Name of the calling thread, falling back to its id for unnamed threads.
pub fn thread_label() -> String {
    let current = std::thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Error > LogLevel::Warning);
        assert!(LogLevel::Warning > LogLevel::Info);
        assert!(LogLevel::Info > LogLevel::Debug);
        assert!(LogLevel::Debug > LogLevel::Trace);
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("TRACE".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!("err".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert!("invalid".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_verbosity() {
        assert_eq!(LogLevel::verbosity(true), LogLevel::Debug);
        assert_eq!(LogLevel::verbosity(false), LogLevel::Trace);
        assert_eq!(log::Level::from(LogLevel::Warning), log::Level::Warn);
    }

    #[test]
    fn test_thread_label() {
        let label = std::thread::Builder::new()
            .name("bikes-worker-0".to_string())
            .spawn(thread_label)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(label, "bikes-worker-0");
    }
}
