// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Pluggable services for the engine. Logging is the only one:
//! tests print, long-running consumers hand records to slog.

use core::fmt;
use core::fmt::Display;

/// Where the engine sends its log lines.
pub trait LogProvider: Send + Sync {
    fn log(&self, level: LogLevel, msg: &str);
}

/// Severity of a log line. Providers map these onto their own levels.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Note,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Note => "note",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

/// Writes each line to stdout.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrintlnLog;

impl LogProvider for PrintlnLog {
    fn log(&self, level: LogLevel, msg: &str) {
        println!("klips {level}: {msg}");
    }
}

cfg_if! {
    if #[cfg(feature = "std")] {
        use slog::Drain;

        /// A [`LogProvider`] backed by an `slog` logger.
        pub struct SlogLog {
            log: slog::Logger,
        }

        impl SlogLog {
            pub fn new(log: slog::Logger) -> Self {
                Self { log }
            }

            /// Log to the terminal through an asynchronous drain.
            pub fn term() -> Self {
                let decorator = slog_term::TermDecorator::new().build();
                let drain = slog_term::FullFormat::new(decorator).build().fuse();
                let drain = slog_async::Async::new(drain).build().fuse();
                Self { log: slog::Logger::root(drain, slog::o!("unit" => "klips")) }
            }
        }

        impl LogProvider for SlogLog {
            fn log(&self, level: LogLevel, msg: &str) {
                match level {
                    LogLevel::Note => slog::info!(self.log, "{}", msg),
                    LogLevel::Warn => slog::warn!(self.log, "{}", msg),
                    LogLevel::Error => slog::error!(self.log, "{}", msg),
                }
            }
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod test {
    use super::*;

    #[test]
    fn slog_discard() {
        let log = SlogLog::new(slog::Logger::root(slog::Discard, slog::o!()));
        log.log(LogLevel::Warn, "nobody hears this");
        assert_eq!(LogLevel::Error.to_string(), "error");
        assert!(LogLevel::Note < LogLevel::Warn);
    }
}
