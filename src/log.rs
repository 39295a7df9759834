//! Logging sink with error, warning and info streams.
//!
//! Every message identifies its source (a file name, or empty for the
//! linker itself) and prints as a single line. Warnings accumulate and
//! processing continues; errors are returned as values and abort the
//! current operation.

use std::io::{self, Write};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warning,
    Info,
}

/// Destination for log lines. Implementations must not fail; logging is
/// best-effort.
pub trait LogSink {
    fn write(&mut self, level: Level, source: &str, message: &str);
}

/// Writes errors and warnings to stderr and info lines to stdout.
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write(&mut self, level: Level, source: &str, message: &str) {
        let prefix = match level {
            Level::Error => "error: ",
            Level::Warning => "warning: ",
            Level::Info => "",
        };
        let line = if source.is_empty() {
            format!("{}{}", prefix, message)
        } else {
            format!("{}: {}{}", source, prefix, message)
        };
        match level {
            Level::Info => { let _ = writeln!(io::stdout(), "{}", line); }
            _ => { let _ = writeln!(io::stderr(), "{}", line); }
        }
    }
}

/// Collects log lines in memory; used by tests.
#[derive(Default)]
pub struct MemorySink {
    pub lines: Vec<(Level, String, String)>,
}

impl LogSink for MemorySink {
    fn write(&mut self, level: Level, source: &str, message: &str) {
        self.lines.push((level, source.to_string(), message.to_string()));
    }
}

/// Handle passed through the linker. Owns its sink.
pub struct Logger {
    sink: Box<dyn LogSink>,
    warnings: usize,
}

impl Logger {
    pub fn new(sink: Box<dyn LogSink>) -> Self {
        Self { sink, warnings: 0 }
    }

    pub fn stderr() -> Self {
        Self::new(Box::new(StderrSink))
    }

    /// Logs an error and hands it back, so call sites can write
    /// `return Err(logger.error("", err))`.
    pub fn error(&mut self, source: &str, err: Error) -> Error {
        self.sink.write(Level::Error, source, &err.to_string());
        err
    }

    pub fn warning(&mut self, source: &str, message: &str) {
        self.warnings += 1;
        self.sink.write(Level::Warning, source, message);
    }

    pub fn info(&mut self, source: &str, message: &str) {
        self.sink.write(Level::Info, source, message);
    }

    pub fn warning_count(&self) -> usize {
        self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_count() {
        let mut logger = Logger::new(Box::new(MemorySink::default()));
        assert_eq!(logger.warning_count(), 0);
        logger.warning("a.obj", "something dubious");
        logger.info("", "progress");
        logger.warning("", "again");
        assert_eq!(logger.warning_count(), 2);
    }

    #[test]
    fn test_error_returns_value() {
        let mut logger = Logger::new(Box::new(MemorySink::default()));
        let err = logger.error("x.obj", Error::UnknownInput { file: "x.obj".into() });
        match err {
            Error::UnknownInput { file } => assert_eq!(file, "x.obj"),
            other => panic!("{:?}", other),
        }
    }
}
