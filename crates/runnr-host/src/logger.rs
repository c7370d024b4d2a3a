//! Guest logging.
//!
//! Guests log through `log_msg`, which resolves to the [`LoggerCapability`]
//! of the running job. The default [`TracingLogger`] turns each message into a
//! `tracing` event tagged with the FFI identifier and request id.

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use runnr_common::CapabilityError;

use crate::config::LoggerConfig;

/// Log level of a guest message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Level from the code passed to `log_msg`: 1 error, 2 warn, 4 debug, anything else info.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Error,
            2 => Self::Warn,
            4 => Self::Debug,
            _ => Self::Info,
        }
    }
}

/// Where a guest message came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogScope {
    /// FFI identifier of the calling instance.
    pub ident: i32,
    /// Id of the bound request, if any.
    pub request_id: Option<String>,
}

impl LogScope {
    pub fn new(ident: i32) -> Self {
        Self {
            ident,
            request_id: None,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Logging capability.
pub trait LoggerCapability: Send + Sync {
    /// Record a message.
    fn log(&self, level: LogLevel, message: &str, scope: &LogScope) -> Result<(), CapabilityError>;

    fn error(&self, message: &str, scope: &LogScope) -> Result<(), CapabilityError> {
        self.log(LogLevel::Error, message, scope)
    }

    fn warn(&self, message: &str, scope: &LogScope) -> Result<(), CapabilityError> {
        self.log(LogLevel::Warn, message, scope)
    }

    fn info(&self, message: &str, scope: &LogScope) -> Result<(), CapabilityError> {
        self.log(LogLevel::Info, message, scope)
    }

    fn debug(&self, message: &str, scope: &LogScope) -> Result<(), CapabilityError> {
        self.log(LogLevel::Debug, message, scope)
    }
}

/// Logger that emits guest messages as `tracing` events.
#[derive(Debug, Clone, Default)]
pub struct TracingLogger {
    config: LoggerConfig,
}

impl TracingLogger {
    pub fn new(config: LoggerConfig) -> Self {
        Self { config }
    }
}

impl LoggerCapability for TracingLogger {
    fn log(&self, level: LogLevel, message: &str, scope: &LogScope) -> Result<(), CapabilityError> {
        if !self.config.enabled {
            return Err(CapabilityError::NotEnabled {
                capability: "logger",
            });
        }

        let ident = scope.ident;
        let request_id = scope.request_id.as_deref().unwrap_or_default();
        match level {
            LogLevel::Error => error!(ident, request_id, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(ident, request_id, guest_log = true, "{}", message),
            LogLevel::Info => info!(ident, request_id, guest_log = true, "{}", message),
            LogLevel::Debug => debug!(ident, request_id, guest_log = true, "{}", message),
        }

        Ok(())
    }
}

/// One message captured by a [`RecordingLogger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub scope: LogScope,
}

/// Logger that keeps every message in memory.
///
/// Useful for asserting on guest output in tests and for embedding hosts
/// that forward logs somewhere other than `tracing`.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    records: Mutex<Vec<LogRecord>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the captured messages.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Messages only, in arrival order.
    pub fn messages(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .map(|r| r.message.clone())
            .collect()
    }
}

impl LoggerCapability for RecordingLogger {
    fn log(&self, level: LogLevel, message: &str, scope: &LogScope) -> Result<(), CapabilityError> {
        self.records.lock().push(LogRecord {
            level,
            message: message.to_string(),
            scope: scope.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_code() {
        assert_eq!(LogLevel::from_code(1), LogLevel::Error);
        assert_eq!(LogLevel::from_code(2), LogLevel::Warn);
        assert_eq!(LogLevel::from_code(3), LogLevel::Info);
        assert_eq!(LogLevel::from_code(4), LogLevel::Debug);
        assert_eq!(LogLevel::from_code(0), LogLevel::Info);
        assert_eq!(LogLevel::from_code(99), LogLevel::Info);
    }

    #[test]
    fn test_recording_logger_keeps_order() {
        let logger = RecordingLogger::new();
        let scope = LogScope::new(7).with_request_id("r1");

        logger.info("hello", &scope).unwrap();
        logger.error("world", &scope).unwrap();

        let records = logger.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, LogLevel::Info);
        assert_eq!(records[1].level, LogLevel::Error);
        assert_eq!(records[1].scope.request_id.as_deref(), Some("r1"));
        assert_eq!(logger.messages(), vec!["hello", "world"]);
    }

    #[test]
    fn test_disabled_tracing_logger() {
        let logger = TracingLogger::new(LoggerConfig { enabled: false });
        let err = logger.info("nope", &LogScope::new(1)).unwrap_err();
        assert_eq!(err.sentinel(), -1);

        let logger = TracingLogger::default();
        assert!(logger.warn("yes", &LogScope::new(1)).is_ok());
    }
}
