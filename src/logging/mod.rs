use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::config::LoggingConfig;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    pub fn from_config_value(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "verbose" | "trace" => Some(Self::Verbose),
            _ => None,
        }
    }

    fn label(self, colored: bool) -> &'static str {
        match (self, colored) {
            (Self::Error, false) => "ERROR",
            (Self::Warn, false) => "WARN",
            (Self::Info, false) => "INFO",
            (Self::Debug, false) => "DEBUG",
            (Self::Verbose, false) => "VERBOSE",
            (Self::Error, true) => "\x1b[31mERROR\x1b[0m",
            (Self::Warn, true) => "\x1b[33mWARN\x1b[0m",
            (Self::Info, true) => "\x1b[32mINFO\x1b[0m",
            (Self::Debug, true) => "\x1b[36mDEBUG\x1b[0m",
            (Self::Verbose, true) => "\x1b[35mVERBOSE\x1b[0m",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label(false))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum LoggingError {
    InvalidLevel { value: String },
    InvalidStream { value: String },
}

impl fmt::Display for LoggingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLevel { value } => write!(
                f,
                "invalid logging.level '{value}'. Allowed values: error, warn, info, debug, verbose"
            ),
            Self::InvalidStream { value } => write!(
                f,
                "invalid logging.stream '{value}'. Allowed values: stdout, stderr"
            ),
        }
    }
}

impl std::error::Error for LoggingError {}

#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    pub human_friendly: bool,
    pub stream: LogStream,
}

impl LoggerConfig {
    pub fn from_logging_config(config: &LoggingConfig) -> Result<Self, LoggingError> {
        let min_level =
            LogLevel::from_config_value(&config.level).ok_or_else(|| LoggingError::InvalidLevel {
                value: config.level.clone(),
            })?;
        let stream = LogStream::parse(&config.stream).ok_or_else(|| LoggingError::InvalidStream {
            value: config.stream.clone(),
        })?;
        Ok(Self {
            min_level,
            human_friendly: config.human_friendly,
            stream,
        })
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Debug,
            human_friendly: false,
            stream: LogStream::Stdout,
        }
    }
}

pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Writes whole lines to stdout or stderr; each line takes the stream lock
/// so concurrent connection threads never interleave.
pub struct StreamSink {
    stream: LogStream,
}

impl LogSink for StreamSink {
    fn write_line(&self, line: &str) {
        let _ = match self.stream {
            LogStream::Stdout => writeln!(io::stdout().lock(), "{line}"),
            LogStream::Stderr => writeln!(io::stderr().lock(), "{line}"),
        };
    }
}

pub struct Logger {
    config: LoggerConfig,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        let sink = Arc::new(StreamSink {
            stream: config.stream,
        });
        Self::with_sink(config, sink)
    }

    pub fn with_sink(config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self { config, sink }
    }

    /// Lets hot paths skip building payloads nobody will see.
    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.config.min_level
    }

    pub fn error(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Error, context, message, None);
    }

    pub fn warn(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Warn, context, message, None);
    }

    pub fn info(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Info, context, message, None);
    }

    pub fn log(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<Value>,
    ) {
        if !self.enabled(level) {
            return;
        }

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut line = format!(
            "{timestamp} [{}]",
            level.label(self.config.human_friendly)
        );
        if let Some(context) = context.filter(|context| !context.is_empty()) {
            line.push_str(&format!(" [{context}]"));
        }
        line.push(' ');
        line.push_str(message);
        if let Some(payload) = payload {
            line.push_str(&format!(" payload={payload}"));
        }
        self.sink.write_line(&line);
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("config", &self.config)
            .field("sink", &"<dyn LogSink>")
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn quiet_logger() -> Arc<Logger> {
    Arc::new(Logger::new(LoggerConfig {
        min_level: LogLevel::Error,
        ..LoggerConfig::default()
    }))
}

/// Sink keeping every line in memory for assertions.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemorySink {
    lines: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl MemorySink {
    pub(crate) fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .expect("memory sink mutex should not be poisoned")
            .clone()
    }
}

#[cfg(test)]
impl LogSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.lines
            .lock()
            .expect("memory sink mutex should not be poisoned")
            .push(line.to_owned());
    }
}

#[cfg(test)]
pub(crate) fn capturing_logger(min_level: LogLevel) -> (Arc<Logger>, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::default());
    let logger = Logger::with_sink(
        LoggerConfig {
            min_level,
            ..LoggerConfig::default()
        },
        sink.clone(),
    );
    (Arc::new(logger), sink)
}
