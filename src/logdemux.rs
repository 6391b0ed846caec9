//! Demultiplexer for the worker's diagnostic byte streams.
//!
//! The worker writes newline-terminated records of the form
//! `LEVEL|domain|message` on stdout and stderr. Reads from those channels
//! arrive at arbitrary byte boundaries, so each channel gets its own
//! demultiplexer instance that carries an incomplete trailing line over to
//! the next feed. A line that does not parse is reported once as a warning
//! and dropped; it never disturbs the engine.

use tracing::{debug, error, info, warn};

/// Worker log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Debug,
    Info,
}

impl LogLevel {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "ERROR" => Some(LogLevel::Error),
            "WARNING" => Some(LogLevel::Warning),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            _ => None,
        }
    }
}

/// One parsed worker log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub domain: String,
    pub message: String,
}

impl LogRecord {
    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim().splitn(3, '|');
        let level = LogLevel::parse(parts.next()?)?;
        let domain = parts.next()?;
        let message = parts.next()?;
        Some(LogRecord {
            level,
            domain: domain.to_string(),
            message: message.to_string(),
        })
    }

    /// Route this record to the severity-matching sink.
    pub fn emit(&self, client: &str) {
        match self.level {
            LogLevel::Error => error!(target: "ioproc::worker", client, domain = %self.domain, "{}", self.message),
            LogLevel::Warning => warn!(target: "ioproc::worker", client, domain = %self.domain, "{}", self.message),
            LogLevel::Debug => debug!(target: "ioproc::worker", client, domain = %self.domain, "{}", self.message),
            LogLevel::Info => info!(target: "ioproc::worker", client, domain = %self.domain, "{}", self.message),
        }
    }
}

/// Splits one diagnostic channel into structured records.
///
/// The partial-line buffer persists only within one worker generation.
pub struct LogDemultiplexer {
    /// Channel name for malformed-line reports ("stdout"/"stderr").
    channel: &'static str,
    partial: Vec<u8>,
}

impl LogDemultiplexer {
    pub fn new(channel: &'static str) -> Self {
        Self {
            channel,
            partial: Vec::new(),
        }
    }

    /// Split raw bytes into complete records, retaining any trailing
    /// unterminated line for the next call.
    pub fn feed(&mut self, data: &[u8]) -> Vec<LogRecord> {
        let mut buf = std::mem::take(&mut self.partial);
        buf.extend_from_slice(data);

        let mut records = Vec::new();
        let mut rest = &buf[..];
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let line = &rest[..pos];
            rest = &rest[pos + 1..];

            let text = String::from_utf8_lossy(line);
            match LogRecord::parse(&text) {
                Some(record) => records.push(record),
                None => {
                    if !text.trim().is_empty() {
                        warn!(
                            channel = self.channel,
                            line = %text,
                            "invalid worker log line"
                        );
                    }
                }
            }
        }

        self.partial = rest.to_vec();
        records
    }

    /// Bytes of an incomplete trailing line currently buffered.
    pub fn buffered(&self) -> usize {
        self.partial.len()
    }
}
