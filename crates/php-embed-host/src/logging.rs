//! Log sink for script log output.
//!
//! The runtime writes its log (`error_log()`, warnings, fatal errors) as text
//! lines such as `PHP Warning:  Division by zero`. [`LogSink`] splits that
//! text into lines, derives a [`LogLevel`] from the severity prefix and
//! stores one [`LogEntry`] per line. Every entry is also emitted via
//! `tracing`.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

/// Severity of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A log line captured from a script.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    /// Message without the severity prefix.
    pub message: String,
    pub timestamp: Instant,
}

/// Severity prefixes written by the runtime.
const PREFIXES: &[(&str, LogLevel)] = &[
    ("PHP Fatal error:", LogLevel::Error),
    ("PHP Parse error:", LogLevel::Error),
    ("PHP Recoverable fatal error:", LogLevel::Error),
    ("PHP Warning:", LogLevel::Warn),
    ("PHP Deprecated:", LogLevel::Warn),
    ("PHP Notice:", LogLevel::Info),
    ("PHP Strict Standards:", LogLevel::Debug),
];

/// Derive the level of a log line and strip its severity prefix.
///
/// Lines without a known prefix are [`LogLevel::Info`].
pub fn parse_line(line: &str) -> (LogLevel, &str) {
    let line = line.trim();
    for (prefix, level) in PREFIXES {
        if let Some(message) = line.strip_prefix(prefix) {
            return (*level, message.trim());
        }
    }
    (LogLevel::Info, line)
}

#[derive(Debug, Default)]
struct SinkState {
    pending: Vec<u8>,
    entries: Vec<LogEntry>,
}

/// Write sink that captures script log output.
///
/// Clones share the same entries, so a host keeps one clone and attaches
/// another to the context.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    label: Arc<str>,
    state: Arc<Mutex<SinkState>>,
}

impl LogSink {
    /// Create a sink. `label` is attached to every emitted record.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Arc::from(label.into()),
            state: Arc::default(),
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.state.lock().entries.clone()
    }

    /// Captured messages, in order.
    pub fn messages(&self) -> Vec<String> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|entry| entry.message.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    fn record(&self, entries: &mut Vec<LogEntry>, line: &str) {
        let (level, message) = parse_line(line);
        if message.is_empty() {
            return;
        }

        let label = &*self.label;
        match level {
            LogLevel::Debug => debug!(label, script_log = true, "{}", message),
            LogLevel::Info => info!(label, script_log = true, "{}", message),
            LogLevel::Warn => warn!(label, script_log = true, "{}", message),
            LogLevel::Error => error!(label, script_log = true, "{}", message),
        }

        entries.push(LogEntry {
            level,
            message: message.to_string(),
            timestamp: Instant::now(),
        });
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.pending.extend_from_slice(buf);

        while let Some(end) = state.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = state.pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            self.record(&mut state.entries, &line);
        }
        Ok(buf.len())
    }

    /// Record a trailing line that has no newline yet.
    fn flush(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            return Ok(());
        }
        let line = std::mem::take(&mut state.pending);
        let line = String::from_utf8_lossy(&line);
        self.record(&mut state.entries, &line);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse_line("PHP Warning:  Division by zero in Command line code on line 1\n"),
            (LogLevel::Warn, "Division by zero in Command line code on line 1")
        );
        assert_eq!(
            parse_line("PHP Fatal error:  Uncaught Exception: boom"),
            (LogLevel::Error, "Uncaught Exception: boom")
        );
        assert_eq!(parse_line("PHP Notice:  Undefined index"), (LogLevel::Info, "Undefined index"));
        assert_eq!(parse_line("Testing"), (LogLevel::Info, "Testing"));
    }

    #[test]
    fn test_sink_splits_lines() {
        let sink = LogSink::new("test-123");
        let mut writer = sink.clone();

        writer.write_all(b"Hello\nPHP Warning:  careful\npart").unwrap();
        assert_eq!(sink.len(), 2);

        writer.write_all(b"ial\n").unwrap();
        assert_eq!(sink.messages(), vec!["Hello", "careful", "partial"]);

        let entries = sink.entries();
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[1].level, LogLevel::Warn);
    }

    #[test]
    fn test_flush_records_trailing_text() {
        let sink = LogSink::new("test");
        let mut writer = sink.clone();

        writer.write_all(b"PHP Fatal error:  boom").unwrap();
        assert!(sink.is_empty());

        writer.flush().unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.entries()[0].level, LogLevel::Error);
    }

    #[test]
    fn test_blank_lines_skipped() {
        let sink = LogSink::new("test");
        let mut writer = sink.clone();

        writer.write_all(b"\n\n  \n").unwrap();

        assert!(sink.is_empty());
    }
}
