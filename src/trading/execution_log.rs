//! Bounded, newest-first execution log shown to the operator.

use std::collections::VecDeque;

use chrono::{DateTime, Local};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// `[HH:MM:SS] text`
    pub message: String,
    pub severity: Severity,
    pub at: DateTime<Local>,
}

impl LogEntry {
    pub fn new(text: impl AsRef<str>, severity: Severity) -> Self {
        let at = Local::now();
        Self {
            message: format!("[{}] {}", at.format("%H:%M:%S"), text.as_ref()),
            severity,
            at,
        }
    }
}

/// Ring buffer of log entries. Index 0 is the newest.
#[derive(Debug, Clone)]
pub struct ExecutionLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl ExecutionLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, text: impl AsRef<str>, severity: Severity) {
        self.entries.push_front(LogEntry::new(text, severity));
        self.entries.truncate(self.capacity);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_first_and_bounded() {
        let mut log = ExecutionLog::new(10);
        for i in 0..12 {
            log.push(format!("entry {}", i), Severity::Info);
        }

        let entries = log.entries();
        assert_eq!(entries.len(), 10);
        assert!(entries[0].message.ends_with("entry 11"));
        assert!(entries[9].message.ends_with("entry 2"));
    }

    #[test]
    fn test_entry_has_clock_prefix() {
        let entry = LogEntry::new("SIGNAL: test", Severity::Success);
        let bytes = entry.message.as_bytes();
        assert_eq!(bytes[0], b'[');
        assert_eq!(bytes[9], b']');
        assert_eq!(&entry.message[10..], " SIGNAL: test");
    }
}
