use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Information,
    Success,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Information => write!(f, "Information"),
            Severity::Success => write!(f, "Success"),
            Severity::Warning => write!(f, "Warning"),
            Severity::Error => write!(f, "Error"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Local>,
    pub severity: Severity,
    pub source: String,
    pub message: String,
}

/// Append-only sink for user-visible status messages.
pub trait ActivityLog: Send + Sync {
    fn record(&self, severity: Severity, source: &str, message: &str);

    fn info(&self, source: &str, message: &str) {
        self.record(Severity::Information, source, message);
    }

    fn success(&self, source: &str, message: &str) {
        self.record(Severity::Success, source, message);
    }

    fn warning(&self, source: &str, message: &str) {
        self.record(Severity::Warning, source, message);
    }

    fn error(&self, source: &str, message: &str) {
        self.record(Severity::Error, source, message);
    }
}

/// Forwards activity to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActivityLog;

impl ActivityLog for TracingActivityLog {
    fn record(&self, severity: Severity, source: &str, message: &str) {
        match severity {
            Severity::Information | Severity::Success => {
                tracing::info!(source, severity = %severity, "{}", message)
            }
            Severity::Warning => tracing::warn!(source, "{}", message),
            Severity::Error => tracing::error!(source, "{}", message),
        }
    }
}

/// Keeps the most recent entries in memory for display.
pub struct MemoryActivityLog {
    capacity: usize,
    entries: Mutex<VecDeque<ActivityEntry>>,
}

impl MemoryActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl ActivityLog for MemoryActivityLog {
    fn record(&self, severity: Severity, source: &str, message: &str) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(ActivityEntry {
            timestamp: Local::now(),
            severity,
            source: source.to_string(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_log_drops_oldest_when_full() {
        let log = MemoryActivityLog::new(2);
        log.info("Test", "one");
        log.warning("Test", "two");
        log.error("Test", "three");

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "two");
        assert_eq!(entries[1].severity, Severity::Error);
    }
}
