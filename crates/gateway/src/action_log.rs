//! Bounded in-memory record of external command invocations.
//!
//! Every buffered CLI call and every closed streaming session appends one
//! entry. The log keeps the most recent `capacity` entries. Successful calls
//! matching a noisy pattern (polling commands such as listings and stats)
//! are skipped so they do not flood the log; their failures are still kept.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ActionLogConfig;

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    /// Unique entry ID.
    pub id: Uuid,
    /// When the invocation finished.
    pub timestamp: DateTime<Utc>,
    /// Full command line.
    pub command: String,
    /// Captured output or failure detail.
    pub output: String,
    /// Whether the invocation failed.
    #[serde(rename = "isError")]
    pub is_error: bool,
}

/// Bounded FIFO of [`ActionLogEntry`] values.
#[derive(Debug)]
pub struct ActionLog {
    entries: Mutex<VecDeque<ActionLogEntry>>,
    capacity: usize,
    noisy_patterns: Vec<String>,
}

impl ActionLog {
    /// Creates an empty log.
    pub fn new(capacity: usize, noisy_patterns: Vec<String>) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            noisy_patterns,
        }
    }

    /// Creates an empty log from configuration.
    pub fn from_config(config: &ActionLogConfig) -> Self {
        Self::new(config.capacity, config.noisy_patterns.clone())
    }

    /// Returns true when a successful run of `command` is not worth keeping.
    pub fn is_noisy(&self, command: &str) -> bool {
        self.noisy_patterns
            .iter()
            .any(|pattern| command.contains(pattern.as_str()))
    }

    /// Appends an entry, evicting the oldest when full.
    ///
    /// Returns the stored entry, or `None` when it was filtered out.
    pub fn record(
        &self,
        command: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Option<ActionLogEntry> {
        let command = command.into();
        if !is_error && self.is_noisy(&command) {
            return None;
        }

        let entry = ActionLogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            command,
            output: output.into(),
            is_error,
        };

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        Some(entry)
    }

    /// Returns all entries, oldest first.
    pub fn entries(&self) -> Vec<ActionLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns true when the log holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the maximum number of retained entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ActionLog {
    fn default() -> Self {
        Self::from_config(&ActionLogConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_and_read() {
        let log = ActionLog::default();
        let entry = log.record("container start web", "web", false).unwrap();

        let entries = log.entries();
        assert_eq!(entries, vec![entry]);
        assert_eq!(entries[0].command, "container start web");
        assert!(!entries[0].is_error);
    }

    #[test]
    fn test_oldest_entries_are_evicted() {
        let log = ActionLog::new(3, Vec::new());
        for i in 0..5 {
            log.record(format!("cmd {i}"), "", false);
        }

        let commands: Vec<_> = log.entries().into_iter().map(|e| e.command).collect();
        assert_eq!(commands, vec!["cmd 2", "cmd 3", "cmd 4"]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_default_capacity_is_one_hundred() {
        let log = ActionLog::default();
        for i in 0..150 {
            log.record(format!("run {i}"), "", false);
        }
        assert_eq!(log.len(), 100);
        assert_eq!(log.entries()[0].command, "run 50");
    }

    #[test]
    fn test_noisy_commands_only_logged_on_error() {
        let log = ActionLog::default();

        assert!(log.record("container ls --all --format json", "[]", false).is_none());
        assert!(log.record("container stats --no-stream", "", false).is_none());
        assert!(log.is_empty());

        let entry = log.record("container image list", "connection refused", true);
        assert!(entry.is_some());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_clear() {
        let log = ActionLog::default();
        log.record("container start web", "", false);
        log.clear();
        assert!(log.is_empty());
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_entry_json_shape() {
        let log = ActionLog::default();
        let entry = log.record("container stop web", "Error: exit status 1", true).unwrap();

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["isError"], true);
        assert_eq!(json["command"], "container stop web");
        assert!(json["timestamp"].is_string());
        assert_eq!(json["id"], entry.id.to_string());
    }

    #[test]
    fn test_concurrent_appends_stay_bounded() {
        let log = Arc::new(ActionLog::new(50, Vec::new()));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        log.record(format!("t{t} {i}"), "", false);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(log.len(), 50);
    }
}
