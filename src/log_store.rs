use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

const MAX_ENTRIES: usize = 600;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Append-only diagnostic trace shown to the user. Oldest entries are evicted
/// once the cap is reached.
#[derive(Clone)]
pub struct LogStore {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_ENTRIES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(MAX_ENTRIES)))),
            capacity: capacity.max(1),
        }
    }

    pub fn add(&self, message: impl Into<String>) {
        self.add_at(message, Utc::now());
    }

    pub fn add_at(&self, message: impl Into<String>, timestamp: DateTime<Utc>) {
        let message = message.into();
        log::info!(target: "gpspinger::diagnostics", "{message}");

        let mut entries = self.lock();
        entries.push_back(LogEntry { timestamp, message });
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lock().iter().any(|entry| entry.message.contains(needle))
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let store = LogStore::with_capacity(3);
        for i in 0..5 {
            store.add(format!("entry {i}"));
        }

        let messages: Vec<_> = store.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["entry 2", "entry 3", "entry 4"]);
    }

    #[test]
    fn default_capacity_is_six_hundred() {
        let store = LogStore::new();
        for i in 0..650 {
            store.add(format!("entry {i}"));
        }
        assert_eq!(store.len(), 600);
        assert_eq!(store.entries()[0].message, "entry 50");
    }

    #[test]
    fn clones_share_entries() {
        let store = LogStore::new();
        let other = store.clone();
        other.add("hello");
        assert!(store.contains("hello"));

        store.clear();
        assert!(other.is_empty());
    }
}
