use std::collections::VecDeque;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

/// Items completed during this process, most recent first.
///
/// Owned by the observer; only the progress reporter appends to it.
#[derive(Debug, Clone, Default)]
pub struct HistoryTracker {
    entries: VecDeque<HistoryEntry>,
}

impl HistoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>) {
        self.entries.push_front(HistoryEntry {
            name: name.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
