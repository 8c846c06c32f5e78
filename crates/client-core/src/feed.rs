//! Bounded diagnostic event feed
//!
//! An ordered, append-only buffer of human-readable messages, newest first,
//! capped at a fixed capacity. Pushing never fails; the oldest entry is
//! evicted once the cap is reached.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

/// Default number of entries retained
pub const DEFAULT_FEED_CAPACITY: usize = 100;

/// One diagnostic message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug)]
pub struct EventFeed {
    capacity: usize,
    next_id: AtomicU64,
    entries: Mutex<VecDeque<EventEntry>>,
}

impl EventFeed {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a message at the head of the feed
    pub fn push(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(target: "softphone::feed", "{}", message);

        let entry = EventEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            message,
        };
        let mut entries = self.entries.lock();
        entries.push_front(entry);
        entries.truncate(self.capacity);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Borrow a live view of the feed; iterate it as many times as needed.
    ///
    /// The feed is locked while the view is alive, so keep it short-lived.
    pub fn view(&self) -> FeedView<'_> {
        FeedView {
            entries: self.entries.lock(),
        }
    }

    /// Copy of the current entries, newest first
    pub fn snapshot(&self) -> Vec<EventEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Check whether any retained message contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.entries.lock().iter().any(|e| e.message.contains(needle))
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

/// Read view over the feed, newest first
pub struct FeedView<'a> {
    entries: MutexGuard<'a, VecDeque<EventEntry>>,
}

impl<'a> FeedView<'a> {
    pub fn iter(&self) -> impl Iterator<Item = &EventEntry> + '_ {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&EventEntry> {
        self.entries.front()
    }
}
