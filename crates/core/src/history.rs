//! Bounded rolling history of recent events, newest first

use std::collections::VecDeque;

/// Fixed-capacity sequence that keeps only the most recent entries
///
/// Entries are ordered newest first; pushing beyond capacity evicts the
/// oldest entry.
#[derive(Debug, Clone)]
pub struct RollingHistory<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> RollingHistory<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Prepend an entry, evicting the oldest when full
    pub fn push(&mut self, entry: T) {
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
    }

    /// Prepend an entry after removing any existing entry with an equal key
    pub fn push_dedup_by<K, F>(&mut self, entry: T, key: F)
    where
        K: PartialEq,
        F: Fn(&T) -> K,
    {
        let incoming = key(&entry);
        self.entries.retain(|existing| key(existing) != incoming);
        self.push(entry);
    }

    /// Most recent entry, if any
    pub fn latest(&self) -> Option<&T> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate newest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

impl<T: Clone> RollingHistory<T> {
    /// Clone out the entries, newest first
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}
