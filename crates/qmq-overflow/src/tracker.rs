//! Ordered index of non-empty channels by ascending first-record offset.
//!
//! The head-minimization pass needs the minimum live offset and a bulk
//! "lower every key by the removed prefix" update; pops need cheap
//! delete-and-reinsert when a channel's first offset advances. Keys are
//! unique by the data-file layout (two channels cannot have a record at the
//! same offset), so a `BTreeMap` with insert-rejects-duplicates is enough.

use std::collections::BTreeMap;

use qmq_error::{QmqError, Result};

/// Unique-key map `first_offset -> channel name`.
#[derive(Debug, Default)]
pub struct FirstOffsetTracker {
    map: BTreeMap<u64, String>,
}

impl FirstOffsetTracker {
    /// Empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a channel's first offset. Duplicate offsets are a consistency
    /// violation and are rejected.
    pub fn insert(&mut self, offset: u64, name: &str) -> Result<()> {
        match self.map.entry(offset) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(name.to_owned());
                Ok(())
            }
            std::collections::btree_map::Entry::Occupied(existing) => Err(QmqError::recovery(
                format!(
                    "channels '{}' and '{name}' share first offset {offset}",
                    existing.get()
                ),
            )),
        }
    }

    /// Stop tracking the entry at `offset`, returning its channel name.
    pub fn remove(&mut self, offset: u64) -> Option<String> {
        self.map.remove(&offset)
    }

    /// Rebind the entry at `offset` to a renamed channel.
    pub fn rename(&mut self, offset: u64, new_name: &str) {
        if let Some(entry) = self.map.get_mut(&offset) {
            new_name.clone_into(entry);
        }
    }

    /// The tracked entry with the smallest first offset.
    #[must_use]
    pub fn min(&self) -> Option<(u64, &str)> {
        self.map
            .iter()
            .next()
            .map(|(offset, name)| (*offset, name.as_str()))
    }

    /// The tracked entry after `offset`, in ascending key order.
    #[must_use]
    pub fn next_after(&self, offset: u64) -> Option<(u64, &str)> {
        self.map
            .range(offset + 1..)
            .next()
            .map(|(off, name)| (*off, name.as_str()))
    }

    /// Ascending iteration over `(first_offset, channel name)`.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> {
        self.map.iter().map(|(offset, name)| (*offset, name.as_str()))
    }

    /// Lower every key by `delta`, preserving order.
    ///
    /// Safe for the same reason the original in-place walk is: subtracting
    /// one constant from keys that were unique and ordered cannot reorder
    /// them or make them collide. Every key must be >= `delta`.
    pub fn shift_down(&mut self, delta: u64) {
        if delta == 0 || self.map.is_empty() {
            return;
        }
        debug_assert!(
            self.map.keys().next().map_or(true, |min| *min >= delta),
            "shift below zero"
        );
        let old = std::mem::take(&mut self.map);
        self.map = old
            .into_iter()
            .map(|(offset, name)| (offset - delta, name))
            .collect();
    }

    /// Number of tracked channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no channel is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.map.clear();
    }
}
