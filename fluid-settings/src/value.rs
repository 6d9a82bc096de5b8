//! The records stored for one named setting.
//!
//! A value set holds at most one record per priority. Writes at an
//! occupied priority resolve last-writer-wins on the timestamp, with ties
//! keeping the record already stored. Applying the same stream of writes
//! in any order therefore converges to the same set.

use fluid_settings_model::{Priority, Timestamp};
use std::collections::BTreeMap;

/// Outcome of a store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetResult {
    /// First record ever stored for this name.
    New,
    /// First record at this priority (the name already had others).
    NewPriority,
    /// Same priority, newer timestamp, different value.
    Changed,
    /// Same priority, newer timestamp, same value.
    Newer,
    /// Older or equal timestamp; the stored record is kept.
    Unchanged,
    /// The value failed validation or the timestamp is below the floor.
    Error,
    /// The name is not declared in the schema.
    Unknown,
}

impl SetResult {
    /// Whether the store content changed.
    pub fn mutated(self) -> bool {
        matches!(
            self,
            SetResult::New | SetResult::NewPriority | SetResult::Changed | SetResult::Newer
        )
    }

    /// The `reason` string reported in `UPDATED` replies.
    pub fn reason(self) -> &'static str {
        match self {
            SetResult::New => "new",
            SetResult::NewPriority => "new priority",
            SetResult::Changed => "changed",
            SetResult::Newer => "newer",
            SetResult::Unchanged => "unchanged",
            SetResult::Error => "error",
            SetResult::Unknown => "unknown",
        }
    }
}

/// One stored value at some priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub timestamp: Timestamp,
    pub value: String,
}

/// All records stored for one name, keyed by priority.
#[derive(Debug, Clone, Default)]
pub struct ValueSet {
    records: BTreeMap<Priority, Record>,
}

impl ValueSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, applying last-writer-wins at the priority.
    pub fn insert(&mut self, priority: Priority, timestamp: Timestamp, value: String) -> SetResult {
        let had_any = !self.records.is_empty();
        match self.records.get_mut(&priority) {
            None => {
                self.records.insert(priority, Record { timestamp, value });
                if had_any {
                    SetResult::NewPriority
                } else {
                    SetResult::New
                }
            }
            Some(existing) => {
                if timestamp <= existing.timestamp {
                    SetResult::Unchanged
                } else if existing.value == value {
                    existing.timestamp = timestamp;
                    SetResult::Newer
                } else {
                    *existing = Record { timestamp, value };
                    SetResult::Changed
                }
            }
        }
    }

    /// Remove the record at a priority. Returns whether one existed.
    pub fn remove(&mut self, priority: Priority) -> bool {
        self.records.remove(&priority).is_some()
    }

    /// The record with the largest priority.
    pub fn highest(&self) -> Option<&Record> {
        self.records.values().next_back()
    }

    pub fn at(&self, priority: Priority) -> Option<&Record> {
        self.records.get(&priority)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Records in priority order.
    pub fn iter(&self) -> impl Iterator<Item = (Priority, &Record)> {
        self.records.iter().map(|(p, r)| (*p, r))
    }
}
