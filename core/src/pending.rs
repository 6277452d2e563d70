//! Deadline index for connection-admission timeouts.
//!
//! The admission logic itself (retry policy, backoff) lives in the external
//! protocol-agent layer; this is only the keyed store it shares with the
//! scheduler, so a timeout event's deadline can be mapped back to its
//! retry state.

use crate::time::SimTime;
use std::collections::BTreeMap;

/// Retry state for one pending admission attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingTimeoutEntry {
    pub retries: u32,
    pub established: bool,
}

/// `deadline -> retry state` for in-flight admission attempts.
#[derive(Debug, Default)]
pub struct PendingTimeouts {
    entries: BTreeMap<SimTime, PendingTimeoutEntry>,
}

impl PendingTimeouts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh attempt expiring at `deadline`.
    pub fn register(&mut self, deadline: SimTime) {
        self.entries.insert(deadline, PendingTimeoutEntry::default());
    }

    pub fn get_mut(&mut self, deadline: SimTime) -> Option<&mut PendingTimeoutEntry> {
        self.entries.get_mut(&deadline)
    }

    /// Move an attempt to a new deadline, bumping its retry count.
    pub fn retry(&mut self, deadline: SimTime, next: SimTime) -> Option<&mut PendingTimeoutEntry> {
        let mut entry = self.entries.remove(&deadline)?;
        entry.retries += 1;
        Some(self.entries.entry(next).or_insert(entry))
    }

    /// Remove and return the entry at `deadline` (attempt resolved, either
    /// established or abandoned).
    pub fn resolve(&mut self, deadline: SimTime) -> Option<PendingTimeoutEntry> {
        self.entries.remove(&deadline)
    }

    /// Drain every entry whose deadline is `<= now`.
    pub fn expired(&mut self, now: SimTime) -> Vec<(SimTime, PendingTimeoutEntry)> {
        let mut expired = Vec::new();
        while let Some((deadline, entry)) = self.entries.pop_first() {
            if deadline > now {
                self.entries.insert(deadline, entry);
                break;
            }
            expired.push((deadline, entry));
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
