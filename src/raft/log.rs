//! Replicated log with a compaction boundary.
//!
//! Indexes are 1-based. Everything at or below `base_index` has been folded
//! into a snapshot and is no longer held in memory; `base_term` remembers the
//! term of the entry at `base_index` so consistency checks still work there.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Client payload for the state machine.
    Command,
    /// Appended by a new leader to commit entries from earlier terms.
    Noop,
}

/// A single entry in the Raft log.
///
/// `command` is opaque to the consensus engine and may be empty. Only
/// [`EntryKind::Noop`] entries are withheld from the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub kind: EntryKind,
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Command,
            command,
        }
    }

    pub fn noop(term: u64, index: u64) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Noop,
            command: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.kind == EntryKind::Noop
    }
}

/// Log changes not yet written to durable storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogChanges {
    #[default]
    Clean,
    /// Entries from this index on were added, replaced or removed.
    From(u64),
    /// The compaction boundary moved; the retained tail must be rewritten.
    Rewrite,
}

#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    base_index: u64,
    base_term: u64,
    unsynced: LogChanges,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the last entry folded into a snapshot (0 if none).
    pub fn base_index(&self) -> u64 {
        self.base_index
    }

    pub fn base_term(&self) -> u64 {
        self.base_term
    }

    /// Number of entries held in memory.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.base_index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.base_term)
    }

    fn offset(&self, index: u64) -> Option<usize> {
        if index <= self.base_index {
            return None;
        }
        let offset = (index - self.base_index - 1) as usize;
        (offset < self.entries.len()).then_some(offset)
    }

    /// Term of the entry at `index`, including the compaction boundary itself.
    /// `None` for compacted-away or missing indexes.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.base_index {
            return Some(self.base_term);
        }
        self.offset(index).map(|o| self.entries[o].term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        self.offset(index).map(|o| &self.entries[o])
    }

    /// Up to `max` entries starting at `start` (inclusive).
    pub fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        let start = start.max(self.base_index + 1);
        match self.offset(start) {
            Some(o) => self.entries[o..].iter().take(max).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Append a client command at the end of the log and return its index.
    pub fn append(&mut self, term: u64, command: Vec<u8>) -> u64 {
        let index = self.last_index() + 1;
        self.push(LogEntry::new(term, index, command));
        index
    }

    /// Append a leader no-op and return its index.
    pub fn append_noop(&mut self, term: u64) -> u64 {
        let index = self.last_index() + 1;
        self.push(LogEntry::noop(term, index));
        index
    }

    fn push(&mut self, entry: LogEntry) {
        self.mark_changed(entry.index);
        self.entries.push(entry);
    }

    fn mark_changed(&mut self, index: u64) {
        self.unsynced = match self.unsynced {
            LogChanges::Clean => LogChanges::From(index),
            LogChanges::From(from) => LogChanges::From(from.min(index)),
            LogChanges::Rewrite => LogChanges::Rewrite,
        };
    }

    /// What changed since the last [`mark_synced`](Self::mark_synced).
    pub fn unsynced(&self) -> LogChanges {
        self.unsynced
    }

    pub fn mark_synced(&mut self) {
        self.unsynced = LogChanges::Clean;
    }

    /// True if the log holds an entry at `index` with `term`.
    pub fn matches(&self, index: u64, term: u64) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Remove every entry at or after `index`. Compacted entries are never
    /// touched.
    pub fn truncate_from(&mut self, index: u64) {
        let keep = index.saturating_sub(self.base_index + 1) as usize;
        if keep < self.entries.len() {
            self.entries.truncate(keep);
            self.mark_changed(index.max(self.base_index + 1));
        }
    }

    /// Reconcile with a leader's entries that follow `prev_index`.
    ///
    /// Entries already present with the same term are kept; the first entry
    /// whose term differs truncates the local suffix from that point. Returns
    /// the index of the last entry covered by `entries`.
    pub fn merge(&mut self, prev_index: u64, entries: Vec<LogEntry>) -> u64 {
        let last_new = prev_index + entries.len() as u64;
        for entry in entries {
            if entry.index <= self.base_index {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index);
                    self.push(entry);
                }
                None => {
                    debug_assert_eq!(entry.index, self.last_index() + 1);
                    self.push(entry);
                }
            }
        }
        last_new
    }

    /// Fast-backtrack hint for a failed consistency check at `prev_index`:
    /// `(conflict_index, conflict_term)`.
    ///
    /// A missing entry yields `(last_index + 1, 0)`. A term mismatch yields
    /// the first index this log holds for the conflicting term.
    pub fn conflict_hint(&self, prev_index: u64) -> (u64, u64) {
        let Some(term) = self.term_at(prev_index) else {
            return (self.last_index() + 1, 0);
        };
        let mut first = prev_index;
        while first > self.base_index + 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        (first, term)
    }

    /// Last index whose entry carries `term`, searching back to the
    /// compaction boundary.
    pub fn last_index_for_term(&self, term: u64) -> Option<u64> {
        if term == 0 {
            return None;
        }
        self.entries
            .iter()
            .rev()
            .find(|e| e.term == term)
            .map(|e| e.index)
            .or_else(|| (self.base_index > 0 && self.base_term == term).then_some(self.base_index))
    }

    /// Fold every entry up to and including `index` into the compaction
    /// boundary.
    pub fn compact_to(&mut self, index: u64, term: u64) {
        if index <= self.base_index {
            return;
        }
        let drop = ((index - self.base_index) as usize).min(self.entries.len());
        self.entries.drain(..drop);
        self.base_index = index;
        self.base_term = term;
        self.unsynced = LogChanges::Rewrite;
    }

    /// Discard the whole log and restart it after a snapshot boundary.
    pub fn reset_to(&mut self, index: u64, term: u64) {
        self.entries.clear();
        self.base_index = index;
        self.base_term = term;
        self.unsynced = LogChanges::Rewrite;
    }

    /// Rebuild the log at startup from a snapshot boundary and a retained
    /// tail. Entries at or below the boundary are dropped; the remainder must
    /// continue the boundary without gaps and is cut at the first gap.
    pub fn restore(&mut self, base_index: u64, base_term: u64, tail: Vec<LogEntry>) {
        self.reset_to(base_index, base_term);
        for entry in tail.into_iter().filter(|e| e.index > base_index) {
            if entry.index != self.last_index() + 1 {
                tracing::warn!(
                    expected = self.last_index() + 1,
                    found = entry.index,
                    "Gap in retained log tail, discarding remainder"
                );
                break;
            }
            self.entries.push(entry);
        }
    }
}
