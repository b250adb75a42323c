//! In-memory view of the replicated log
//!
//! Entries below the last snapshot are compacted away; `entries[i]` always
//! holds index `snapshot_index + 1 + i`.

use crate::raft::message::LogEntry;

#[derive(Debug, Default)]
pub struct RaftLog {
    snapshot_index: u64,
    snapshot_term: u64,
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted parts. Entries must be contiguous after the snapshot.
    pub fn from_parts(snapshot_index: u64, snapshot_term: u64, entries: Vec<LogEntry>) -> Self {
        let entries = entries
            .into_iter()
            .skip_while(|e| e.index <= snapshot_index)
            .collect();
        Self {
            snapshot_index,
            snapshot_term,
            entries,
        }
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    fn offset(&self, index: u64) -> Option<usize> {
        if index <= self.snapshot_index {
            return None;
        }
        let pos = (index - self.snapshot_index - 1) as usize;
        (pos < self.entries.len()).then_some(pos)
    }

    /// Term of the entry at `index`; `None` if compacted past or beyond the end
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.offset(index).map(|pos| self.entries[pos].term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        self.offset(index).map(|pos| &self.entries[pos])
    }

    /// Up to `max` entries starting at `start`
    pub fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        match self.offset(start) {
            Some(pos) => self.entries[pos..].iter().take(max).cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Drop every entry at or after `index`, returning them
    pub fn truncate_from(&mut self, index: u64) -> Vec<LogEntry> {
        match self.offset(index) {
            Some(pos) => self.entries.split_off(pos),
            None => Vec::new(),
        }
    }

    /// Forget entries up to and including `index` after a snapshot
    pub fn compact_to(&mut self, index: u64, term: u64) {
        if index <= self.snapshot_index {
            return;
        }
        let keep_from = match self.offset(index) {
            Some(pos) => pos + 1,
            None => self.entries.len(),
        };
        self.entries.drain(..keep_from);
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Replace the whole log with an installed snapshot
    pub fn reset_to_snapshot(&mut self, index: u64, term: u64) {
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Is a log ending at (`last_index`, `last_term`) at least as up to date as ours?
    pub fn is_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        let our_term = self.last_term();
        last_term > our_term || (last_term == our_term && last_index >= self.last_index())
    }

    /// First index of the term containing `index`, used to skip a whole
    /// conflicting term in one round trip
    pub fn first_index_of_term(&self, index: u64) -> u64 {
        let Some(term) = self.term_at(index) else {
            return index;
        };
        let mut first = index;
        while first > self.snapshot_index + 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }
}
