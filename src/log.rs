//! The replicated log: an append-only, densely-indexed sequence of
//! `(index, term, command)` entries.
//!
//! `Log` itself only maintains the in-memory invariants (dense 1-based
//! indices, non-decreasing terms, no mutation of already-appended entries
//! except via `truncate_after`). Making an append or truncation durable
//! before a dependent RPC reply is the caller's responsibility (see
//! `node::RaftNode`), which is why `Log` does not hold a `Persistence`
//! handle itself — the two are separate ports in this design.

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

/// A single entry in the replicated log.
///
/// Immutable once appended; a follower may still drop it from its own log
/// tail during conflict resolution (`Log::truncate_after`), but existing
/// entries are never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// 1-based, strictly monotonic, dense: `log[i].index == i`.
    pub index: u64,
    /// Term in which the leader that created this entry was elected.
    pub term: u64,
    /// Opaque to Raft; decoded only by the state machine after commit.
    pub command: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Rebuilds a log from a durable snapshot (e.g. on restart). Does not
    /// re-validate contiguity of the supplied entries — the persistence
    /// layer that produced them is assumed to have upheld the invariant.
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Index of the last entry, or 0 if the log is empty.
    pub fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    /// Term of the last entry, or 0 if the log is empty.
    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at `index`, or `None` if `index` is 0 or beyond
    /// the log.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return None;
        }
        self.entry_at(index).map(|e| e.term)
    }

    pub fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Appends `entries`, which must form a contiguous run starting at
    /// `last_index() + 1` with non-decreasing terms.
    pub fn append(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        if first.index != self.last_index() + 1 {
            return Err(RaftError::LogInconsistent);
        }
        let mut prev_term = self.last_term();
        for (offset, entry) in entries.iter().enumerate() {
            if entry.index != first.index + offset as u64 {
                return Err(RaftError::LogInconsistent);
            }
            if entry.term < prev_term {
                return Err(RaftError::LogInconsistent);
            }
            prev_term = entry.term;
        }
        self.entries.extend(entries);
        Ok(())
    }

    /// Appends a single entry at the current term, convenience wrapper
    /// used by the leader when proposing a new command.
    pub fn append_one(&mut self, term: u64, command: Vec<u8>) -> LogEntry {
        let entry = LogEntry { index: self.last_index() + 1, term, command };
        self.entries.push(entry.clone());
        entry
    }

    /// Drops all entries with index > `index`. Refuses to truncate below
    /// `commit_index`: committed entries must never be removed.
    pub fn truncate_after(&mut self, index: u64, commit_index: u64) -> Result<()> {
        if index < commit_index {
            return Err(RaftError::LogUnderflow);
        }
        self.entries.truncate(index as usize);
        Ok(())
    }

    /// Returns up to `max_count` entries starting at `from_index`,
    /// inclusive. Used to build AppendEntries batches.
    pub fn slice(&self, from_index: u64, max_count: usize) -> Vec<LogEntry> {
        if from_index == 0 || from_index > self.last_index() {
            return Vec::new();
        }
        let start = (from_index - 1) as usize;
        self.entries[start..].iter().take(max_count).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry { index, term, command: Vec::new() }
    }

    #[test]
    fn empty_log_reports_zero() {
        let log = Log::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), None);
        assert_eq!(log.term_at(1), None);
    }

    #[test]
    fn append_requires_contiguous_indices() {
        let mut log = Log::new();
        log.append(vec![entry(1, 1)]).unwrap();
        assert!(log.append(vec![entry(3, 1)]).is_err());
        log.append(vec![entry(2, 1)]).unwrap();
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn truncate_after_rejects_below_commit_index() {
        let mut log = Log::new();
        log.append(vec![entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();
        assert!(matches!(
            log.truncate_after(1, 2),
            Err(RaftError::LogUnderflow)
        ));
        log.truncate_after(2, 2).unwrap();
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn slice_returns_fewer_when_log_is_short() {
        let mut log = Log::new();
        log.append(vec![entry(1, 1), entry(2, 1)]).unwrap();
        assert_eq!(log.slice(1, 10).len(), 2);
        assert_eq!(log.slice(2, 10).len(), 1);
        assert_eq!(log.slice(3, 10).len(), 0);
    }

    #[test]
    fn conflict_truncation_matches_scenario_five() {
        // Follower log [(1,1),(2,1),(3,2)], commit_index=1.
        let mut log = Log::new();
        log.append(vec![entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();

        // Leader sends entries (3,3,d),(4,3,e) after prev_log_index=2.
        // Term conflict at index 3: truncate to 2, then append.
        log.truncate_after(2, 1).unwrap();
        log.append(vec![entry(3, 3), entry(4, 3)]).unwrap();

        assert_eq!(log.last_index(), 4);
        assert_eq!(log.term_at(3), Some(3));
        assert_eq!(log.term_at(4), Some(3));
    }
}
