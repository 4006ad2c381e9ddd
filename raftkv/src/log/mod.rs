//! The in-memory replicated log (§4.1): ordered entries, derived stats,
//! compaction, and continuity validation on append.

use std::collections::VecDeque;

use crate::command::Command;
use crate::command::Index;
use crate::command::LogEntry;
use crate::command::Term;
use crate::error::ContinuityError;
use crate::store::Applied;
use crate::store::PersistentStore;

/// Derived, always-consistent statistics about a `Log` (§3).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogStats {
    pub first_index: Index,
    pub last_index: Index,
    pub last_term: Term,
    pub committed_index: Index,
    pub last_applied_index: Index,
    pub last_applied_term: Term,
}

/// The ordered sequence of `LogEntry`, with a bounded in-memory retention
/// window above `last_applied_index` (§4.1).
pub struct Log {
    entries: VecDeque<LogEntry>,
    first_index: Index,
    last_index: Index,
    last_term: Term,
    committed_index: Index,
    last_applied_index: Index,
    last_applied_term: Term,
    max_log_retention: u64,
}

impl Log {
    pub fn new(max_log_retention: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            first_index: 1,
            last_index: 0,
            last_term: 0,
            committed_index: 0,
            last_applied_index: 0,
            last_applied_term: 0,
            max_log_retention,
        }
    }

    /// Rebuild a `Log` from what `PersistentStore::load` returned at
    /// startup. `last_applied_index`/`last_applied_term` are seeded from the
    /// entries themselves: everything on disk was, by construction,
    /// previously committed (§4.2 invariant).
    pub fn from_loaded(entries: Vec<LogEntry>, max_log_retention: u64) -> Self {
        let mut log = Self::new(max_log_retention);
        if let Some(first) = entries.first() {
            log.first_index = first.index;
        }
        if let Some(last) = entries.last() {
            log.last_index = last.index;
            log.last_term = last.term;
            log.last_applied_index = last.index;
            log.last_applied_term = last.term;
            log.committed_index = last.index;
        }
        log.entries = entries.into();
        log
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            first_index: self.first_index,
            last_index: self.last_index,
            last_term: self.last_term,
            committed_index: self.committed_index,
            last_applied_index: self.last_applied_index,
            last_applied_term: self.last_applied_term,
        }
    }

    pub fn last_index(&self) -> Index {
        self.last_index
    }

    pub fn last_term(&self) -> Term {
        self.last_term
    }

    pub fn committed_index(&self) -> Index {
        self.committed_index
    }

    pub fn last_applied_index(&self) -> Index {
        self.last_applied_index
    }

    pub fn last_applied_term(&self) -> Term {
        self.last_applied_term
    }

    /// O(1) lookup via `index - first_index`.
    pub fn at_index(&self, index: Index) -> Option<&LogEntry> {
        if self.entries.is_empty() || index < self.first_index || index > self.last_index {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }

    /// Entries in `[from, last_index]`, used by the replicator to build an
    /// `AppendEntries` batch. Returns `None` if `from` has already fallen
    /// out of the retention window — the caller should switch to snapshot
    /// streaming (§4.5).
    pub fn entries_from(&self, from: Index, limit: usize) -> Option<Vec<LogEntry>> {
        if from > self.last_index + 1 {
            return None;
        }
        if from <= self.last_index && (self.entries.is_empty() || from < self.first_index) {
            return None;
        }
        Some(
            (from..=self.last_index)
                .filter_map(|i| self.at_index(i).cloned())
                .take(limit)
                .collect(),
        )
    }

    /// Linear scan from the tail for the last index carrying `term`.
    /// Undefined (returns `None`) once that term's entries have fallen out
    /// of the retention window.
    pub fn last_index_for_term(&self, term: Term) -> Option<Index> {
        for e in self.entries.iter().rev() {
            if e.term == term {
                return Some(e.index);
            }
            if e.term < term {
                return None;
            }
        }
        None
    }

    /// Appends under `term`, returning the new entry's index (§4.1).
    pub fn push(&mut self, term: Term, command: Command) -> Index {
        let index = self.last_index + 1;
        let entry = LogEntry { index, term, command };
        if self.entries.is_empty() {
            self.first_index = index;
        }
        self.entries.push_back(entry);
        self.last_index = index;
        self.last_term = term;
        self.compact();
        index
    }

    fn continuity_error_at(&self, conflicting_term: Term) -> ContinuityError {
        ContinuityError {
            next_log_index: self.last_index_for_term(conflicting_term).unwrap_or(0),
        }
    }

    /// The follower-side append (§4.1, §4.3 step 3). Rejects with
    /// `ContinuityError` if `prev_index`/`prev_term` don't match the local
    /// log, or if a supplied entry conflicts with one already applied.
    /// `leader_term` is the term carried on the enclosing `AppendEntries`
    /// message, used to reject entries claiming to originate from a future
    /// term relative to the leader sending them.
    pub fn append_after(
        &mut self,
        prev_index: Index,
        prev_term: Term,
        leader_term: Term,
        entries: Vec<LogEntry>,
    ) -> Result<(), ContinuityError> {
        if prev_index > 0 {
            if prev_index < self.last_applied_index {
                return Err(self.continuity_error_at(prev_term));
            }
            match self.at_index(prev_index) {
                Some(local) => {
                    if local.term != prev_term {
                        return Err(self.continuity_error_at(local.term));
                    }
                }
                None => {
                    // Empty in-memory log after a snapshot install: the
                    // only thing we can check continuity against is our own
                    // stats (§4.1: "if the follower's log is empty but its
                    // lastIndex > 0 ... continuity is checked against
                    // (lastIndex, lastTerm) alone").
                    if prev_index != self.last_index || prev_term != self.last_term {
                        return Err(self.continuity_error_at(self.last_term));
                    }
                }
            }
        }

        let mut expected_index = prev_index + 1;
        let mut floor_term = prev_term;
        for e in &entries {
            if e.index != expected_index {
                return Err(self.continuity_error_at(floor_term));
            }
            if e.term < floor_term || e.term > leader_term {
                return Err(self.continuity_error_at(floor_term));
            }
            floor_term = e.term;
            expected_index += 1;
        }

        for e in entries {
            if e.index <= self.last_applied_index {
                match self.at_index(e.index) {
                    Some(local) if local.term == e.term && local.command == e.command => continue,
                    _ => return Err(self.continuity_error_at(e.term)),
                }
            }
            if let Some(local) = self.at_index(e.index) {
                if local.term == e.term {
                    // Already present and matching: idempotent no-op (§8
                    // Idempotence law).
                    continue;
                }
                self.truncate_from(e.index);
            }
            if self.entries.is_empty() {
                self.first_index = e.index;
            }
            self.entries.push_back(e.clone());
            self.last_index = e.index;
            self.last_term = e.term;
        }

        self.compact();
        Ok(())
    }

    fn truncate_from(&mut self, index: Index) {
        while let Some(back) = self.entries.back() {
            if back.index >= index {
                self.entries.pop_back();
            } else {
                break;
            }
        }
        match self.entries.back() {
            Some(back) => {
                self.last_index = back.index;
                self.last_term = back.term;
            }
            None => {
                self.last_index = index.saturating_sub(1);
                self.last_term = self.last_applied_term;
                self.first_index = index;
            }
        }
    }

    /// Applies entries `(committed_index, to_index]` via `store`, then
    /// advances `last_applied_index`/`last_applied_term` and
    /// `committed_index`. At-most-once: an older `to_index` is a no-op.
    /// Returns the index/outcome of every entry actually applied, so `Node`
    /// can react to `Applied::Topology` entries.
    pub async fn commit(
        &mut self,
        to_index: Index,
        store: &dyn PersistentStore,
    ) -> Result<Vec<(Index, Applied)>, crate::error::StorageError> {
        if to_index <= self.committed_index {
            return Ok(Vec::new());
        }
        let to_index = to_index.min(self.last_index);
        let from = self.last_applied_index + 1;

        let mut to_apply = Vec::new();
        if from <= to_index {
            for i in from..=to_index {
                if let Some(e) = self.at_index(i) {
                    to_apply.push(e.clone());
                }
            }
        }

        let applied = if to_apply.is_empty() {
            Vec::new()
        } else {
            store.apply_committed_commands(&to_apply).await?
        };

        if let Some(last) = to_apply.last() {
            self.last_applied_index = last.index;
            self.last_applied_term = last.term;
        }
        self.committed_index = to_index.max(self.committed_index);
        self.compact();

        Ok(to_apply.iter().map(|e| e.index).zip(applied).collect())
    }

    /// Retains `[max(1, last_index + 1 - max_log_retention), last_index]`,
    /// never dropping an entry that is not yet strictly below
    /// `last_applied_index` (§4.1, §3).
    pub fn compact(&mut self) {
        let cutoff = if self.last_index + 1 > self.max_log_retention {
            self.last_index + 1 - self.max_log_retention
        } else {
            1
        };
        while let Some(front) = self.entries.front() {
            if front.index < cutoff && front.index < self.last_applied_index {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        self.first_index = self.entries.front().map(|e| e.index).unwrap_or(self.last_applied_index + 1);
    }

    /// Replace this log wholesale with the post-snapshot marker
    /// `(last_index, last_term)` (§4.5: "on `done` restarts its log").
    pub fn reset_after_snapshot(&mut self, last_index: Index, last_term: Term) {
        self.entries.clear();
        self.first_index = last_index + 1;
        self.last_index = last_index;
        self.last_term = last_term;
        self.committed_index = last_index;
        self.last_applied_index = last_index;
        self.last_applied_term = last_term;
    }

    pub fn entries_not_yet_in_storage(&self, already_stored_up_to: Index) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.index > already_stored_up_to)
            .cloned()
            .collect()
    }

    /// Iterate the entries currently held in memory, in index order. Used
    /// by `Node`'s persistence bookkeeping to diff against what's already
    /// on disk (§4.2).
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    fn put(k: &str) -> Command {
        Command::Put {
            key: k.to_string(),
            value: vec![1],
        }
    }

    #[test]
    fn push_assigns_dense_indices() {
        let mut log = Log::new(100);
        assert_eq!(log.push(1, put("a")), 1);
        assert_eq!(log.push(1, put("b")), 2);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 1);
    }

    #[test]
    fn at_index_out_of_range_is_none() {
        let mut log = Log::new(100);
        log.push(1, put("a"));
        assert!(log.at_index(0).is_none());
        assert!(log.at_index(2).is_none());
        assert!(log.at_index(1).is_some());
    }

    #[test]
    fn append_after_empty_prefix_marker() {
        let mut log = Log::new(100);
        let entries = vec![LogEntry {
            index: 1,
            term: 1,
            command: put("a"),
        }];
        log.append_after(0, 0, 1, entries).unwrap();
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn append_after_rejects_gap() {
        let mut log = Log::new(100);
        let entries = vec![LogEntry {
            index: 5,
            term: 1,
            command: put("a"),
        }];
        assert!(log.append_after(0, 0, 1, entries).is_err());
    }

    #[test]
    fn append_after_truncates_conflicting_suffix() {
        let mut log = Log::new(100);
        log.push(1, put("a"));
        log.push(1, put("b"));
        log.push(1, put("c"));
        // Leader in term 2 overwrites index 2 onward.
        let entries = vec![
            LogEntry {
                index: 2,
                term: 2,
                command: put("x"),
            },
            LogEntry {
                index: 3,
                term: 2,
                command: put("y"),
            },
        ];
        log.append_after(1, 1, 2, entries).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.at_index(2).unwrap().term, 2);
    }

    #[test]
    fn append_after_duplicate_is_idempotent() {
        let mut log = Log::new(100);
        log.push(1, put("a"));
        let snapshot_entry = log.at_index(1).unwrap().clone();
        log.append_after(0, 0, 1, vec![snapshot_entry]).unwrap();
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.at_index(1).unwrap().command, put("a"));
    }

    #[test]
    fn append_after_matches_post_snapshot_stats_with_empty_log() {
        let mut log = Log::new(100);
        log.reset_after_snapshot(10, 3);
        let entries = vec![LogEntry {
            index: 11,
            term: 3,
            command: put("a"),
        }];
        log.append_after(10, 3, 3, entries).unwrap();
        assert_eq!(log.last_index(), 11);
    }

    #[tokio::test]
    async fn commit_is_at_most_once() {
        let store = crate::store::test_support::TestStore::default();
        let mut log = Log::new(100);
        log.push(1, put("a"));
        log.push(1, put("b"));
        let applied = log.commit(2, &store).await.unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(log.committed_index(), 2);
        assert_eq!(log.last_applied_index(), 2);

        // Committing an older index is a no-op.
        let applied_again = log.commit(1, &store).await.unwrap();
        assert!(applied_again.is_empty());
        assert_eq!(log.committed_index(), 2);
    }

    #[test]
    fn compact_retains_window_above_last_applied() {
        let mut log = Log::new(10);
        for i in 0..30u64 {
            log.push(1, put(&format!("{i:03}")));
        }
        // Nothing applied yet: compaction must not drop anything.
        assert_eq!(log.stats().first_index, 1);
    }

    #[tokio::test]
    async fn compact_keeps_retention_window_after_apply() {
        let store = crate::store::test_support::TestStore::default();
        let mut log = Log::new(10);
        for i in 0..30u64 {
            log.push(1, put(&format!("{i:03}")));
        }
        log.commit(30, &store).await.unwrap();
        assert_eq!(log.stats().last_index - log.stats().first_index + 1, 10);
    }

    #[test]
    fn compact_is_idempotent() {
        let mut log = Log::new(5);
        for i in 0..10u64 {
            log.push(1, put(&format!("{i}")));
        }
        log.last_applied_index = log.last_index;
        log.compact();
        let after_first = log.stats();
        log.compact();
        assert_eq!(log.stats(), after_first);
    }
}
