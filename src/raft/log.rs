//! In-memory raft log and quorum arithmetic

use super::{Entry, LogIndex, Term};
use std::collections::VecDeque;

/// Log suffix after the last snapshot
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: VecDeque<Entry>,
    snapshot_index: LogIndex,
    snapshot_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries
            .back()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    /// Term of the entry at `index`; `None` when unknown or compacted away
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: LogIndex) -> Option<&Entry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Append a new entry at the tail (leader path)
    pub fn append(&mut self, term: Term, command: Vec<u8>) -> LogIndex {
        let index = self.last_index() + 1;
        self.entries.push_back(Entry {
            term,
            index,
            command,
        });
        index
    }

    /// Up to `max` entries starting at `start`
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Vec<Entry> {
        if start <= self.snapshot_index {
            return Vec::new();
        }
        let offset = (start - self.snapshot_index - 1) as usize;
        self.entries.iter().skip(offset).take(max).cloned().collect()
    }

    /// Whether our log contains an entry at `index` with `term`
    ///
    /// Indexes below the snapshot are committed and therefore match.
    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        if index < self.snapshot_index {
            return true;
        }
        self.term_at(index) == Some(term)
    }

    /// Merge entries received from the leader (follower path)
    ///
    /// Conflicting suffixes are truncated; entries already present are kept.
    pub fn merge(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            if entry.index <= self.snapshot_index {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index);
                    self.entries.push_back(entry);
                }
                None => {
                    if entry.index == self.last_index() + 1 {
                        self.entries.push_back(entry);
                    }
                }
            }
        }
    }

    fn truncate_from(&mut self, index: LogIndex) {
        let keep = (index - self.snapshot_index - 1) as usize;
        self.entries.truncate(keep);
    }

    /// Drop entries up to and including `index`
    pub fn compact(&mut self, index: LogIndex) {
        if index <= self.snapshot_index || index > self.last_index() {
            return;
        }
        let term = self.term_at(index).unwrap_or(self.snapshot_term);
        let drop = (index - self.snapshot_index) as usize;
        self.entries.drain(..drop);
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Adopt a leader snapshot, keeping any suffix that agrees with it
    pub fn install_snapshot(&mut self, index: LogIndex, term: Term) {
        if index <= self.snapshot_index {
            return;
        }
        if self.term_at(index) == Some(term) {
            self.compact(index);
        } else {
            self.entries.clear();
            self.snapshot_index = index;
            self.snapshot_term = term;
        }
    }

    /// Entries retained since the last snapshot
    pub fn uncompacted_len(&self) -> u64 {
        self.entries.len() as u64
    }
}

/// Votes or acknowledgements needed out of `members`
pub fn majority(members: usize) -> usize {
    members / 2 + 1
}

/// Highest index replicated on a majority, counting the leader's own log
pub fn quorum_commit_index(
    leader_last: LogIndex,
    follower_matches: impl IntoIterator<Item = LogIndex>,
    members: usize,
) -> LogIndex {
    let mut indexes: Vec<LogIndex> = std::iter::once(leader_last)
        .chain(follower_matches)
        .collect();
    let needed = majority(members);
    if indexes.len() < needed {
        return 0;
    }
    indexes.sort_unstable_by(|a, b| b.cmp(a));
    indexes[needed - 1]
}

/// A follower is caught up when its lag is within `threshold`
pub fn is_caught_up(leader_last: LogIndex, match_index: LogIndex, threshold: u64) -> bool {
    leader_last.saturating_sub(match_index) <= threshold
}
