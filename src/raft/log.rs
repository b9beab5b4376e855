use super::message::{ReplicaId, RequestId};
use crate::errdata;
use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};

/// A log index. The log is 1-indexed; index 0 is the sentinel entry.
pub type Index = u64;

/// A leader term.
pub type Term = u64;

/// A log entry. The command is a client write, a no-op inserted by leaders to
/// confirm their leadership, or absent for the index-0 sentinel (which is
/// never transmitted or applied).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireEntry", try_from = "WireEntry")]
pub struct Entry {
    /// The term in which the entry was proposed.
    pub term: Term,
    /// The replicated command, if any.
    pub command: Option<Command>,
}

/// A replicated command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Does nothing when applied. Leaders append one when a read arrives with
    /// nothing else in flight, so the next commit confirms their leadership.
    NoOp,
    /// Writes a value, and identifies the client waiting for the commit.
    Put { src: ReplicaId, mid: RequestId, key: String, value: String },
}

/// The wire representation of an entry: `{term, command, src?, MID?, key?,
/// value?}` with the command fields inlined and absent when unused.
#[derive(Serialize, Deserialize)]
struct WireEntry {
    term: Term,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    src: Option<ReplicaId>,
    #[serde(rename = "MID", default, skip_serializing_if = "Option::is_none")]
    mid: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

impl From<Entry> for WireEntry {
    fn from(entry: Entry) -> Self {
        let mut wire = WireEntry {
            term: entry.term,
            command: None,
            src: None,
            mid: None,
            key: None,
            value: None,
        };
        match entry.command {
            None => {}
            Some(Command::NoOp) => wire.command = Some("NO_OP".to_string()),
            Some(Command::Put { src, mid, key, value }) => {
                wire.command = Some("put".to_string());
                wire.src = Some(src);
                wire.mid = Some(mid);
                wire.key = Some(key);
                wire.value = Some(value);
            }
        }
        wire
    }
}

impl TryFrom<WireEntry> for Entry {
    type Error = Error;

    fn try_from(wire: WireEntry) -> Result<Self> {
        let command = match wire.command.as_deref() {
            None => None,
            Some("NO_OP") => Some(Command::NoOp),
            Some("put") => {
                let missing = || Error::InvalidData("incomplete put entry".to_string());
                Some(Command::Put {
                    src: wire.src.ok_or_else(missing)?,
                    mid: wire.mid.ok_or_else(missing)?,
                    key: wire.key.ok_or_else(missing)?,
                    value: wire.value.ok_or_else(missing)?,
                })
            }
            Some(command) => return errdata!("unknown entry command {command}"),
        };
        Ok(Entry { term: wire.term, command })
    }
}

/// The replicated log: an ordered sequence of entries, 1-indexed, preceded by
/// a sentinel at index 0 with term 0 and no command. The current term and
/// vote are kept with the log, since they share its persistence semantics
/// (in-memory here, but they survive all state transitions).
///
/// Invariants:
///
/// * The sentinel is never modified, transmitted, or applied.
/// * Entry terms never decrease with the index.
/// * Entry terms are at or below the current term.
/// * The commit index never decreases, and never exceeds the last index.
/// * Committed entries are never truncated.
pub struct Log {
    /// All entries, including the sentinel at index 0.
    entries: Vec<Entry>,
    /// The current term.
    term: Term,
    /// Who we voted for in the current term, if anyone.
    vote: Option<ReplicaId>,
    /// The index of the last committed entry.
    commit_index: Index,
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl Log {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self {
            entries: vec![Entry { term: 0, command: None }],
            term: 0,
            vote: None,
            commit_index: 0,
        }
    }

    /// The current term (0 before any election) and who holds our vote in it.
    pub fn get_term(&self) -> (Term, Option<ReplicaId>) {
        (self.term, self.vote)
    }

    /// Records a new term and, optionally, the vote cast in it. Terms only
    /// move forward, and a term's vote is final once cast.
    pub fn set_term(&mut self, term: Term, vote: Option<ReplicaId>) {
        assert!(term > 0, "term 0 is reserved for the sentinel");
        assert!(term >= self.term, "term {term} is behind current {}", self.term);
        assert!(
            term > self.term || self.vote.is_none() || vote == self.vote,
            "vote already cast in term {term}"
        );
        self.term = term;
        self.vote = vote;
    }

    /// Returns the index of the last entry (0 when only the sentinel exists).
    pub fn last_index(&self) -> Index {
        self.entries.len() as Index - 1
    }

    /// Returns the term of the last entry.
    pub fn last_term(&self) -> Term {
        self.entries.last().expect("log without sentinel").term
    }

    /// Returns the commit index.
    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// Moves the commit marker forward to the given index, which must exist.
    pub fn commit(&mut self, index: Index) {
        assert!(index <= self.last_index(), "commit index {index} beyond log");
        assert!(index >= self.commit_index, "commit index {index} below {}", self.commit_index);
        self.commit_index = index;
    }

    /// Looks up the entry stored at an index.
    pub fn entry(&self, index: Index) -> Option<&Entry> {
        self.entries.get(index as usize)
    }

    /// Checks whether the log matches the given index and term, i.e. whether
    /// an append whose previous entry is index@term would connect.
    pub fn prefix_matches(&self, index: Index, term: Term) -> bool {
        index == 0 || self.entry(index).map(|e| e.term == term).unwrap_or(false)
    }

    /// Returns the lowest index whose entry has the same term as the entry at
    /// the given index, or the last index when the given index is beyond the
    /// log. Used as a conflict hint in append_entries failure replies.
    pub fn first_index_of_term_at(&self, index: Index) -> Index {
        if index > self.last_index() {
            return self.last_index();
        }
        let term = self.entries[index as usize].term;
        let mut first = index;
        while first > 0 && self.entries[first as usize - 1].term == term {
            first -= 1;
        }
        first
    }

    /// Adds an entry holding the given command, stamped with the current
    /// term, and returns its index.
    pub fn append(&mut self, command: Command) -> Index {
        assert!(self.term > 0, "appending requires a term above 0");
        self.entries.push(Entry { term: self.term, command: Some(command) });
        self.last_index()
    }

    /// Appends replicated entries in order.
    pub fn append_many(&mut self, entries: &[Entry]) {
        for entry in entries {
            assert!(entry.term > 0, "can't append sentinel entries");
            assert!(entry.term >= self.last_term(), "appended entries lower the term");
            assert!(entry.term <= self.term, "appended entry from future term {}", entry.term);
            self.entries.push(entry.clone());
        }
    }

    /// Removes all entries at or above the given index. Must not remove
    /// committed entries.
    pub fn truncate_from(&mut self, index: Index) {
        assert!(index > 0, "can't truncate the sentinel");
        assert!(index > self.commit_index, "truncating committed entry {index}");
        self.entries.truncate(index as usize);
    }

    /// Splices replicated entries into the log following the given base
    /// index. Entries already in the log are skipped (a matching index and
    /// term implies a matching command); on the first conflict the old tail
    /// is truncated and the remaining entries appended.
    pub fn splice(&mut self, prev_index: Index, entries: &[Entry]) {
        let mut last_match = prev_index;
        let mut entries = entries;
        while let (Some(next), Some(existing)) = (entries.first(), self.entry(last_match + 1)) {
            if existing.term != next.term {
                break;
            }
            debug_assert_eq!(existing, next, "diverging command at matched index {}", last_match + 1);
            last_match += 1;
            entries = &entries[1..];
        }
        if entries.is_empty() {
            return;
        }
        if last_match < self.last_index() {
            self.truncate_from(last_match + 1);
        }
        self.append_many(entries);
    }

    /// Returns up to max entries starting at the given index, for
    /// append_entries batches.
    pub fn range(&self, from: Index, max: usize) -> Vec<Entry> {
        assert!(from > 0, "can't replicate the sentinel");
        if from > self.last_index() {
            return Vec::new();
        }
        let to = std::cmp::min(self.last_index() + 1, from + max as Index);
        self.entries[from as usize..to as usize].to_vec()
    }

    /// Checks whether a committed entry carries the given client request ID,
    /// for idempotent write replays.
    pub fn has_committed(&self, mid: &str) -> bool {
        self.entries[1..=self.commit_index as usize]
            .iter()
            .any(|e| matches!(&e.command, Some(Command::Put { mid: m, .. }) if m == mid))
    }
}
