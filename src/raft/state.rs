use super::log::{Command, Entry, Index};

use std::collections::HashMap;

/// The application state that the log replicates. Committed entries are
/// applied in index order, exactly once; reads must not observe unapplied
/// writes. Send, so a server can run its node on a dedicated thread.
pub trait State: Send {
    /// Returns the index of the last applied entry, or 0 if none.
    fn applied_index(&self) -> Index;

    /// Applies a committed entry. The index must follow the applied index.
    /// No-op and sentinel entries advance the applied index without mutating
    /// anything.
    fn apply(&mut self, index: Index, entry: &Entry);

    /// Reads the value of a key. Unknown keys read as the empty string.
    fn read(&self, key: &str) -> String;
}

/// The key/value store replicated by the cluster.
pub struct KvStore {
    applied_index: Index,
    data: HashMap<String, String>,
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    pub fn new() -> Self {
        Self { applied_index: 0, data: HashMap::new() }
    }
}

impl State for KvStore {
    fn applied_index(&self) -> Index {
        self.applied_index
    }

    fn apply(&mut self, index: Index, entry: &Entry) {
        assert_eq!(index, self.applied_index + 1, "applying entry {index} out of order");
        if let Some(Command::Put { key, value, .. }) = &entry.command {
            self.data.insert(key.clone(), value.clone());
        }
        self.applied_index = index;
    }

    fn read(&self, key: &str) -> String {
        self.data.get(key).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::message::ReplicaId;

    fn put(key: &str, value: &str) -> Entry {
        Entry {
            term: 1,
            command: Some(Command::Put {
                src: ReplicaId::from(0xaa),
                mid: "m-1".into(),
                key: key.into(),
                value: value.into(),
            }),
        }
    }

    #[test]
    fn applies_puts_in_order() {
        let mut state = KvStore::new();
        assert_eq!(state.applied_index(), 0);

        state.apply(1, &put("a", "1"));
        state.apply(2, &put("a", "2"));
        state.apply(3, &put("b", "3"));
        assert_eq!(state.applied_index(), 3);
        assert_eq!(state.read("a"), "2");
        assert_eq!(state.read("b"), "3");
    }

    #[test]
    fn unknown_keys_read_empty() {
        assert_eq!(KvStore::new().read("nope"), "");
    }

    #[test]
    fn noop_advances_without_mutating() {
        let mut state = KvStore::new();
        state.apply(1, &Entry { term: 1, command: Some(Command::NoOp) });
        assert_eq!(state.applied_index(), 1);
        assert_eq!(state.read(""), "");
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn apply_gap_panics() {
        KvStore::new().apply(2, &put("a", "1"));
    }
}
