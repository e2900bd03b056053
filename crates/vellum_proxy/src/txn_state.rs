//! Local mirror of the replicated transaction-state store.
//!
//! The store holds system metadata (shard map, lock flag, server tags,
//! backup ranges) and is only ever modified by metadata mutations flowing
//! through the commit pipeline. Durability is delegated to the log: every
//! commit produces a message bundle that the pipeline pushes under the txs
//! tag, and the log may discard bundles once `pop` advances past them.
//!
//! Mutation application and reads are synchronous under one lock that is
//! never held across a suspension point, so readers never observe a partial
//! metadata batch.

use std::collections::{BTreeMap, VecDeque};

use vellum_core::messages::encode_mutation;
use vellum_core::types::{Key, KeyRange, Mutation, Version, INVALID_VERSION};

/// The log messages generated by one store commit.
#[derive(Clone, Debug)]
pub struct CommitMessage {
    pub messages: Vec<Vec<u8>>,
    /// Version up to which earlier store messages may be popped from the log
    /// once this commit is durable.
    pub pop_to: Version,
}

#[derive(Debug)]
pub struct TxnStateStore {
    data: BTreeMap<Key, Vec<u8>>,
    /// Version the next commit's messages will be attributed to.
    next_version: Version,
    /// Encoded mutations accumulated since the last commit.
    pending: Vec<Vec<u8>>,
    /// Commits handed out but not yet acknowledged by the pipeline.
    unacknowledged: usize,
}

impl TxnStateStore {
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
            next_version: INVALID_VERSION,
            pending: Vec::new(),
            unacknowledged: 0,
        }
    }

    pub fn read_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(key).cloned()
    }

    /// Entries in `range`, ascending, up to `limit` if given.
    pub fn read_range(&self, range: &KeyRange, limit: Option<usize>) -> Vec<(Key, Vec<u8>)> {
        let iter = self
            .data
            .range(range.begin.clone()..range.end.clone())
            .map(|(k, v)| (k.clone(), v.clone()));
        match limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    pub fn set(&mut self, key: Key, value: Vec<u8>) {
        self.pending.push(encode_mutation(&Mutation::Set {
            key: key.clone(),
            value: value.clone(),
        }));
        self.data.insert(key, value);
    }

    pub fn clear(&mut self, range: &KeyRange) {
        self.pending.push(encode_mutation(&Mutation::ClearRange {
            begin: range.begin.clone(),
            end: range.end.clone(),
        }));
        let doomed: Vec<Key> = self
            .data
            .range(range.begin.clone()..range.end.clone())
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.data.remove(&key);
        }
    }

    /// Load one snapshot entry without generating a log message. Used while
    /// ingesting the recovery broadcast, whose content is already durable.
    pub fn load(&mut self, key: Key, value: Vec<u8>) {
        self.data.insert(key, value);
    }

    /// Version stamped onto the next commit's messages.
    pub fn set_next_version(&mut self, version: Version) {
        self.next_version = version;
    }

    /// Cut a commit: take the pending messages and remember that an
    /// acknowledgement is owed before further pops are safe.
    pub fn commit(&mut self) -> CommitMessage {
        self.unacknowledged += 1;
        CommitMessage {
            messages: std::mem::take(&mut self.pending),
            pop_to: self.next_version,
        }
    }

    pub fn acknowledge(&mut self) {
        debug_assert!(self.unacknowledged > 0);
        self.unacknowledged = self.unacknowledged.saturating_sub(1);
    }

    pub fn unacknowledged(&self) -> usize {
        self.unacknowledged
    }

    /// Drop messages recorded while replaying already-durable state.
    pub fn resync_log(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for TxnStateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded record of `(commit version, pop-to version)` pairs awaiting the
/// remote log's durability floor.
#[derive(Debug, Default)]
pub struct TxsPopState {
    pub versions: VecDeque<(Version, Version)>,
    pub last_pop: Version,
    pub pop_remote: bool,
}

impl TxsPopState {
    /// Record a new pop candidate, shedding the oldest entry at the history
    /// cap.
    pub fn record(&mut self, commit_version: Version, pop_to: Version, cap: usize) {
        let newest = self
            .versions
            .back()
            .map(|(_, pop)| *pop)
            .unwrap_or(self.last_pop);
        if pop_to <= newest {
            return;
        }
        if self.versions.len() >= cap {
            tracing::warn!("discarding txs pop history");
            self.versions.pop_front();
        }
        self.versions.push_back((commit_version, pop_to));
    }

    /// Pop-to versions whose commit version the remote logs have made
    /// durable.
    pub fn drain_durable(&mut self, durable: Version) -> Vec<Version> {
        let mut out = Vec::new();
        while let Some((commit_version, pop_to)) = self.versions.front().copied() {
            if commit_version > durable {
                break;
            }
            self.last_pop = pop_to;
            out.push(pop_to);
            self.versions.pop_front();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_generate_messages() {
        let mut store = TxnStateStore::new();
        store.set_next_version(10);
        store.set(b"a".to_vec(), b"1".to_vec());
        store.set(b"b".to_vec(), b"2".to_vec());
        store.clear(&KeyRange::new(b"a".to_vec(), b"b".to_vec()));

        assert_eq!(store.read_value(b"a"), None);
        assert_eq!(store.read_value(b"b"), Some(b"2".to_vec()));

        let msg = store.commit();
        assert_eq!(msg.messages.len(), 3);
        assert_eq!(msg.pop_to, 10);
        assert_eq!(store.unacknowledged(), 1);
        store.acknowledge();
        assert_eq!(store.unacknowledged(), 0);

        // The next commit starts empty.
        assert!(store.commit().messages.is_empty());
    }

    #[test]
    fn load_is_silent_and_resync_discards() {
        let mut store = TxnStateStore::new();
        store.load(b"a".to_vec(), b"1".to_vec());
        assert!(store.commit().messages.is_empty());

        store.set(b"b".to_vec(), b"2".to_vec());
        store.resync_log();
        assert!(store.commit().messages.is_empty());
        assert_eq!(store.read_value(b"b"), Some(b"2".to_vec()));
    }

    #[test]
    fn read_range_honors_limit() {
        let mut store = TxnStateStore::new();
        for key in [b"a", b"b", b"c"] {
            store.load(key.to_vec(), b"v".to_vec());
        }
        let range = KeyRange::new(b"a".to_vec(), b"z".to_vec());
        assert_eq!(store.read_range(&range, Some(2)).len(), 2);
        assert_eq!(store.read_range(&range, None).len(), 3);
    }

    #[test]
    fn pop_history_is_bounded_and_ordered() {
        let mut pops = TxsPopState::default();
        for i in 0..5 {
            pops.record(i * 10, i * 10 + 5, 3);
        }
        assert_eq!(pops.versions.len(), 3);

        // Stale pop-to values are ignored.
        pops.record(100, 0, 3);
        assert_eq!(pops.versions.len(), 3);

        let drained = pops.drain_durable(30);
        assert_eq!(drained, vec![25, 35]);
        assert_eq!(pops.last_pop, 35);
    }
}
