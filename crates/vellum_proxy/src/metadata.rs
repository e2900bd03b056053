//! Routing state and metadata-mutation application.
//!
//! Metadata mutations are the sole writers of the transaction-state store
//! and the routing maps derived from it. They arrive from two directions:
//! this server's own committed transactions (which also emit log messages),
//! and other servers' effects reported back by the resolvers (store-only,
//! their owner pushes the messages).

use std::collections::{BTreeSet, HashMap, VecDeque};

use vellum_core::keys;
use vellum_core::messages::StorageServerInterface;
use vellum_core::rangemap::RangeMap;
use vellum_core::types::{Key, KeyRange, Mutation, Tag, Version};

use crate::push::LogPushData;
use crate::txn_state::TxnStateStore;

/// Cached identity of one storage server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageInfo {
    pub tag: Tag,
    pub interf: StorageServerInterface,
}

/// Value of one key-info range: the storage-server sets responsible for it
/// and the derived tag list. `tags` empties whenever a server tag changes
/// and is repopulated lazily.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerCacheInfo {
    pub tags: Vec<Tag>,
    pub src: Vec<u64>,
    pub dest: Vec<u64>,
}

/// The maps that route mutations, reads and resolution requests.
#[derive(Debug)]
pub struct RoutingState {
    pub key_info: RangeMap<ServerCacheInfo>,
    pub cache_info: RangeMap<bool>,
    /// Per range, the history of `(version, resolver index)` owners, newest
    /// last.
    pub key_resolvers: RangeMap<VecDeque<(Version, usize)>>,
    pub backup_keys: RangeMap<BTreeSet<Key>>,
    pub storage_cache: HashMap<u64, StorageInfo>,
}

impl RoutingState {
    pub fn new() -> Self {
        let mut key_resolvers = RangeMap::new(VecDeque::new());
        key_resolvers.modify(&keys::all_keys(), |_, history| history.push_back((0, 0)));
        Self {
            key_info: RangeMap::new(ServerCacheInfo::default()),
            cache_info: RangeMap::new(false),
            key_resolvers,
            backup_keys: RangeMap::new(BTreeSet::new()),
            storage_cache: HashMap::new(),
        }
    }

    fn tags_for(&self, info: &ServerCacheInfo) -> Vec<Tag> {
        let mut tags: Vec<Tag> = info
            .src
            .iter()
            .chain(info.dest.iter())
            .filter_map(|id| self.storage_cache.get(id).map(|s| s.tag))
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }

    /// Tags for the shard containing `key`, repopulating the cached list if
    /// a server-tag change emptied it.
    pub fn tags_for_key(&mut self, key: &[u8]) -> Vec<Tag> {
        let (range, info) = self.key_info.range_containing(key);
        if !info.tags.is_empty() {
            return info.tags.clone();
        }
        let populated = self.tags_for(info);
        let tags = populated.clone();
        self.key_info.modify(&range, |_, value| value.tags = populated.clone());
        tags
    }

    /// Populate and return the tag list for a specific range entry.
    pub fn populate_tags(&mut self, range: &KeyRange, info: &ServerCacheInfo) -> Vec<Tag> {
        if !info.tags.is_empty() {
            return info.tags.clone();
        }
        let populated = self.tags_for(info);
        let tags = populated.clone();
        self.key_info.modify(range, |_, value| value.tags = populated.clone());
        tags
    }

    pub fn needs_cache_tag(&self, range: &KeyRange) -> bool {
        self.cache_info
            .intersecting_ranges(range)
            .iter()
            .any(|(_, cached)| **cached)
    }

    /// A server tag changed: every derived tag list is stale. Empty them all
    /// and let lookups repopulate on demand rather than walking the whole
    /// map eagerly.
    pub fn invalidate_tag_caches(&mut self) {
        self.key_info
            .modify(&keys::all_keys(), |_, value| value.tags.clear());
    }
}

impl Default for RoutingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Storage-server copy of a metadata key, so the owning server observes its
/// own assignment changes in its log stream.
fn privatized(key: &[u8]) -> Key {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.extend_from_slice(keys::SYSTEM_KEY_PREFIX);
    out.extend_from_slice(key);
    out
}

/// Apply the metadata effects of `mutations` to the store and routing state.
///
/// `to_commit` carries the private log messages generated along the way; it
/// is absent when replaying effects owned by another server. With
/// `initial_commit` the content is already durable (recovery broadcast) and
/// no messages are generated at all.
pub fn apply_metadata_mutations(
    dbgid: u64,
    mutations: &[Mutation],
    store: &mut TxnStateStore,
    routing: &mut RoutingState,
    mut to_commit: Option<&mut LogPushData>,
    initial_commit: bool,
) {
    for m in mutations {
        if !keys::is_metadata_mutation(m) {
            continue;
        }
        match m {
            Mutation::Set { key, value } => {
                if let Some(shard_key) = key.strip_prefix(keys::KEY_SERVERS_PREFIX) {
                    store.set(key.clone(), value.clone());
                    if shard_key < keys::all_keys().end.as_slice() {
                        match keys::decode_key_servers_value(value) {
                            Ok((src, dest)) => {
                                apply_shard_assignment(routing, shard_key, src, dest, &mut to_commit, initial_commit, key, value);
                            }
                            Err(err) => {
                                tracing::warn!(dbgid, error = ?err, "ignoring malformed shard assignment");
                            }
                        }
                    }
                } else if key.starts_with(keys::SERVER_TAG_PREFIX) {
                    store.set(key.clone(), value.clone());
                    apply_server_tag(routing, key, value, &mut to_commit, initial_commit);
                } else if let Some(cache_key) = key.strip_prefix(keys::STORAGE_CACHE_PREFIX) {
                    store.set(key.clone(), value.clone());
                    let cached = !value.is_empty();
                    let (containing, _) = routing.cache_info.range_containing(cache_key);
                    routing
                        .cache_info
                        .insert(&KeyRange::new(cache_key.to_vec(), containing.end), cached);
                } else if key.starts_with(keys::LOG_RANGES_PREFIX) {
                    store.set(key.clone(), value.clone());
                    apply_backup_registration(routing, key, value, dbgid);
                } else {
                    // Lock flag, metadata version, coordinators, server list,
                    // tag localities: plain store state, read back by the
                    // pipeline and the rejoin path.
                    store.set(key.clone(), value.clone());
                }
            }
            Mutation::ClearRange { begin, end } => {
                let range = KeyRange::new(begin.clone(), end.clone());
                if begin.starts_with(keys::SERVER_TAG_PREFIX) {
                    clear_server_tags(routing, store, &range);
                } else if begin.starts_with(keys::LOG_RANGES_PREFIX) {
                    clear_backup_registrations(routing, store, &range);
                }
                store.clear(&range);
            }
            _ => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_shard_assignment(
    routing: &mut RoutingState,
    shard_key: &[u8],
    src: Vec<u64>,
    dest: Vec<u64>,
    to_commit: &mut Option<&mut LogPushData>,
    initial_commit: bool,
    raw_key: &[u8],
    raw_value: &[u8],
) {
    let (containing, _) = routing.key_info.range_containing(shard_key);
    let info = ServerCacheInfo {
        tags: Vec::new(),
        src,
        dest,
    };
    let range = KeyRange::new(shard_key.to_vec(), containing.end);
    routing.key_info.insert(&range, info.clone());

    // The servers gaining or losing the shard learn about it from their own
    // log streams.
    if let Some(push) = to_commit.as_deref_mut() {
        if !initial_commit {
            let tags = routing.tags_for(&info);
            if !tags.is_empty() {
                push.add_tags(&tags);
                push.add_typed_message(&Mutation::Set {
                    key: privatized(raw_key),
                    value: raw_value.to_vec(),
                });
            }
        }
    }
}

fn apply_server_tag(
    routing: &mut RoutingState,
    key: &[u8],
    value: &[u8],
    to_commit: &mut Option<&mut LogPushData>,
    initial_commit: bool,
) {
    let suffix = &key[keys::SERVER_TAG_PREFIX.len()..];
    if suffix.len() != 8 {
        tracing::warn!("ignoring malformed server tag key");
        return;
    }
    let mut id_buf = [0u8; 8];
    id_buf.copy_from_slice(suffix);
    let id = u64::from_be_bytes(id_buf);
    let tag = match keys::decode_server_tag_value(value) {
        Ok(tag) => tag,
        Err(err) => {
            tracing::warn!(error = ?err, "ignoring malformed server tag value");
            return;
        }
    };

    let interf = routing
        .storage_cache
        .get(&id)
        .map(|info| info.interf.clone())
        .unwrap_or(StorageServerInterface {
            id,
            address: String::new(),
        });
    routing.storage_cache.insert(id, StorageInfo { tag, interf });
    routing.invalidate_tag_caches();

    if let Some(push) = to_commit.as_deref_mut() {
        if !initial_commit {
            push.add_tag(tag);
            push.add_typed_message(&Mutation::Set {
                key: privatized(key),
                value: value.to_vec(),
            });
        }
    }
}

fn apply_backup_registration(routing: &mut RoutingState, key: &[u8], value: &[u8], dbgid: u64) {
    let begin = key[keys::LOG_RANGES_PREFIX.len()..].to_vec();
    match keys::decode_log_range_value(value) {
        Ok((end, destination)) => {
            routing
                .backup_keys
                .modify(&KeyRange::new(begin, end), |_, dests| {
                    dests.insert(destination.clone());
                });
        }
        Err(err) => {
            tracing::warn!(dbgid, error = ?err, "ignoring malformed backup range registration");
        }
    }
}

fn clear_server_tags(routing: &mut RoutingState, store: &TxnStateStore, range: &KeyRange) {
    for (key, _) in store.read_range(range, None) {
        let suffix = &key[keys::SERVER_TAG_PREFIX.len().min(key.len())..];
        if suffix.len() == 8 {
            let mut id_buf = [0u8; 8];
            id_buf.copy_from_slice(suffix);
            routing.storage_cache.remove(&u64::from_be_bytes(id_buf));
        }
    }
    routing.invalidate_tag_caches();
}

fn clear_backup_registrations(routing: &mut RoutingState, store: &TxnStateStore, range: &KeyRange) {
    for (key, value) in store.read_range(range, None) {
        let begin = key[keys::LOG_RANGES_PREFIX.len()..].to_vec();
        if let Ok((end, destination)) = keys::decode_log_range_value(&value) {
            routing
                .backup_keys
                .modify(&KeyRange::new(begin, end), |_, dests| {
                    dests.remove(&destination);
                });
        }
    }
}

/// Whether any backup destination is registered at all; checked before the
/// per-mutation interception work.
pub fn has_backup_ranges(routing: &RoutingState) -> bool {
    routing
        .backup_keys
        .ranges()
        .iter()
        .any(|(_, dests)| !dests.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_core::keys::{
        encode_key_servers_value, encode_log_range_value, encode_server_tag_value,
        key_servers_key, log_ranges_key_for, server_tag_key_for,
    };

    fn tagged(routing: &mut RoutingState, id: u64, locality: i8, tag_id: u16) {
        let mut store = TxnStateStore::new();
        apply_metadata_mutations(
            0,
            &[Mutation::Set {
                key: server_tag_key_for(id),
                value: encode_server_tag_value(Tag::new(locality, tag_id)),
            }],
            &mut store,
            routing,
            None,
            true,
        );
    }

    #[test]
    fn shard_assignment_updates_key_info_and_tags() {
        let mut routing = RoutingState::new();
        let mut store = TxnStateStore::new();
        tagged(&mut routing, 1, 0, 1);
        tagged(&mut routing, 2, 0, 2);

        apply_metadata_mutations(
            0,
            &[Mutation::Set {
                key: key_servers_key(b"m"),
                value: encode_key_servers_value(&[1], &[2]),
            }],
            &mut store,
            &mut routing,
            None,
            true,
        );

        assert_eq!(routing.tags_for_key(b"zzz"), vec![Tag::new(0, 1), Tag::new(0, 2)]);
        // Keys before the assignment boundary keep the default (empty) info.
        assert!(routing.tags_for_key(b"a").is_empty());
    }

    #[test]
    fn server_tag_change_invalidates_cached_tags() {
        let mut routing = RoutingState::new();
        let mut store = TxnStateStore::new();
        tagged(&mut routing, 1, 0, 1);
        apply_metadata_mutations(
            0,
            &[Mutation::Set {
                key: key_servers_key(b""),
                value: encode_key_servers_value(&[1], &[]),
            }],
            &mut store,
            &mut routing,
            None,
            true,
        );
        assert_eq!(routing.tags_for_key(b"k"), vec![Tag::new(0, 1)]);

        // Retagging the server swaps the derived list on next lookup.
        tagged(&mut routing, 1, 0, 9);
        assert_eq!(routing.tags_for_key(b"k"), vec![Tag::new(0, 9)]);
    }

    #[test]
    fn backup_registration_adds_and_clears_destinations() {
        let mut routing = RoutingState::new();
        let mut store = TxnStateStore::new();
        let key = log_ranges_key_for(b"a");
        let value = encode_log_range_value(b"m", b"\xff\x02/blog/uid/");

        apply_metadata_mutations(
            0,
            &[Mutation::Set { key: key.clone(), value: value.clone() }],
            &mut store,
            &mut routing,
            None,
            true,
        );
        assert!(has_backup_ranges(&routing));
        let (_, dests) = routing.backup_keys.range_containing(b"c");
        assert_eq!(dests.len(), 1);

        apply_metadata_mutations(
            0,
            &[Mutation::ClearRange {
                begin: key,
                end: keys::log_ranges_keys().end,
            }],
            &mut store,
            &mut routing,
            None,
            true,
        );
        assert!(!has_backup_ranges(&routing));
    }

    #[test]
    fn lock_key_passes_through_to_store() {
        let mut routing = RoutingState::new();
        let mut store = TxnStateStore::new();
        apply_metadata_mutations(
            0,
            &[Mutation::Set {
                key: keys::DATABASE_LOCKED_KEY.to_vec(),
                value: b"locked".to_vec(),
            }],
            &mut store,
            &mut routing,
            None,
            true,
        );
        assert_eq!(store.read_value(keys::DATABASE_LOCKED_KEY), Some(b"locked".to_vec()));
    }
}
