//! Builds the per-resolver requests for one commit batch.
//!
//! Each client transaction is decomposed onto the resolvers that own its
//! conflict ranges. A read range consults the ownership history: every
//! resolver that owned any overlapping range since the read snapshot gets to
//! vote, plus the owner immediately preceding the snapshot. A write range
//! only concerns the current owner. Transactions carrying metadata effects
//! are mirrored to every resolver so all of them report the same state
//! mutation stream.

use std::collections::{BTreeSet, VecDeque};

use vellum_core::keys;
use vellum_core::messages::{CommitTransactionRequest, ResolveTransactionBatchRequest, ResolverTransaction};
use vellum_core::rangemap::RangeMap;
use vellum_core::types::{transform_versionstamp, KeyRange, Mutation, Version};

pub struct ResolutionRequestBuilder<'a> {
    key_resolvers: &'a RangeMap<VecDeque<(Version, usize)>>,
    commit_version: Version,
    pub requests: Vec<ResolveTransactionBatchRequest>,
    /// Per transaction, the resolvers it was sent to.
    pub transaction_resolver_map: Vec<Vec<usize>>,
    /// `[txn][resolver][read-range index at that resolver]` back to the
    /// range's index in the client's request, for conflict reporting.
    pub read_range_index_map: Vec<Vec<Vec<usize>>>,
    /// Index of the current transaction inside each resolver's request, if
    /// anything was routed there yet.
    out_slot: Vec<Option<usize>>,
}

impl<'a> ResolutionRequestBuilder<'a> {
    pub fn new(
        key_resolvers: &'a RangeMap<VecDeque<(Version, usize)>>,
        resolver_count: usize,
        commit_version: Version,
        prev_version: Version,
        last_received_version: Version,
    ) -> Self {
        let requests = (0..resolver_count)
            .map(|_| ResolveTransactionBatchRequest {
                prev_version,
                version: commit_version,
                last_received_version,
                transactions: Vec::new(),
                txn_state_transactions: Vec::new(),
                debug_id: None,
            })
            .collect();
        Self {
            key_resolvers,
            commit_version,
            requests,
            transaction_resolver_map: Vec::new(),
            read_range_index_map: Vec::new(),
            out_slot: vec![None; resolver_count],
        }
    }

    fn out_transaction(&mut self, resolver: usize, read_snapshot: Version) -> &mut ResolverTransaction {
        if self.out_slot[resolver].is_none() {
            let transactions = &mut self.requests[resolver].transactions;
            transactions.push(ResolverTransaction {
                read_snapshot,
                ..Default::default()
            });
            self.out_slot[resolver] = Some(transactions.len() - 1);
        }
        let slot = self.out_slot[resolver].expect("slot populated above");
        &mut self.requests[resolver].transactions[slot]
    }

    /// Decompose one transaction, rewriting versionstamps as a side effect.
    pub fn add_transaction(&mut self, request: &mut CommitTransactionRequest, batch_index: usize) {
        let resolver_count = self.requests.len();
        for slot in &mut self.out_slot {
            *slot = None;
        }
        debug_assert!(batch_index < u16::MAX as usize);

        let lock_aware = request.lock_aware;
        let tr = &mut request.transaction;
        let read_snapshot = tr.read_snapshot;

        let mut is_state_txn = false;
        let mut stamped_write_ranges = Vec::new();
        for m in tr.mutations.iter_mut() {
            match m {
                Mutation::SetVersionstampedKey { key, value } => {
                    transform_versionstamp(key, self.commit_version, batch_index as u16);
                    // The rewritten key was unknowable to the client, so the
                    // write conflict range is synthesized here.
                    stamped_write_ranges.push(KeyRange::single_key(key));
                    *m = Mutation::Set { key: key.clone(), value: value.clone() };
                }
                Mutation::SetVersionstampedValue { key, value } => {
                    transform_versionstamp(value, self.commit_version, batch_index as u16);
                    *m = Mutation::Set { key: key.clone(), value: value.clone() };
                }
                _ => {}
            }
            if keys::is_metadata_mutation(m) {
                is_state_txn = true;
                let mutation = m.clone();
                self.out_transaction(0, read_snapshot).mutations.push(mutation);
            }
        }
        tr.write_conflict_ranges.extend(stamped_write_ranges);

        if is_state_txn && !lock_aware {
            // A non-lock-aware transaction got its read version while the
            // database was unlocked, so conflicting on the lock key turns a
            // lock race into an ordinary conflict.
            tr.read_conflict_ranges.push(keys::database_locked_range());
        }

        let mut rcr_index_map = vec![Vec::new(); resolver_count];
        for (idx, range) in tr.read_conflict_ranges.iter().enumerate() {
            let mut resolvers = BTreeSet::new();
            for (_, history) in self.key_resolvers.intersecting_ranges(range) {
                for &(version, owner) in history.iter().rev() {
                    resolvers.insert(owner);
                    if version < read_snapshot {
                        break;
                    }
                }
            }
            debug_assert!(!resolvers.is_empty());
            for &resolver in &resolvers {
                self.out_transaction(resolver, read_snapshot)
                    .read_conflict_ranges
                    .push(range.clone());
                rcr_index_map[resolver].push(idx);
            }
        }

        for range in tr.write_conflict_ranges.clone() {
            let mut resolvers = BTreeSet::new();
            for (_, history) in self.key_resolvers.intersecting_ranges(&range) {
                if let Some(&(_, owner)) = history.back() {
                    resolvers.insert(owner);
                }
            }
            debug_assert!(!resolvers.is_empty());
            for &resolver in &resolvers {
                self.out_transaction(resolver, read_snapshot)
                    .write_conflict_ranges
                    .push(range.clone());
            }
        }

        if is_state_txn {
            // Every resolver must fold this transaction into its state
            // mutation stream, whether or not it has conflict work for it.
            for resolver in 0..resolver_count {
                self.out_transaction(resolver, read_snapshot);
                let slot = self.out_slot[resolver].expect("slot populated above");
                self.requests[resolver].txn_state_transactions.push(slot);
            }
        }

        let report_conflicting_keys = tr.report_conflicting_keys;
        let mut used = Vec::new();
        for resolver in 0..resolver_count {
            if let Some(slot) = self.out_slot[resolver] {
                self.requests[resolver].transactions[slot].report_conflicting_keys =
                    report_conflicting_keys;
                used.push(resolver);
            }
        }
        self.transaction_resolver_map.push(used);
        self.read_range_index_map.push(rcr_index_map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;
    use vellum_core::keys::all_keys;
    use vellum_core::types::CommitTransaction;

    fn two_resolver_map() -> RangeMap<VecDeque<(Version, usize)>> {
        // Resolver 0 owns ["", "m"), resolver 1 owns ["m", end) since
        // version 0.
        let mut map = RangeMap::new(VecDeque::new());
        map.insert(
            &KeyRange::new(Vec::new(), b"m".to_vec()),
            VecDeque::from([(0, 0)]),
        );
        map.insert(
            &KeyRange::new(b"m".to_vec(), all_keys().end),
            VecDeque::from([(0, 1)]),
        );
        map
    }

    fn request(transaction: CommitTransaction) -> CommitTransactionRequest {
        let (reply, rx) = oneshot::channel();
        drop(rx);
        CommitTransactionRequest {
            transaction,
            lock_aware: false,
            first_in_batch: false,
            tag_set: None,
            commit_cost_estimation: None,
            debug_id: None,
            reply,
        }
    }

    #[test]
    fn conflict_ranges_route_to_owning_resolvers() {
        let map = two_resolver_map();
        let mut builder = ResolutionRequestBuilder::new(&map, 2, 100, 90, 90);

        let mut req = request(CommitTransaction {
            read_snapshot: 50,
            mutations: vec![Mutation::Set { key: b"zz".to_vec(), value: b"v".to_vec() }],
            read_conflict_ranges: vec![
                KeyRange::new(b"a".to_vec(), b"b".to_vec()),
                KeyRange::new(b"a".to_vec(), b"z".to_vec()),
            ],
            write_conflict_ranges: vec![KeyRange::new(b"zz".to_vec(), b"zz\x00".to_vec())],
            report_conflicting_keys: false,
        });
        builder.add_transaction(&mut req, 0);

        // The straddling read range went to both; the small one only to 0.
        assert_eq!(builder.transaction_resolver_map[0], vec![0, 1]);
        assert_eq!(builder.requests[0].transactions[0].read_conflict_ranges.len(), 2);
        assert_eq!(builder.requests[1].transactions[0].read_conflict_ranges.len(), 1);
        // The write range concerns only the current owner of ["m", end).
        assert!(builder.requests[0].transactions[0].write_conflict_ranges.is_empty());
        assert_eq!(builder.requests[1].transactions[0].write_conflict_ranges.len(), 1);
        // Index map recovers the original positions.
        assert_eq!(builder.read_range_index_map[0][0], vec![0, 1]);
        assert_eq!(builder.read_range_index_map[0][1], vec![1]);
    }

    #[test]
    fn ownership_history_includes_pre_snapshot_owner() {
        // ["", "m") moved from resolver 1 to resolver 0 at version 80.
        let mut map = RangeMap::new(VecDeque::new());
        map.insert(
            &KeyRange::new(Vec::new(), b"m".to_vec()),
            VecDeque::from([(0, 1), (80, 0)]),
        );
        map.insert(
            &KeyRange::new(b"m".to_vec(), all_keys().end),
            VecDeque::from([(0, 1)]),
        );
        let mut builder = ResolutionRequestBuilder::new(&map, 2, 100, 90, 90);

        let mut req = request(CommitTransaction {
            read_snapshot: 50,
            read_conflict_ranges: vec![KeyRange::new(b"a".to_vec(), b"b".to_vec())],
            ..Default::default()
        });
        builder.add_transaction(&mut req, 0);

        // Snapshot 50 predates the move, so both the new owner and the
        // owner at the snapshot participate.
        assert_eq!(builder.transaction_resolver_map[0], vec![0, 1]);

        // A snapshot after the move needs only the new owner.
        let mut later = request(CommitTransaction {
            read_snapshot: 85,
            read_conflict_ranges: vec![KeyRange::new(b"a".to_vec(), b"b".to_vec())],
            ..Default::default()
        });
        builder.add_transaction(&mut later, 1);
        assert_eq!(builder.transaction_resolver_map[1], vec![0]);
    }

    #[test]
    fn versionstamped_key_gains_write_conflict_range() {
        let map = two_resolver_map();
        let mut builder = ResolutionRequestBuilder::new(&map, 2, 0x0100, 90, 90);

        let mut key = b"aa".to_vec();
        key.extend_from_slice(&[0u8; 10]);
        key.extend_from_slice(&2u32.to_le_bytes());
        let mut req = request(CommitTransaction {
            read_snapshot: 50,
            mutations: vec![Mutation::SetVersionstampedKey { key, value: b"v".to_vec() }],
            ..Default::default()
        });
        builder.add_transaction(&mut req, 3);

        let Mutation::Set { key, .. } = &req.transaction.mutations[0] else {
            panic!("versionstamped mutation should decay to a set");
        };
        assert_eq!(&key[2..10], &0x0100u64.to_be_bytes());
        assert_eq!(&key[10..12], &3u16.to_be_bytes());
        assert_eq!(
            req.transaction.write_conflict_ranges,
            vec![KeyRange::single_key(key)]
        );
        // The stamped key starts with "aa", owned by resolver 0.
        assert_eq!(builder.transaction_resolver_map[0], vec![0]);
    }

    #[test]
    fn state_transactions_fan_out_to_all_resolvers() {
        let map = two_resolver_map();
        let mut builder = ResolutionRequestBuilder::new(&map, 2, 100, 90, 90);

        let mut req = request(CommitTransaction {
            read_snapshot: 50,
            mutations: vec![Mutation::Set {
                key: keys::DATABASE_LOCKED_KEY.to_vec(),
                value: b"1".to_vec(),
            }],
            ..Default::default()
        });
        builder.add_transaction(&mut req, 0);

        assert_eq!(builder.requests[0].txn_state_transactions, vec![0]);
        assert_eq!(builder.requests[1].txn_state_transactions, vec![0]);
        // Only resolver 0 carries the mutations themselves.
        assert_eq!(builder.requests[0].transactions[0].mutations.len(), 1);
        assert!(builder.requests[1].transactions[0].mutations.is_empty());
        // The lock-key read conflict range was synthesized for the
        // non-lock-aware transaction.
        assert!(req
            .transaction
            .read_conflict_ranges
            .contains(&keys::database_locked_range()));
    }
}
