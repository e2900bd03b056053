//! Client- and peer-facing request handlers on the commit server.
//!
//! Everything here reads the transaction-state store and routing maps; none
//! of it writes them. Read paths gate on the valid-state signal so no
//! request observes the store before the recovery snapshot and first commit
//! have primed it.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;

use vellum_core::interfaces::DataDistributorClient;
use vellum_core::keys;
use vellum_core::messages::{
    ExclusionSafetyCheckReply, ExclusionSafetyCheckRequest, GetDDMetricsRequest,
    GetKeyServerLocationsReply, GetKeyServerLocationsRequest, GetStorageServerRejoinInfoReply,
    GetStorageServerRejoinInfoRequest, ProxySnapRequest, StorageServerInterface, TxnStateRequest,
};
use vellum_core::types::Tag;
use vellum_core::ProxyError;

use crate::commit::CommitData;
use crate::metadata::apply_metadata_mutations;
use crate::stats::bump;

/// Serves shard-ownership lookups, shedding load past the queue cap.
pub async fn read_request_server(
    data: Arc<CommitData>,
    mut requests: mpsc::UnboundedReceiver<GetKeyServerLocationsRequest>,
) {
    while let Some(req) = requests.recv().await {
        if data.stats.location_requests_in_flight() > data.knobs.key_location_max_queue_size {
            bump(&data.stats.key_server_location_errors);
            let _ = req.reply.send(Err(ProxyError::ProxyMemoryLimitExceeded));
            tracing::warn!(id = data.id, "location request threshold exceeded");
            continue;
        }
        bump(&data.stats.key_server_location_in);
        let data = data.clone();
        tokio::spawn(async move {
            data.valid_state.when_at_least(true).await;
            let reply = key_server_locations(&data, &req);
            bump(&data.stats.key_server_location_out);
            let _ = req.reply.send(Ok(reply));
        });
    }
}

fn interfaces_for(data: &CommitData, info: &crate::metadata::ServerCacheInfo) -> Vec<StorageServerInterface> {
    let routing = data.routing.lock();
    info.src
        .iter()
        .filter_map(|id| routing.storage_cache.get(id).map(|s| s.interf.clone()))
        .collect()
}

fn key_server_locations(
    data: &CommitData,
    req: &GetKeyServerLocationsRequest,
) -> GetKeyServerLocationsReply {
    let mut results = Vec::new();
    match &req.end {
        None => {
            let (range, info) = {
                let routing = data.routing.lock();
                let (range, info) = if req.reverse {
                    routing.key_info.range_containing_key_before(&req.begin)
                } else {
                    routing.key_info.range_containing(&req.begin)
                };
                (range, info.clone())
            };
            results.push((range, interfaces_for(data, &info)));
        }
        Some(end) if !req.reverse => {
            let overlapping = {
                let routing = data.routing.lock();
                routing
                    .key_info
                    .intersecting_ranges(&vellum_core::KeyRange::new(
                        req.begin.clone(),
                        end.clone(),
                    ))
                    .into_iter()
                    .map(|(range, info)| (range, info.clone()))
                    .collect::<Vec<_>>()
            };
            for (range, info) in overlapping.into_iter().take(req.limit) {
                results.push((range, interfaces_for(data, &info)));
            }
        }
        Some(end) => {
            let overlapping = {
                let routing = data.routing.lock();
                routing
                    .key_info
                    .intersecting_ranges(&vellum_core::KeyRange::new(
                        req.begin.clone(),
                        end.clone(),
                    ))
                    .into_iter()
                    .map(|(range, info)| (range, info.clone()))
                    .collect::<Vec<_>>()
            };
            for (range, info) in overlapping.into_iter().rev().take(req.limit) {
                results.push((range, interfaces_for(data, &info)));
            }
        }
    }
    GetKeyServerLocationsReply { results }
}

/// Answers storage-server rejoin requests from the persisted tag state.
pub async fn rejoin_server(
    data: Arc<CommitData>,
    mut requests: mpsc::UnboundedReceiver<GetStorageServerRejoinInfoRequest>,
) {
    data.valid_state.when_at_least(true).await;
    tracing::info!(id = data.id, "ready for storage server rejoins");

    while let Some(req) = requests.recv().await {
        let reply = rejoin_info(&data, &req);
        let _ = req.reply.send(reply);
    }
}

fn rejoin_info(
    data: &CommitData,
    req: &GetStorageServerRejoinInfoRequest,
) -> Result<GetStorageServerRejoinInfoReply, ProxyError> {
    let store = data.store.lock();
    if store.read_value(&keys::server_list_key_for(req.id)).is_none() {
        return Err(ProxyError::WorkerRemoved);
    }

    let tag_value = store
        .read_value(&keys::server_tag_key_for(req.id))
        .ok_or(ProxyError::WorkerRemoved)?;
    let tag = keys::decode_server_tag_value(&tag_value)
        .map_err(|err| ProxyError::Internal(err.to_string()))?;

    let mut history = Vec::new();
    for (key, value) in store.read_range(&keys::server_tag_history_range_for(req.id), None) {
        if let (Ok(version), Ok(old_tag)) = (
            keys::decode_server_tag_history_key(&key),
            keys::decode_server_tag_value(&value),
        ) {
            history.push((version, old_tag));
        }
    }
    history.reverse();

    let mut reply = GetStorageServerRejoinInfoReply {
        version: data.version.load(Ordering::Relaxed),
        tag,
        history,
        new_tag: None,
        new_locality: false,
    };

    let locality_value = req
        .dc_id
        .as_ref()
        .and_then(|dc| store.read_value(&keys::tag_locality_list_key_for(dc)));
    match locality_value {
        Some(value) => {
            let locality = keys::decode_tag_locality_value(&value)
                .map_err(|err| ProxyError::Internal(err.to_string()))?;
            if locality != tag.locality {
                // The server moved localities: give it the smallest tag id
                // not in use there, current or historical.
                tracing::warn!(id = req.id, "storage server rejoined with changed locality");
                let mut used: Vec<u16> = Vec::new();
                for (_, value) in store.read_range(&keys::server_tag_keys(), None) {
                    if let Ok(t) = keys::decode_server_tag_value(&value) {
                        if t.locality == locality {
                            used.push(t.id);
                        }
                    }
                }
                for (_, value) in store.read_range(&keys::server_tag_history_keys(), None) {
                    if let Ok(t) = keys::decode_server_tag_value(&value) {
                        if t.locality == locality {
                            used.push(t.id);
                        }
                    }
                }
                used.sort_unstable();
                used.dedup();
                let mut tag_id: u16 = 0;
                for used_id in used {
                    if tag_id < used_id {
                        break;
                    }
                    tag_id = used_id + 1;
                }
                reply.new_tag = Some(Tag::new(locality, tag_id));
            }
        }
        None => {
            // A brand new locality gets the next locality id with tag 0.
            reply.new_locality = true;
            let mut max_locality: i8 = -1;
            for (_, value) in store.read_range(&keys::tag_locality_list_keys(), None) {
                if let Ok(locality) = keys::decode_tag_locality_value(&value) {
                    max_locality = max_locality.max(locality);
                }
            }
            reply.new_tag = Some(Tag::new(max_locality + 1, 0));
        }
    }

    Ok(reply)
}

/// Passes shard-metrics requests through to the data distributor.
pub async fn dd_metrics_server(
    data: Arc<CommitData>,
    data_distributor: Arc<dyn DataDistributorClient>,
    mut requests: mpsc::UnboundedReceiver<GetDDMetricsRequest>,
) {
    while let Some(req) = requests.recv().await {
        let data_distributor = data_distributor.clone();
        let id = data.id;
        tokio::spawn(async move {
            match data_distributor
                .get_metrics(req.range.clone(), req.shard_limit)
                .await
            {
                Ok(reply) => {
                    let _ = req.reply.send(Ok(reply));
                }
                Err(err) => {
                    tracing::warn!(id, error = ?err, "shard metrics request failed");
                    let _ = req.reply.send(Err(ProxyError::DataDistributorNotFound));
                }
            }
        });
    }
}

/// Relays exclusion safety checks; an unreachable distributor means "not
/// safe" rather than an error.
pub async fn exclusion_safety_server(
    data: Arc<CommitData>,
    data_distributor: Arc<dyn DataDistributorClient>,
    mut requests: mpsc::UnboundedReceiver<ExclusionSafetyCheckRequest>,
) {
    while let Some(req) = requests.recv().await {
        let safe = match data_distributor
            .exclusion_safety_check(req.exclusions.clone())
            .await
        {
            Ok(safe) => safe,
            Err(err) => {
                tracing::warn!(id = data.id, error = ?err, "exclusion safety check failed");
                false
            }
        };
        let _ = req.reply.send(ExclusionSafetyCheckReply { safe });
    }
}

/// Forwards cluster snapshot requests to the data distributor.
pub async fn snapshot_server(
    data: Arc<CommitData>,
    data_distributor: Arc<dyn DataDistributorClient>,
    mut requests: mpsc::UnboundedReceiver<ProxySnapRequest>,
) {
    while let Some(req) = requests.recv().await {
        let data_distributor = data_distributor.clone();
        let id = data.id;
        tokio::spawn(async move {
            tracing::debug!(id, snap_id = req.snap_id, "snapshot request");
            match data_distributor.snapshot(req.payload.clone(), req.snap_id).await {
                Ok(()) => {
                    let _ = req.reply.send(Ok(()));
                }
                Err(err) => {
                    tracing::warn!(id, snap_id = req.snap_id, error = ?err, "snapshot failed");
                    let _ = req.reply.send(Err(ProxyError::DataDistributorNotFound));
                }
            }
        });
    }
}

/// Ingests the sequenced transaction-state snapshot broadcast during
/// recovery and re-broadcasts each part to peer servers. Once every part
/// has arrived, the routing maps are primed from the store.
pub async fn txn_state_server(
    data: Arc<CommitData>,
    mut requests: mpsc::UnboundedReceiver<TxnStateRequest>,
    peers: Vec<mpsc::UnboundedSender<TxnStateRequest>>,
) {
    let mut received = std::collections::BTreeSet::new();
    let mut max_sequence = u64::MAX;
    while let Some(req) = requests.recv().await {
        if req.last {
            max_sequence = req.sequence + 1;
        }
        if received.insert(req.sequence) {
            if data.valid_state.get() {
                tracing::warn!(id = data.id, "state snapshot part arrived after first commit");
            }
            {
                let mut store = data.store.lock();
                for (key, value) in &req.data {
                    store.load(key.clone(), value.clone());
                }
            }
            if received.len() as u64 == max_sequence {
                prime_from_store(&data);
            }
        }

        // Fan the part out: each peer gets the same payload, in groups so a
        // single slow peer cannot stall the whole broadcast front.
        let group = data.knobs.txn_state_send_amount.max(1);
        for chunk in peers.chunks(group) {
            for peer in chunk {
                let (ack_tx, _ack_rx) = tokio::sync::oneshot::channel();
                let _ = peer.send(TxnStateRequest {
                    sequence: req.sequence,
                    last: req.last,
                    data: req.data.clone(),
                    reply: ack_tx,
                });
            }
        }
        let _ = req.reply.send(());
    }
}

/// Rebuild the routing maps from a freshly loaded store snapshot.
fn prime_from_store(data: &Arc<CommitData>) {
    let entries = {
        let store = data.store.lock();
        store.read_range(&vellum_core::KeyRange::new(Vec::new(), keys::all_keys().end), None)
    };

    let mut shard_entries = Vec::new();
    let mut other = Vec::new();
    for (key, value) in entries {
        if key.starts_with(keys::KEY_SERVERS_PREFIX) {
            shard_entries.push((key, value));
        } else {
            other.push(vellum_core::Mutation::Set { key, value });
        }
    }

    {
        // Server tags and localities first, so shard entries resolve their
        // tag sets against a complete storage cache.
        let mut store = data.store.lock();
        let mut routing = data.routing.lock();
        apply_metadata_mutations(data.id, &other, &mut store, &mut routing, None, true);
        let shard_mutations: Vec<_> = shard_entries
            .into_iter()
            .map(|(key, value)| vellum_core::Mutation::Set { key, value })
            .collect();
        apply_metadata_mutations(data.id, &shard_mutations, &mut store, &mut routing, None, true);
        // Loading rewrote store contents it already held; none of it needs
        // to be pushed again.
        store.resync_log();
    }

    let (locked, metadata_version) = {
        let store = data.store.lock();
        (
            store
                .read_value(keys::DATABASE_LOCKED_KEY)
                .is_some_and(|v| !v.is_empty()),
            store.read_value(keys::METADATA_VERSION_KEY),
        )
    };
    let mut volatile = data.volatile.lock();
    volatile.locked = locked;
    volatile.metadata_version = metadata_version;
    tracing::info!(id = data.id, "transaction state snapshot loaded");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc as tokio_mpsc;
    use vellum_core::interfaces::{LogSystemClient, MasterClient, ResolverClient};
    use vellum_core::keys::{
        encode_server_tag_value, encode_tag_locality_value, server_list_key_for,
        server_tag_history_key_for, server_tag_key_for, tag_locality_list_key_for,
    };

    use crate::commit::{CommitData, CommitProxyConfig};
    use crate::knobs::Knobs;

    struct NoMaster;
    #[async_trait::async_trait]
    impl MasterClient for NoMaster {
        async fn get_commit_version(
            &self,
            _req: vellum_core::messages::GetCommitVersionRequest,
        ) -> anyhow::Result<vellum_core::messages::GetCommitVersionReply> {
            anyhow::bail!("unused")
        }
        async fn get_live_committed_version(
            &self,
        ) -> anyhow::Result<vellum_core::messages::GetRawCommittedVersionReply> {
            anyhow::bail!("unused")
        }
        async fn report_live_committed_version(
            &self,
            _req: vellum_core::messages::ReportRawCommittedVersionRequest,
        ) -> anyhow::Result<()> {
            anyhow::bail!("unused")
        }
    }

    struct NoLog;
    #[async_trait::async_trait]
    impl LogSystemClient for NoLog {
        async fn push(
            &self,
            _prev: i64,
            _version: i64,
            _committed: i64,
            _min_kcv: i64,
            _messages: Vec<vellum_core::messages::TaggedMessage>,
        ) -> anyhow::Result<i64> {
            anyhow::bail!("unused")
        }
        async fn confirm_epoch_live(&self) -> anyhow::Result<()> {
            anyhow::bail!("unused")
        }
        async fn pop_txs(&self, _up_to: i64, _locality: i8) -> anyhow::Result<()> {
            Ok(())
        }
        async fn queuing_metrics(&self) -> anyhow::Result<Vec<i64>> {
            Ok(Vec::new())
        }
    }

    struct NoResolver;
    #[async_trait::async_trait]
    impl ResolverClient for NoResolver {
        async fn resolve(
            &self,
            _req: vellum_core::messages::ResolveTransactionBatchRequest,
        ) -> anyhow::Result<vellum_core::messages::ResolveTransactionBatchReply> {
            anyhow::bail!("unused")
        }
    }

    fn test_data() -> Arc<CommitData> {
        let (fatal_tx, _fatal_rx) = tokio_mpsc::unbounded_channel();
        std::mem::forget(_fatal_rx);
        let config = CommitProxyConfig {
            id: 1,
            knobs: Arc::new(Knobs::default()),
            commit_proxy_count: 1,
            recovery_transaction_version: 1,
        };
        Arc::new(CommitData::new(
            &config,
            Arc::new(NoMaster),
            vec![Arc::new(NoResolver)],
            Arc::new(NoLog),
            fatal_tx,
        ))
    }

    fn seed_server(data: &CommitData, id: u64, locality: i8, tag_id: u16) {
        let mut store = data.store.lock();
        store.load(server_list_key_for(id), vec![1]);
        store.load(
            server_tag_key_for(id),
            encode_server_tag_value(Tag::new(locality, tag_id)),
        );
    }

    fn rejoin(data: &CommitData, id: u64, dc: Option<&[u8]>) -> Result<GetStorageServerRejoinInfoReply, ProxyError> {
        let (reply, _rx) = tokio::sync::oneshot::channel();
        let req = GetStorageServerRejoinInfoRequest {
            id,
            dc_id: dc.map(|d| d.to_vec()),
            reply,
        };
        rejoin_info(data, &req)
    }

    #[test]
    fn rejoin_unknown_server_is_removed() {
        let data = test_data();
        assert_eq!(rejoin(&data, 7, None), Err(ProxyError::WorkerRemoved));
    }

    #[test]
    fn rejoin_same_locality_keeps_tag() {
        let data = test_data();
        seed_server(&data, 7, 1, 3);
        data.store
            .lock()
            .load(tag_locality_list_key_for(b"dc1"), encode_tag_locality_value(1));

        let reply = rejoin(&data, 7, Some(b"dc1")).unwrap();
        assert_eq!(reply.tag, Tag::new(1, 3));
        assert!(reply.new_tag.is_none());
        assert!(!reply.new_locality);
    }

    #[test]
    fn rejoin_changed_locality_picks_smallest_unused_tag() {
        let data = test_data();
        seed_server(&data, 7, 1, 3);
        // Locality 2 already uses tag ids 0 and 1 (one current, one
        // historical).
        seed_server(&data, 8, 2, 0);
        data.store.lock().load(
            server_tag_history_key_for(9, 50),
            encode_server_tag_value(Tag::new(2, 1)),
        );
        data.store
            .lock()
            .load(tag_locality_list_key_for(b"dc2"), encode_tag_locality_value(2));

        let reply = rejoin(&data, 7, Some(b"dc2")).unwrap();
        assert_eq!(reply.new_tag, Some(Tag::new(2, 2)));
        assert!(!reply.new_locality);
    }

    #[test]
    fn rejoin_new_locality_starts_at_tag_zero() {
        let data = test_data();
        seed_server(&data, 7, 1, 0);
        data.store
            .lock()
            .load(tag_locality_list_key_for(b"dc1"), encode_tag_locality_value(4));

        let reply = rejoin(&data, 7, Some(b"dc-new")).unwrap();
        assert!(reply.new_locality);
        assert_eq!(reply.new_tag, Some(Tag::new(5, 0)));
    }
}
