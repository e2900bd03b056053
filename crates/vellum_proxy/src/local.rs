//! Single-process collaborator backends and a minimal transaction client.
//!
//! These implement the collaborator contracts over in-memory state so a
//! complete instance of both server roles can run inside one process. The
//! node binary's workload mode and the integration tests are the consumers;
//! production deployments substitute real services behind the same traits.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use vellum_core::interfaces::{
    DataDistributorClient, LogSystemClient, MasterClient, RateKeeperClient, ResolverClient,
};
use vellum_core::keys;
use vellum_core::messages::{
    decode_mutation, ClientTagThrottleLimits, CommitReply, CommitTransactionRequest,
    GetCommitVersionReply, GetCommitVersionRequest, GetDDMetricsReply, GetRateInfoReply,
    GetRateInfoRequest, GetRawCommittedVersionReply, GetReadVersionReply, GetReadVersionRequest,
    HealthMetrics, ReportCommitCostRequest, ReportRawCommittedVersionRequest,
    ResolveTransactionBatchReply, ResolveTransactionBatchRequest, ResolverMove,
    StateMutationGroup, TaggedMessage, ThrottledTagMap, TxnStateRequest,
};
use vellum_core::time::now_seconds;
use vellum_core::types::{
    AtomicOp, CommitStatus, CommitTransaction, Key, KeyRange, Mutation, Tag, TransactionPriority,
    TransactionTag, Version,
};
use vellum_core::ProxyError;

use crate::knobs::Knobs;
use crate::{spawn_commit_proxy, spawn_grv_proxy, CommitProxyConfig, CommitProxyHandle, GrvProxyConfig, GrvProxyHandle};

/// Versions minted per second of wall-clock time.
const VERSIONS_PER_SECOND: f64 = 1e6;
const MIN_VERSION_STEP: Version = 1_000;

struct MasterInner {
    last_assigned: Version,
    last_assign_time: f64,
    committed: Version,
    locked: bool,
    metadata_version: Option<Vec<u8>>,
    min_known_committed: Version,
    pending_resolver_moves: Vec<ResolverMove>,
    resolver_changes_version: Version,
    reports: Vec<ReportRawCommittedVersionRequest>,
}

/// Version authority: mints commit versions and tracks the live committed
/// version reported back by commit servers.
pub struct LocalMaster {
    inner: Mutex<MasterInner>,
}

impl LocalMaster {
    pub fn new(recovery_version: Version) -> Self {
        Self {
            inner: Mutex::new(MasterInner {
                last_assigned: recovery_version,
                last_assign_time: now_seconds(),
                committed: recovery_version,
                locked: false,
                metadata_version: None,
                min_known_committed: recovery_version,
                pending_resolver_moves: Vec::new(),
                resolver_changes_version: recovery_version,
                reports: Vec::new(),
            }),
        }
    }

    /// Queue resolver-range moves delivered with the next commit version.
    pub fn queue_resolver_moves(&self, moves: Vec<ResolverMove>, version: Version) {
        let mut inner = self.inner.lock();
        inner.pending_resolver_moves.extend(moves);
        inner.resolver_changes_version = version;
    }

    /// Committed-version reports observed so far, oldest first.
    pub fn reports(&self) -> Vec<ReportRawCommittedVersionRequest> {
        self.inner.lock().reports.clone()
    }

    pub fn committed_version(&self) -> Version {
        self.inner.lock().committed
    }
}

#[async_trait]
impl MasterClient for LocalMaster {
    async fn get_commit_version(
        &self,
        req: GetCommitVersionRequest,
    ) -> anyhow::Result<GetCommitVersionReply> {
        let mut inner = self.inner.lock();
        let now = now_seconds();
        let step = ((now - inner.last_assign_time) * VERSIONS_PER_SECOND) as Version;
        let prev_version = inner.last_assigned;
        inner.last_assigned = prev_version + step.max(MIN_VERSION_STEP);
        inner.last_assign_time = now;
        Ok(GetCommitVersionReply {
            version: inner.last_assigned,
            prev_version,
            request_num: req.request_num,
            resolver_changes: std::mem::take(&mut inner.pending_resolver_moves),
            resolver_changes_version: inner.resolver_changes_version,
        })
    }

    async fn get_live_committed_version(&self) -> anyhow::Result<GetRawCommittedVersionReply> {
        let inner = self.inner.lock();
        Ok(GetRawCommittedVersionReply {
            version: inner.committed,
            locked: inner.locked,
            metadata_version: inner.metadata_version.clone(),
            min_known_committed_version: inner.min_known_committed,
        })
    }

    async fn report_live_committed_version(
        &self,
        req: ReportRawCommittedVersionRequest,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if req.version > inner.committed {
            inner.committed = req.version;
            inner.locked = req.locked;
            inner.metadata_version = req.metadata_version.clone();
        }
        inner.min_known_committed = inner.min_known_committed.max(req.min_known_committed_version);
        inner.reports.push(req);
        Ok(())
    }
}

struct ResolverInner {
    /// Write-conflict ranges of admitted transactions, by commit version.
    recent_writes: Vec<(Version, Vec<KeyRange>)>,
    oldest_version: Version,
    /// Metadata-effect groups by commit version, for replay to servers that
    /// have not seen them yet.
    state_groups: VecDeque<(Version, Vec<StateMutationGroup>)>,
}

/// Conflict authority for a slice of the keyspace.
pub struct LocalResolver {
    window_versions: Version,
    inner: Mutex<ResolverInner>,
}

impl LocalResolver {
    pub fn new(recovery_version: Version, window_versions: Version) -> Self {
        Self {
            window_versions,
            inner: Mutex::new(ResolverInner {
                recent_writes: Vec::new(),
                oldest_version: recovery_version,
                state_groups: VecDeque::new(),
            }),
        }
    }
}

#[async_trait]
impl ResolverClient for LocalResolver {
    async fn resolve(
        &self,
        req: ResolveTransactionBatchRequest,
    ) -> anyhow::Result<ResolveTransactionBatchReply> {
        let mut inner = self.inner.lock();

        let mut committed = Vec::with_capacity(req.transactions.len());
        let mut conflicting_key_ranges = Vec::with_capacity(req.transactions.len());
        for txn in &req.transactions {
            if !txn.read_conflict_ranges.is_empty() && txn.read_snapshot < inner.oldest_version {
                committed.push(CommitStatus::TooOld);
                conflicting_key_ranges.push(Vec::new());
                continue;
            }
            let mut conflicting = Vec::new();
            for (idx, read_range) in txn.read_conflict_ranges.iter().enumerate() {
                let hit = inner.recent_writes.iter().any(|(version, writes)| {
                    *version > txn.read_snapshot
                        && writes.iter().any(|w| w.intersects(read_range))
                });
                if hit {
                    conflicting.push(idx);
                }
            }
            committed.push(if conflicting.is_empty() {
                CommitStatus::Committed
            } else {
                CommitStatus::Conflict
            });
            conflicting_key_ranges.push(conflicting);
        }

        // Writes of transactions this resolver admitted join the conflict
        // window; a transaction another resolver rejects costs at most some
        // false conflicts later.
        let mut writes_at_version = Vec::new();
        for (txn, status) in req.transactions.iter().zip(&committed) {
            if *status == CommitStatus::Committed {
                writes_at_version.extend(txn.write_conflict_ranges.iter().cloned());
            }
        }
        if !writes_at_version.is_empty() {
            inner.recent_writes.push((req.version, writes_at_version));
        }

        // Replay metadata-effect groups the requester has not received.
        let state_mutations: Vec<Vec<StateMutationGroup>> = inner
            .state_groups
            .iter()
            .filter(|(version, _)| {
                *version > req.last_received_version && *version < req.version
            })
            .map(|(_, groups)| groups.clone())
            .collect();

        if !req.txn_state_transactions.is_empty() {
            let groups = req
                .txn_state_transactions
                .iter()
                .map(|&i| StateMutationGroup {
                    committed: committed[i] == CommitStatus::Committed,
                    mutations: req.transactions[i].mutations.clone(),
                })
                .collect();
            inner.state_groups.push_back((req.version, groups));
        }

        // Slide the conflict window forward.
        let oldest = (req.version - self.window_versions).max(inner.oldest_version);
        inner.oldest_version = oldest;
        inner.recent_writes.retain(|(version, _)| *version >= oldest);
        while let Some((version, _)) = inner.state_groups.front() {
            if *version < oldest {
                inner.state_groups.pop_front();
            } else {
                break;
            }
        }

        Ok(ResolveTransactionBatchReply {
            committed,
            state_mutations,
            conflicting_key_ranges,
        })
    }
}

/// A versioned value history for one key.
type History = Vec<(Version, Option<Vec<u8>>)>;

#[derive(Default)]
struct StorageInner {
    data: BTreeMap<Key, History>,
    oldest_version: Version,
    durable_version: Version,
}

/// One push accepted by the log, kept for inspection.
#[derive(Clone, Debug)]
pub struct PushRecord {
    pub prev_version: Version,
    pub version: Version,
    /// The pushing server's committed version at push time.
    pub committed_version: Version,
    pub messages: Vec<TaggedMessage>,
}

struct LogInner {
    storage: StorageInner,
    pushes: Vec<PushRecord>,
    confirm_count: u64,
    pops: Vec<(Version, i8)>,
    remote_durable: Vec<Version>,
}

/// The replicated log plus the storage fleet behind it, collapsed into one
/// in-memory sink. Pushed mutations become readable at their commit
/// version.
pub struct LocalLogSystem {
    inner: Mutex<LogInner>,
}

impl LocalLogSystem {
    pub fn new(recovery_version: Version) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                storage: StorageInner {
                    data: BTreeMap::new(),
                    oldest_version: recovery_version,
                    durable_version: recovery_version,
                },
                pushes: Vec::new(),
                confirm_count: 0,
                pops: Vec::new(),
                remote_durable: Vec::new(),
            }),
        }
    }

    /// Read the newest value of `key` visible at `version`.
    pub fn read(&self, key: &[u8], version: Version) -> Result<Option<Vec<u8>>, ProxyError> {
        let inner = self.inner.lock();
        if version < inner.storage.oldest_version {
            return Err(ProxyError::TransactionTooOld);
        }
        if version > inner.storage.durable_version {
            return Err(ProxyError::FutureVersion);
        }
        Ok(read_history(&inner.storage.data, key, version))
    }

    /// Read up to `limit + 1` pairs in `[begin, end)` visible at `version`,
    /// returning whether more remain.
    pub fn read_range(
        &self,
        range: &KeyRange,
        version: Version,
        limit: usize,
    ) -> Result<(Vec<(Key, Vec<u8>)>, bool), ProxyError> {
        let inner = self.inner.lock();
        if version < inner.storage.oldest_version {
            return Err(ProxyError::TransactionTooOld);
        }
        if version > inner.storage.durable_version {
            return Err(ProxyError::FutureVersion);
        }
        let mut out = Vec::new();
        let mut more = false;
        for key in inner
            .storage
            .data
            .range(range.begin.clone()..range.end.clone())
            .map(|(k, _)| k.clone())
        {
            if let Some(value) = read_history(&inner.storage.data, &key, version) {
                if out.len() == limit {
                    more = true;
                    break;
                }
                out.push((key, value));
            }
        }
        Ok((out, more))
    }

    pub fn pushes(&self) -> Vec<PushRecord> {
        self.inner.lock().pushes.clone()
    }

    pub fn confirm_count(&self) -> u64 {
        self.inner.lock().confirm_count
    }

    pub fn pops(&self) -> Vec<(Version, i8)> {
        self.inner.lock().pops.clone()
    }

    /// Configure the per-remote-log durable versions returned by
    /// `queuing_metrics`.
    pub fn set_remote_durable(&self, versions: Vec<Version>) {
        self.inner.lock().remote_durable = versions;
    }
}

fn read_history(data: &BTreeMap<Key, History>, key: &[u8], version: Version) -> Option<Vec<u8>> {
    let history = data.get(key)?;
    history
        .iter()
        .rev()
        .find(|(v, _)| *v <= version)
        .and_then(|(_, value)| value.clone())
}

fn apply_to_storage(storage: &mut StorageInner, m: &Mutation, version: Version) {
    match m {
        Mutation::Set { key, value } => {
            storage
                .data
                .entry(key.clone())
                .or_default()
                .push((version, Some(value.clone())));
        }
        Mutation::ClearRange { begin, end } => {
            let doomed: Vec<Key> = storage
                .data
                .range(begin.clone()..end.clone())
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                storage
                    .data
                    .entry(key)
                    .or_default()
                    .push((version, None));
            }
        }
        Mutation::Atomic { op, key, param } => {
            let existing =
                read_history(&storage.data, key, version).unwrap_or_default();
            let updated = op.apply(&existing, param);
            storage
                .data
                .entry(key.clone())
                .or_default()
                .push((version, Some(updated)));
        }
        // Versionstamped operations decay to sets before they reach the log.
        Mutation::SetVersionstampedKey { .. } | Mutation::SetVersionstampedValue { .. } => {}
    }
}

#[async_trait]
impl LogSystemClient for LocalLogSystem {
    async fn push(
        &self,
        prev_version: Version,
        version: Version,
        committed_version: Version,
        _min_known_committed_version: Version,
        messages: Vec<TaggedMessage>,
    ) -> anyhow::Result<Version> {
        let mut inner = self.inner.lock();
        for tagged in &messages {
            // Transaction-state messages mirror a store other servers
            // rebuild from the broadcast; only storage-tagged mutations
            // become client-visible data.
            if tagged.tags.iter().all(|tag| tag.locality < 0) {
                continue;
            }
            if let Ok(mutation) = decode_mutation(&tagged.message) {
                apply_to_storage(&mut inner.storage, &mutation, version);
            }
        }
        inner.storage.durable_version = inner.storage.durable_version.max(version);
        inner.pushes.push(PushRecord {
            prev_version,
            version,
            committed_version,
            messages,
        });
        Ok(version)
    }

    async fn confirm_epoch_live(&self) -> anyhow::Result<()> {
        self.inner.lock().confirm_count += 1;
        Ok(())
    }

    async fn pop_txs(&self, up_to: Version, locality: i8) -> anyhow::Result<()> {
        self.inner.lock().pops.push((up_to, locality));
        Ok(())
    }

    async fn queuing_metrics(&self) -> anyhow::Result<Vec<Version>> {
        Ok(self.inner.lock().remote_durable.clone())
    }
}

struct RateKeeperInner {
    transaction_rate: f64,
    batch_transaction_rate: f64,
    lease_duration: f64,
    health: HealthMetrics,
    throttled_tags: ThrottledTagMap,
    rate_requests: Vec<GetRateInfoRequest>,
    cost_reports: Vec<ReportCommitCostRequest>,
}

/// Hands out configured rates with a lease; records what it is told.
pub struct LocalRateKeeper {
    inner: Mutex<RateKeeperInner>,
}

impl LocalRateKeeper {
    pub fn new(transaction_rate: f64, batch_transaction_rate: f64) -> Self {
        Self {
            inner: Mutex::new(RateKeeperInner {
                transaction_rate,
                batch_transaction_rate,
                lease_duration: 1.0,
                health: HealthMetrics::default(),
                throttled_tags: HashMap::new(),
                rate_requests: Vec::new(),
                cost_reports: Vec::new(),
            }),
        }
    }

    pub fn set_rates(&self, transaction_rate: f64, batch_transaction_rate: f64) {
        let mut inner = self.inner.lock();
        inner.transaction_rate = transaction_rate;
        inner.batch_transaction_rate = batch_transaction_rate;
    }

    pub fn set_throttle(
        &self,
        priority: TransactionPriority,
        tag: &str,
        tps_rate: f64,
        expiration: f64,
    ) {
        self.inner
            .lock()
            .throttled_tags
            .entry(priority)
            .or_default()
            .insert(tag.to_string(), ClientTagThrottleLimits { tps_rate, expiration });
    }

    pub fn cost_reports(&self) -> Vec<ReportCommitCostRequest> {
        self.inner.lock().cost_reports.clone()
    }

    pub fn rate_requests(&self) -> Vec<GetRateInfoRequest> {
        self.inner.lock().rate_requests.clone()
    }
}

#[async_trait]
impl RateKeeperClient for LocalRateKeeper {
    async fn get_rate_info(&self, req: GetRateInfoRequest) -> anyhow::Result<GetRateInfoReply> {
        let mut inner = self.inner.lock();
        inner.rate_requests.push(req);
        Ok(GetRateInfoReply {
            transaction_rate: inner.transaction_rate,
            batch_transaction_rate: inner.batch_transaction_rate,
            lease_duration: inner.lease_duration,
            health_metrics: inner.health,
            throttled_tags: Some(inner.throttled_tags.clone()),
        })
    }

    async fn report_commit_cost(&self, req: ReportCommitCostRequest) -> anyhow::Result<()> {
        self.inner.lock().cost_reports.push(req);
        Ok(())
    }
}

/// Static shard metrics and always-safe exclusion checks.
pub struct LocalDataDistributor {
    pub mid_shard_size: i64,
}

#[async_trait]
impl DataDistributorClient for LocalDataDistributor {
    async fn get_metrics(
        &self,
        _range: KeyRange,
        _shard_limit: usize,
    ) -> anyhow::Result<GetDDMetricsReply> {
        Ok(GetDDMetricsReply {
            storage_metrics: Vec::new(),
            mid_shard_size: Some(self.mid_shard_size),
        })
    }

    async fn exclusion_safety_check(&self, _exclusions: Vec<String>) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn snapshot(&self, _payload: Vec<u8>, _snap_id: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct LocalClusterConfig {
    pub knobs: Arc<Knobs>,
    pub resolver_count: usize,
    pub storage_server_count: usize,
    pub recovery_version: Version,
    pub grv_proxy_count: usize,
    /// Batch-priority rate the rate keeper hands out.
    pub batch_transaction_rate: f64,
}

impl Default for LocalClusterConfig {
    fn default() -> Self {
        Self {
            knobs: Arc::new(Knobs::default()),
            resolver_count: 1,
            storage_server_count: 3,
            recovery_version: 1_000_000,
            grv_proxy_count: 1,
            batch_transaction_rate: 1_000.0,
        }
    }
}

/// One commit server, one GRV server and in-process collaborators, wired
/// together and primed with an initial state snapshot.
pub struct LocalCluster {
    pub master: Arc<LocalMaster>,
    pub resolvers: Vec<Arc<LocalResolver>>,
    pub log: Arc<LocalLogSystem>,
    pub rate_keeper: Arc<LocalRateKeeper>,
    pub data_distributor: Arc<LocalDataDistributor>,
    pub grv: GrvProxyHandle,
    pub commit: CommitProxyHandle,
}

impl LocalCluster {
    pub async fn start(config: LocalClusterConfig) -> Self {
        let recovery = config.recovery_version;
        let master = Arc::new(LocalMaster::new(recovery));
        let resolvers: Vec<Arc<LocalResolver>> = (0..config.resolver_count.max(1))
            .map(|_| {
                Arc::new(LocalResolver::new(
                    recovery,
                    config.knobs.max_write_transaction_life_versions,
                ))
            })
            .collect();
        let log = Arc::new(LocalLogSystem::new(recovery));
        let rate_keeper = Arc::new(LocalRateKeeper::new(
            10_000.0,
            config.batch_transaction_rate,
        ));
        let data_distributor = Arc::new(LocalDataDistributor {
            mid_shard_size: config.knobs.min_shard_bytes,
        });

        let commit = spawn_commit_proxy(
            CommitProxyConfig {
                id: 1,
                knobs: config.knobs.clone(),
                commit_proxy_count: 1,
                recovery_transaction_version: recovery,
            },
            master.clone(),
            resolvers
                .iter()
                .map(|r| r.clone() as Arc<dyn ResolverClient>)
                .collect(),
            log.clone(),
            rate_keeper.clone(),
            data_distributor.clone(),
            Vec::new(),
        );
        let grv = spawn_grv_proxy(
            GrvProxyConfig {
                id: 2,
                knobs: config.knobs.clone(),
                grv_proxy_count: config.grv_proxy_count,
            },
            master.clone(),
            log.clone(),
            rate_keeper.clone(),
            data_distributor.clone(),
        );

        // Recovery snapshot: a storage fleet all in one locality, and the
        // whole keyspace assigned to it.
        let server_ids: Vec<u64> = (1..=config.storage_server_count.max(1) as u64).collect();
        let mut snapshot = Vec::new();
        for (index, id) in server_ids.iter().enumerate() {
            snapshot.push((keys::server_list_key_for(*id), vec![1]));
            snapshot.push((
                keys::server_tag_key_for(*id),
                keys::encode_server_tag_value(Tag::new(0, index as u16)),
            ));
        }
        snapshot.push((keys::tag_locality_list_key_for(b"dc0"), keys::encode_tag_locality_value(0)));
        snapshot.push((
            keys::key_servers_key(b""),
            keys::encode_key_servers_value(&server_ids, &[]),
        ));

        let (ack_tx, ack_rx) = oneshot::channel();
        commit
            .txn_state
            .send(TxnStateRequest {
                sequence: 0,
                last: true,
                data: snapshot,
                reply: ack_tx,
            })
            .expect("commit server alive at startup");
        let _ = ack_rx.await;

        // Split resolver ownership evenly when there is more than one.
        if resolvers.len() > 1 {
            let moves = (1..resolvers.len())
                .map(|index| {
                    let split = vec![b'a' + (index * 25 / resolvers.len()) as u8];
                    ResolverMove {
                        range: KeyRange::new(split, keys::all_keys().end),
                        dest: index,
                    }
                })
                .collect();
            master.queue_resolver_moves(moves, recovery);
        }

        // The first (possibly empty) commit batch signals valid state.
        commit.data.valid_state.when_at_least(true).await;

        Self {
            master,
            resolvers,
            log,
            rate_keeper,
            data_distributor,
            grv,
            commit,
        }
    }

    pub fn client(&self) -> LocalTransactionClient {
        LocalTransactionClient {
            grv: self.grv.requests.clone(),
            commits: self.commit.commits.clone(),
            log: self.log.clone(),
        }
    }
}

/// Channel endpoints a transaction needs.
#[derive(Clone)]
pub struct LocalTransactionClient {
    grv: tokio::sync::mpsc::UnboundedSender<GetReadVersionRequest>,
    commits: tokio::sync::mpsc::UnboundedSender<CommitTransactionRequest>,
    log: Arc<LocalLogSystem>,
}

impl LocalTransactionClient {
    pub fn begin(&self) -> LocalTransaction {
        LocalTransaction {
            client: self.clone(),
            priority: TransactionPriority::Default,
            causal_read_risky: false,
            lock_aware: false,
            report_conflicting_keys: false,
            tags: Vec::new(),
            read_version: None,
            grv_reply: None,
            mutations: Vec::new(),
            read_conflict_ranges: Vec::new(),
            write_conflict_ranges: Vec::new(),
        }
    }
}

/// A read-your-writes transaction against the local cluster.
pub struct LocalTransaction {
    client: LocalTransactionClient,
    pub priority: TransactionPriority,
    pub causal_read_risky: bool,
    pub lock_aware: bool,
    pub report_conflicting_keys: bool,
    pub tags: Vec<(TransactionTag, u64)>,
    read_version: Option<Version>,
    grv_reply: Option<GetReadVersionReply>,
    mutations: Vec<Mutation>,
    read_conflict_ranges: Vec<KeyRange>,
    write_conflict_ranges: Vec<KeyRange>,
}

impl LocalTransaction {
    /// Fetch (or return the already-fetched) read version.
    pub async fn get_read_version(&mut self) -> Result<Version, ProxyError> {
        if let Some(version) = self.read_version {
            return Ok(version);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.client
            .grv
            .send(GetReadVersionRequest {
                priority: self.priority,
                transaction_count: 1,
                causal_read_risky: self.causal_read_risky,
                use_min_known_committed_version: false,
                tags: self.tags.clone(),
                debug_id: None,
                reply: reply_tx,
            })
            .map_err(|_| ProxyError::WorkerRemoved)?;
        let reply = reply_rx.await.map_err(|_| ProxyError::WorkerRemoved)??;
        self.read_version = Some(reply.version);
        self.grv_reply = Some(reply.clone());
        Ok(reply.version)
    }

    /// The full reply of the version request, for throttle inspection.
    pub async fn read_version_reply(&mut self) -> Result<GetReadVersionReply, ProxyError> {
        self.get_read_version().await?;
        Ok(self.grv_reply.clone().expect("reply cached with version"))
    }

    pub fn set_read_version(&mut self, version: Version) {
        self.read_version = Some(version);
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        self.mutations.push(Mutation::Set {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        self.write_conflict_ranges.push(KeyRange::single_key(key));
    }

    pub fn clear_range(&mut self, begin: &[u8], end: &[u8]) {
        self.mutations.push(Mutation::ClearRange {
            begin: begin.to_vec(),
            end: end.to_vec(),
        });
        self.write_conflict_ranges
            .push(KeyRange::new(begin.to_vec(), end.to_vec()));
    }

    pub fn atomic(&mut self, op: AtomicOp, key: &[u8], param: &[u8]) {
        self.mutations.push(Mutation::Atomic {
            op,
            key: key.to_vec(),
            param: param.to_vec(),
        });
        self.write_conflict_ranges.push(KeyRange::single_key(key));
    }

    pub fn set_versionstamped_key(&mut self, key: &[u8], value: &[u8]) {
        self.mutations.push(Mutation::SetVersionstampedKey {
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    pub fn add_read_conflict_range(&mut self, begin: &[u8], end: &[u8]) {
        self.read_conflict_ranges
            .push(KeyRange::new(begin.to_vec(), end.to_vec()));
    }

    /// Read one key at the snapshot, seeing this transaction's own writes.
    pub async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, ProxyError> {
        let version = self.get_read_version().await?;
        let base = self.client.log.read(key, version)?;
        self.read_conflict_ranges.push(KeyRange::single_key(key));
        Ok(overlay(base, key, &self.mutations))
    }

    /// Range read with a limit, seeing this transaction's own writes.
    pub async fn get_range(
        &mut self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<(Vec<(Key, Vec<u8>)>, bool), ProxyError> {
        let version = self.get_read_version().await?;
        let range = KeyRange::new(begin.to_vec(), end.to_vec());
        // Over-read so the limit applies after the overlay.
        let (base, base_more) = self.client.log.read_range(&range, version, usize::MAX)?;
        let mut merged: BTreeMap<Key, Vec<u8>> = base.into_iter().collect();
        for m in &self.mutations {
            match m {
                Mutation::Set { key, value } if range.contains_key(key) => {
                    merged.insert(key.clone(), value.clone());
                }
                Mutation::ClearRange { begin, end } => {
                    let doomed: Vec<Key> = merged
                        .range(begin.clone()..end.clone())
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        merged.remove(&key);
                    }
                }
                Mutation::Atomic { op, key, param } if range.contains_key(key) => {
                    let existing = merged.get(key).cloned().unwrap_or_default();
                    merged.insert(key.clone(), op.apply(&existing, param));
                }
                _ => {}
            }
        }
        self.read_conflict_ranges.push(range);
        let total = merged.len();
        let out: Vec<(Key, Vec<u8>)> = merged.into_iter().take(limit).collect();
        Ok((out, base_more || total > limit))
    }

    /// Submit the transaction and wait for its verdict.
    pub async fn commit(&mut self) -> Result<CommitReply, ProxyError> {
        let read_snapshot = self.get_read_version().await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = CommitTransactionRequest {
            transaction: CommitTransaction {
                read_snapshot,
                mutations: std::mem::take(&mut self.mutations),
                read_conflict_ranges: std::mem::take(&mut self.read_conflict_ranges),
                write_conflict_ranges: std::mem::take(&mut self.write_conflict_ranges),
                report_conflicting_keys: self.report_conflicting_keys,
            },
            lock_aware: self.lock_aware,
            first_in_batch: false,
            tag_set: if self.tags.is_empty() {
                None
            } else {
                Some(self.tags.iter().map(|(tag, _)| tag.clone()).collect())
            },
            commit_cost_estimation: None,
            debug_id: None,
            reply: reply_tx,
        };
        self.client
            .commits
            .send(request)
            .map_err(|_| ProxyError::CommitUnknownResult)?;
        // A dropped reply channel after submission means the outcome is
        // genuinely unknown.
        reply_rx.await.map_err(|_| ProxyError::CommitUnknownResult)?
    }
}

/// Apply this transaction's own mutations on top of a stored value.
fn overlay(base: Option<Vec<u8>>, key: &[u8], mutations: &[Mutation]) -> Option<Vec<u8>> {
    let mut current = base;
    for m in mutations {
        match m {
            Mutation::Set { key: k, value } if k.as_slice() == key => {
                current = Some(value.clone());
            }
            Mutation::ClearRange { begin, end } => {
                if KeyRange::new(begin.clone(), end.clone()).contains_key(key) {
                    current = None;
                }
            }
            Mutation::Atomic { key: k, op, param } if k.as_slice() == key => {
                let existing = current.unwrap_or_default();
                current = Some(op.apply(&existing, param));
            }
            _ => {}
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_applies_in_order() {
        let mutations = vec![
            Mutation::Set { key: b"k".to_vec(), value: b"1".to_vec() },
            Mutation::ClearRange { begin: b"a".to_vec(), end: b"z".to_vec() },
            Mutation::Atomic { op: AtomicOp::Add, key: b"k".to_vec(), param: vec![5] },
        ];
        // Set, cleared, then atomic-add against a missing value.
        assert_eq!(overlay(None, b"k", &mutations), Some(vec![5]));
    }

    #[test]
    fn resolver_conflicts_on_overlapping_later_write() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            let resolver = LocalResolver::new(0, 5_000_000);

            // A write to "a" commits at version 100.
            let writer = ResolveTransactionBatchRequest {
                prev_version: 90,
                version: 100,
                last_received_version: 0,
                transactions: vec![vellum_core::messages::ResolverTransaction {
                    read_snapshot: 50,
                    write_conflict_ranges: vec![KeyRange::single_key(b"a")],
                    ..Default::default()
                }],
                txn_state_transactions: Vec::new(),
                debug_id: None,
            };
            let reply = resolver.resolve(writer).await.unwrap();
            assert_eq!(reply.committed, vec![CommitStatus::Committed]);

            // A reader with a snapshot before that write conflicts; one with
            // a snapshot after does not.
            let readers = ResolveTransactionBatchRequest {
                prev_version: 100,
                version: 200,
                last_received_version: 100,
                transactions: vec![
                    vellum_core::messages::ResolverTransaction {
                        read_snapshot: 50,
                        read_conflict_ranges: vec![KeyRange::single_key(b"a")],
                        ..Default::default()
                    },
                    vellum_core::messages::ResolverTransaction {
                        read_snapshot: 150,
                        read_conflict_ranges: vec![KeyRange::single_key(b"a")],
                        ..Default::default()
                    },
                ],
                txn_state_transactions: Vec::new(),
                debug_id: None,
            };
            let reply = resolver.resolve(readers).await.unwrap();
            assert_eq!(
                reply.committed,
                vec![CommitStatus::Conflict, CommitStatus::Committed]
            );
            assert_eq!(reply.conflicting_key_ranges[0], vec![0]);
        });
    }

    #[test]
    fn resolver_reports_too_old_reads() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            let resolver = LocalResolver::new(1_000_000, 5_000_000);
            let req = ResolveTransactionBatchRequest {
                prev_version: 1_000_000,
                version: 1_001_000,
                last_received_version: 0,
                transactions: vec![vellum_core::messages::ResolverTransaction {
                    read_snapshot: 1,
                    read_conflict_ranges: vec![KeyRange::single_key(b"a")],
                    ..Default::default()
                }],
                txn_state_transactions: Vec::new(),
                debug_id: None,
            };
            let reply = resolver.resolve(req).await.unwrap();
            assert_eq!(reply.committed, vec![CommitStatus::TooOld]);
        });
    }
}
