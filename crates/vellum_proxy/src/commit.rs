//! The five-phase commit pipeline.
//!
//! Batches flow through pre-resolution, resolution, post-resolution,
//! logging and reply. Two notified watermarks keep the order-sensitive
//! phases FIFO across overlapping batches: a batch may not take a commit
//! version before its predecessor has dispatched resolution, and may not
//! process verdicts before its predecessor has handed its push to the log.

use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use vellum_core::interfaces::{LogSystemClient, MasterClient, RateKeeperClient, ResolverClient};
use vellum_core::keys;
use vellum_core::messages::{
    encode_mutation, CommitCost, CommitReply, CommitTransactionRequest, GetCommitVersionRequest,
    ReportCommitCostRequest, ReportRawCommittedVersionRequest, ResolveTransactionBatchReply,
    StorageTagCostMap, TaggedMessage,
};
use vellum_core::time::now_seconds;
use vellum_core::types::{
    CommitStatus, Key, KeyRange, Mutation, Tag, TransactionTag, Version, TAG_LOCALITY_REMOTE_LOG,
    TAG_LOCALITY_TXS,
};
use vellum_core::{Notified, NotifiedVersion, ProxyError};

use crate::knobs::Knobs;
use crate::metadata::{apply_metadata_mutations, has_backup_ranges, RoutingState};
use crate::push::LogPushData;
use crate::stats::{add, bump, CommitProxyStats, Gauge};
use crate::txn_state::{CommitMessage, TxnStateStore, TxsPopState};
use crate::util::{delay, delay_jittered};

pub struct CommitProxyConfig {
    pub id: u64,
    pub knobs: Arc<Knobs>,
    /// Peer commit servers, for batch-size scaling.
    pub commit_proxy_count: usize,
    /// Version the current epoch recovered at; the committed-version
    /// watermark starts here.
    pub recovery_transaction_version: Version,
}

/// Mutable fields too small for their own locks.
#[derive(Debug)]
pub struct VolatileState {
    pub locked: bool,
    pub metadata_version: Option<Vec<u8>>,
    pub commit_batch_interval: f64,
    pub last_commit_time: f64,
    pub last_commit_latency: f64,
    pub last_start_commit: f64,
    pub last_coalesce_time: f64,
}

/// Shared server state for the commit role.
pub struct CommitData {
    pub id: u64,
    pub knobs: Arc<Knobs>,
    pub master: Arc<dyn MasterClient>,
    pub resolvers: Vec<Arc<dyn ResolverClient>>,
    pub log_system: Arc<dyn LogSystemClient>,
    pub stats: CommitProxyStats,

    /// Highest version known fully durable.
    pub committed_version: NotifiedVersion,
    pub min_known_committed_version: AtomicI64,
    /// Version at which the transaction-state store is up to date.
    pub version: AtomicI64,
    /// Signaled once the store and `version` are meaningful; read paths gate
    /// on this.
    pub valid_state: Notified<bool>,

    pub store: Mutex<TxnStateStore>,
    pub routing: Mutex<RoutingState>,
    pub volatile: Mutex<VolatileState>,
    pub commit_compute_per_operation: Mutex<Vec<f64>>,

    pub latest_local_commit_batch_resolving: NotifiedVersion,
    pub latest_local_commit_batch_logging: NotifiedVersion,
    local_commit_batches_started: AtomicI64,
    commit_version_request_number: AtomicU64,
    most_recent_processed_request_number: AtomicU64,

    pub commit_batches_mem: Gauge,
    pub pops: Mutex<TxsPopState>,
    pub ss_tag_commit_cost: Mutex<StorageTagCostMap>,

    /// Fatal-error rendezvous: the batch that dies delivers the reason, the
    /// core loop stops accepting work.
    pub fatal: mpsc::UnboundedSender<ProxyError>,
}

impl CommitData {
    pub fn new(
        config: &CommitProxyConfig,
        master: Arc<dyn MasterClient>,
        resolvers: Vec<Arc<dyn ResolverClient>>,
        log_system: Arc<dyn LogSystemClient>,
        fatal: mpsc::UnboundedSender<ProxyError>,
    ) -> Self {
        let knobs = config.knobs.clone();
        debug_assert!(
            knobs.max_read_transaction_life_versions <= knobs.max_versions_in_flight
        );
        Self {
            id: config.id,
            master,
            resolvers,
            log_system,
            stats: CommitProxyStats::default(),
            committed_version: NotifiedVersion::new(config.recovery_transaction_version),
            min_known_committed_version: AtomicI64::new(0),
            version: AtomicI64::new(0),
            valid_state: Notified::new(false),
            store: Mutex::new(TxnStateStore::new()),
            routing: Mutex::new(RoutingState::new()),
            volatile: Mutex::new(VolatileState {
                locked: false,
                metadata_version: None,
                commit_batch_interval: knobs.commit_transaction_batch_interval_min,
                last_commit_time: 0.0,
                last_commit_latency: knobs.required_min_recovery_duration,
                last_start_commit: 0.0,
                last_coalesce_time: 0.0,
            }),
            commit_compute_per_operation: Mutex::new(vec![0.0; knobs.proxy_compute_buckets]),
            latest_local_commit_batch_resolving: NotifiedVersion::new(0),
            latest_local_commit_batch_logging: NotifiedVersion::new(0),
            local_commit_batches_started: AtomicI64::new(0),
            commit_version_request_number: AtomicU64::new(1),
            most_recent_processed_request_number: AtomicU64::new(0),
            commit_batches_mem: Gauge::default(),
            pops: Mutex::new(TxsPopState::default()),
            ss_tag_commit_cost: Mutex::new(StorageTagCostMap::default()),
            knobs,
            fatal,
        }
    }
}

/// Cost model for a write, matching the client's estimation.
pub fn write_operation_cost(bytes: usize) -> u64 {
    (bytes as u64) / 16_384 + 1
}

/// Accumulate a sampled cost against every tag of the transaction for one
/// storage server.
fn update_ss_tag_cost(
    costs: &mut StorageTagCostMap,
    ss_id: u64,
    tag_set: &Option<Vec<TransactionTag>>,
    cost: u64,
) {
    let Some(tags) = tag_set else { return };
    let per_server = costs.entry(ss_id).or_default();
    for tag in tags {
        let item = per_server.entry(tag.clone()).or_insert(CommitCost::default());
        item.ops += 1;
        item.cost += cost;
    }
}

/// Accumulates incoming commits into batches bounded by count, bytes and
/// time. Oversize requests are cut into their own batch; requests that would
/// blow the global in-flight memory cap are shed immediately.
pub async fn commit_batcher(
    data: Arc<CommitData>,
    out: mpsc::Sender<(Vec<CommitTransactionRequest>, i64)>,
    mut requests: mpsc::UnboundedReceiver<CommitTransactionRequest>,
    desired_bytes: usize,
) {
    let knobs = data.knobs.clone();
    let mem_limit = knobs.commit_batches_memory_limit();
    let commit_batch_interval = data.volatile.lock().commit_batch_interval;
    delay_jittered(commit_batch_interval).await;

    let mut last_batch = 0.0f64;
    loop {
        let mut batch: Vec<CommitTransactionRequest> = Vec::new();
        let mut batch_bytes: i64 = 0;

        let timeout = tokio::time::sleep(std::time::Duration::from_secs_f64(
            knobs.max_commit_batch_interval,
        ));
        tokio::pin!(timeout);

        let mut closed = false;
        loop {
            tokio::select! {
                _ = &mut timeout => break,
                maybe_req = requests.recv() => {
                    let Some(req) = maybe_req else { closed = true; break };
                    let bytes = req.expected_size() as i64;

                    if data.commit_batches_mem.get() + bytes > mem_limit {
                        bump(&data.stats.txn_commit_errors);
                        let _ = req.reply.send(Err(ProxyError::ProxyMemoryLimitExceeded));
                        tracing::warn!(
                            id = data.id,
                            mem_bytes = data.commit_batches_mem.get(),
                            mem_limit,
                            "commit batch memory threshold exceeded"
                        );
                        continue;
                    }
                    bump(&data.stats.txn_commit_in);

                    if batch.is_empty() {
                        let interval = data.volatile.lock().commit_batch_interval;
                        let wait = if now_seconds() - last_batch > interval {
                            knobs.commit_transaction_batch_interval_from_idle
                        } else {
                            interval - (now_seconds() - last_batch)
                        };
                        timeout.as_mut().reset(tokio::time::Instant::now()
                            + std::time::Duration::from_secs_f64(wait.max(0.0)));
                    }

                    if (batch_bytes + bytes > knobs.transaction_size_limit as i64
                        || req.first_in_batch)
                        && !batch.is_empty()
                    {
                        if out.send((std::mem::take(&mut batch), batch_bytes)).await.is_err() {
                            return;
                        }
                        last_batch = now_seconds();
                        let interval = data.volatile.lock().commit_batch_interval;
                        timeout.as_mut().reset(tokio::time::Instant::now()
                            + std::time::Duration::from_secs_f64(interval));
                        batch_bytes = 0;
                    }

                    data.commit_batches_mem.add(bytes);
                    batch.push(req);
                    batch_bytes += bytes;
                    if batch.len() >= knobs.commit_transaction_batch_count_max
                        || batch_bytes >= desired_bytes as i64
                    {
                        break;
                    }
                }
            }
        }

        if out.send((batch, batch_bytes)).await.is_err() || closed {
            return;
        }
        last_batch = now_seconds();
    }
}

/// Accepts cut batches and runs the pipeline on them. Empty batches keep
/// versions advancing at the idle cadence but never stack up.
pub async fn commit_loop(
    data: Arc<CommitData>,
    mut batches: mpsc::Receiver<(Vec<CommitTransactionRequest>, i64)>,
    mut fatal: mpsc::UnboundedReceiver<ProxyError>,
) {
    let knobs = data.knobs.clone();
    let mut last_commit = 0.0f64;
    let mut last_complete: Option<JoinHandle<()>> = None;
    loop {
        tokio::select! {
            err = fatal.recv() => {
                if let Some(err) = err {
                    tracing::error!(id = data.id, error = %err, "commit server terminated");
                }
                return;
            }
            maybe_batch = batches.recv() => {
                let Some((trs, batch_bytes)) = maybe_batch else { return };
                let idle_due = now_seconds() - last_commit >= knobs.max_commit_batch_interval;
                if !trs.is_empty() || idle_due {
                    let in_flight = last_complete
                        .as_ref()
                        .map(|handle| !handle.is_finished())
                        .unwrap_or(false);
                    if !trs.is_empty() || !in_flight {
                        last_commit = now_seconds();
                        // Number the batch here so arrival order and phase
                        // order agree even when task startup interleaves.
                        let context = CommitBatchContext::new(data.clone(), trs);
                        last_complete = Some(tokio::spawn(run_commit_batch(
                            data.clone(),
                            context,
                            batch_bytes,
                        )));
                    }
                }
            }
        }
    }
}

async fn run_commit_batch(data: Arc<CommitData>, context: CommitBatchContext, batch_bytes: i64) {
    let result = context.run().await;
    data.commit_batches_mem.add(-batch_bytes);
    if let Err(err) = result {
        bump(&data.stats.txn_commit_errors);
        tracing::error!(id = data.id, error = %err, "commit batch failed");
        if err.is_fatal() {
            let _ = data.fatal.send(err);
        }
    }
}

struct CommitBatchContext {
    data: Arc<CommitData>,
    trs: Vec<CommitTransactionRequest>,
    start_time: f64,
    local_batch_number: Version,
    to_commit: LogPushData,
    batch_operations: usize,
    latency_bucket: usize,

    commit_version: Version,
    prev_version: Version,
    release_delay: f64,
    release_future: Option<JoinHandle<()>>,

    transaction_resolver_map: Vec<Vec<usize>>,
    read_range_index_map: Vec<Vec<Vec<usize>>>,
    resolution: Vec<ResolveTransactionBatchReply>,

    is_my_first_batch: bool,
    old_coordinators: Option<Vec<u8>>,
    store_commits: Vec<CommitMessage>,
    store_message: Option<CommitMessage>,

    committed: Vec<CommitStatus>,
    locked: bool,
    locked_after: bool,
    metadata_version_after: Option<Vec<u8>>,
    commit_count: usize,
    next_tr: Vec<usize>,

    mutation_count: usize,
    mutation_bytes: usize,
    yield_bytes: usize,
    log_range_mutations: BTreeMap<Key, Vec<Mutation>>,

    compute_start: f64,
    compute_duration: f64,
    logging: Option<JoinHandle<anyhow::Result<Version>>>,
    commit_start_time: f64,
}

impl CommitBatchContext {
    fn new(data: Arc<CommitData>, trs: Vec<CommitTransactionRequest>) -> Self {
        let knobs = &data.knobs;
        let local_batch_number = data.local_commit_batches_started.fetch_add(1, Ordering::Relaxed) + 1;

        let mut batch_operations = 0usize;
        let mut batch_bytes = 0usize;
        for tr in &trs {
            batch_operations += tr.transaction.mutations.len();
            batch_bytes += tr.transaction.expected_size();
        }
        let latency_bucket = if batch_operations != 0 {
            (knobs.proxy_compute_buckets * batch_bytes
                / (batch_operations * (knobs.value_size_limit + knobs.key_size_limit)))
                .min(knobs.proxy_compute_buckets - 1)
        } else {
            0
        };

        let committed = vec![CommitStatus::Conflict; trs.len()];
        Self {
            data,
            trs,
            start_time: now_seconds(),
            local_batch_number,
            to_commit: LogPushData::new(),
            batch_operations,
            latency_bucket,
            commit_version: 0,
            prev_version: 0,
            release_delay: 0.0,
            release_future: None,
            transaction_resolver_map: Vec::new(),
            read_range_index_map: Vec::new(),
            resolution: Vec::new(),
            is_my_first_batch: false,
            old_coordinators: None,
            store_commits: Vec::new(),
            store_message: None,
            committed,
            locked: false,
            locked_after: false,
            metadata_version_after: None,
            commit_count: 0,
            next_tr: Vec::new(),
            mutation_count: 0,
            mutation_bytes: 0,
            yield_bytes: 0,
            log_range_mutations: BTreeMap::new(),
            compute_start: 0.0,
            compute_duration: 0.0,
            logging: None,
            commit_start_time: 0.0,
        }
    }

    async fn run(mut self) -> Result<(), ProxyError> {
        bump(&self.data.stats.commit_batch_in);
        tokio::task::yield_now().await;
        self.preresolution().await?;
        self.resolve().await?;
        self.post_resolution().await?;
        self.logging_phase().await?;
        self.reply_phase().await?;
        Ok(())
    }

    /// Phase 1: wait our turn, schedule the release token, take a commit
    /// version from the master and fold in resolver-range moves.
    async fn preresolution(&mut self) -> Result<(), ProxyError> {
        let data = self.data.clone();
        let knobs = &data.knobs;

        data.latest_local_commit_batch_resolving
            .when_at_least(self.local_batch_number - 1)
            .await;

        let compute_per_operation =
            data.commit_compute_per_operation.lock()[self.latency_bucket];
        self.release_delay = knobs
            .max_proxy_compute
            .min(self.batch_operations as f64 * compute_per_operation);

        let request_num = data
            .commit_version_request_number
            .fetch_add(1, Ordering::Relaxed);
        let reply = data
            .master
            .get_commit_version(GetCommitVersionRequest {
                request_num,
                most_recent_processed_request_num: data
                    .most_recent_processed_request_number
                    .load(Ordering::Relaxed),
            })
            .await
            .map_err(|_| ProxyError::MasterTlogFailed)?;
        data.most_recent_processed_request_number
            .store(reply.request_num, Ordering::Relaxed);

        add(&data.stats.txn_commit_version_assigned, self.trs.len() as u64);
        self.commit_version = reply.version;
        self.prev_version = reply.prev_version;

        if !reply.resolver_changes.is_empty() {
            let mut routing = data.routing.lock();
            for change in &reply.resolver_changes {
                routing.key_resolvers.modify(&change.range, |_, history| {
                    history.push_back((reply.resolver_changes_version, change.dest));
                });
            }
        }
        Ok(())
    }

    /// Phase 2: decompose the batch onto the resolvers, fan the requests out
    /// in parallel, and release the next batch into phase 1 concurrently.
    async fn resolve(&mut self) -> Result<(), ProxyError> {
        let data = self.data.clone();
        let resolver_count = data.resolvers.len();

        let mut requests = {
            let routing = data.routing.lock();
            let mut builder = crate::resolution::ResolutionRequestBuilder::new(
                &routing.key_resolvers,
                resolver_count,
                self.commit_version,
                self.prev_version,
                data.version.load(Ordering::Relaxed),
            );
            let mut conflict_range_count = 0usize;
            for (t, tr) in self.trs.iter_mut().enumerate() {
                builder.add_transaction(tr, t);
                conflict_range_count += tr.transaction.read_conflict_ranges.len()
                    + tr.transaction.write_conflict_ranges.len();
            }
            add(&data.stats.conflict_ranges, conflict_range_count as u64);
            self.transaction_resolver_map = builder.transaction_resolver_map;
            self.read_range_index_map = builder.read_range_index_map;
            builder.requests
        };

        for request in &requests[1..] {
            debug_assert_eq!(
                request.txn_state_transactions.len(),
                requests[0].txn_state_transactions.len()
            );
        }
        add(&data.stats.txn_commit_resolving, self.trs.len() as u64);

        let resolve_futures: Vec<_> = data
            .resolvers
            .iter()
            .cloned()
            .zip(requests.drain(..))
            .map(|(resolver, request)| async move { resolver.resolve(request).await })
            .collect();

        // Let the next batch take its commit version while resolution is on
        // the wire.
        self.release_future = Some(tokio::spawn(release_resolving_after(
            data.clone(),
            self.release_delay,
            self.local_batch_number,
        )));

        let replies = join_all(resolve_futures).await;
        self.resolution = replies
            .into_iter()
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(|_| ProxyError::MasterTlogFailed)?;
        Ok(())
    }

    /// Phase 3: apply peer metadata effects, combine verdicts, apply this
    /// batch's metadata and mutation routing, gate on the MVCC window, and
    /// hand the push to the log.
    async fn post_resolution(&mut self) -> Result<(), ProxyError> {
        let data = self.data.clone();
        let knobs = data.knobs.clone();

        data.latest_local_commit_batch_logging
            .when_at_least(self.local_batch_number - 1)
            .await;
        tokio::task::yield_now().await;
        self.compute_start = now_seconds();

        add(&data.stats.txn_commit_resolved, self.trs.len() as u64);

        self.is_my_first_batch = data.version.load(Ordering::Relaxed) == 0;
        self.old_coordinators = data.store.lock().read_value(keys::COORDINATORS_KEY);

        self.check_resolution_consistency()?;
        self.apply_metadata_effect();
        self.determine_committed();
        self.apply_metadata_to_committed()?;
        self.assign_mutations_to_storage_servers().await?;

        if !self.log_range_mutations.is_empty() {
            self.add_backup_mutations().await;
        }

        add(&data.stats.mutations, self.mutation_count as u64);
        add(&data.stats.mutation_bytes, self.mutation_bytes as u64);

        // Storage servers must never make versions durable that could still
        // be rolled back, so the span of semi-committed versions is capped
        // by the MVCC window.
        let gate = self.commit_version - knobs.max_read_transaction_life_versions;
        while data.committed_version.get() < gate {
            self.compute_duration += now_seconds() - self.compute_start;
            tokio::select! {
                _ = data.committed_version.when_at_least(gate) => {
                    tokio::task::yield_now().await;
                }
                _ = delay(knobs.proxy_spin_delay) => {
                    let reply = data
                        .master
                        .get_live_committed_version()
                        .await
                        .map_err(|_| ProxyError::MasterTlogFailed)?;
                    if reply.version > data.committed_version.get() {
                        let mut volatile = data.volatile.lock();
                        volatile.locked = reply.locked;
                        volatile.metadata_version = reply.metadata_version;
                        drop(volatile);
                        data.committed_version.set(reply.version);
                    }
                }
            }
            self.compute_start = now_seconds();
        }

        // The store's own messages ride along under the txs tag.
        let message = self
            .store_commits
            .last()
            .cloned()
            .ok_or_else(|| ProxyError::Internal("batch produced no store commit".into()))?;
        let mut first = true;
        for raw in &message.messages {
            if first {
                self.to_commit.add_tag(Tag::new(TAG_LOCALITY_TXS, 0));
            }
            self.to_commit.add_message(raw.clone(), !first);
            first = false;
        }
        self.store_message = Some(message);

        self.commit_start_time = now_seconds();
        data.volatile.lock().last_start_commit = self.commit_start_time;

        let push_messages: Vec<TaggedMessage> =
            std::mem::take(&mut self.to_commit).into_messages();
        let log_system = data.log_system.clone();
        let prev_version = self.prev_version;
        let commit_version = self.commit_version;
        let committed = data.committed_version.get();
        let min_kcv = data.min_known_committed_version.load(Ordering::Relaxed);
        self.logging = Some(tokio::spawn(async move {
            log_system
                .push(prev_version, commit_version, committed, min_kcv, push_messages)
                .await
        }));

        debug_assert_eq!(
            data.latest_local_commit_batch_logging.get(),
            self.local_batch_number - 1
        );
        data.latest_local_commit_batch_logging
            .set(self.local_batch_number);

        self.compute_duration += now_seconds() - self.compute_start;
        if self.compute_duration > knobs.min_proxy_compute && self.batch_operations > 0 {
            let per_operation = self.compute_duration / self.batch_operations as f64;
            let mut compute = data.commit_compute_per_operation.lock();
            let slot = &mut compute[self.latency_bucket];
            if per_operation <= *slot {
                *slot = per_operation;
            } else {
                *slot = knobs.proxy_compute_growth_rate * per_operation
                    + (1.0 - knobs.proxy_compute_growth_rate) * *slot;
            }
        }
        Ok(())
    }

    fn check_resolution_consistency(&self) -> Result<(), ProxyError> {
        for reply in &self.resolution[1..] {
            if reply.state_mutations.len() != self.resolution[0].state_mutations.len() {
                return Err(ProxyError::Internal(
                    "resolvers disagree on state mutation stream length".into(),
                ));
            }
            for (groups, reference) in reply
                .state_mutations
                .iter()
                .zip(self.resolution[0].state_mutations.iter())
            {
                if groups.len() != reference.len() {
                    return Err(ProxyError::Internal(
                        "resolvers disagree on state mutation group size".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Fold in metadata effects of versions committed by peer servers. A
    /// group applies iff every resolver marked it committed; the commit
    /// messages our store generates along the way belong to the peer that
    /// owns those versions, so they are discarded rather than pushed.
    fn apply_metadata_effect(&mut self) {
        let data = self.data.clone();
        let mut initial_state = self.is_my_first_batch;
        for version_index in 0..self.resolution[0].state_mutations.len() {
            for txn_index in 0..self.resolution[0].state_mutations[version_index].len() {
                let committed = self
                    .resolution
                    .iter()
                    .all(|reply| reply.state_mutations[version_index][txn_index].committed);
                if committed {
                    let mutations =
                        self.resolution[0].state_mutations[version_index][txn_index]
                            .mutations
                            .clone();
                    let mut store = data.store.lock();
                    let mut routing = data.routing.lock();
                    apply_metadata_mutations(
                        data.id,
                        &mutations,
                        &mut store,
                        &mut routing,
                        None,
                        false,
                    );
                }
            }

            let mut store = data.store.lock();
            self.store_commits.push(store.commit());

            if initial_state {
                initial_state = false;
                // Everything replayed so far predates this epoch's pushes.
                store.resync_log();
                for _ in self.store_commits.drain(..) {
                    store.acknowledge();
                }
            }
        }
    }

    /// Combine per-resolver verdicts; a transaction commits only if every
    /// resolver it touched agreed.
    fn determine_committed(&mut self) {
        let data = self.data.clone();
        debug_assert_eq!(self.transaction_resolver_map.len(), self.trs.len());

        self.next_tr = vec![0; self.resolution.len()];
        for t in 0..self.trs.len() {
            let mut commit = CommitStatus::Committed;
            for &r in &self.transaction_resolver_map[t] {
                commit = commit.min(self.resolution[r].committed[self.next_tr[r]]);
                self.next_tr[r] += 1;
            }
            self.committed[t] = commit;
        }
        for (r, reply) in self.resolution.iter().enumerate() {
            debug_assert_eq!(self.next_tr[r], reply.committed.len());
        }

        let (locked_value, must_contain) = {
            let mut store = data.store.lock();
            store.set_next_version(self.commit_version);
            (
                store.read_value(keys::DATABASE_LOCKED_KEY),
                store.read_value(keys::MUST_CONTAIN_SYSTEM_MUTATIONS_KEY),
            )
        };
        self.locked = locked_value.is_some_and(|v| !v.is_empty());

        if must_contain.is_some_and(|v| !v.is_empty()) {
            for t in 0..self.trs.len() {
                if self.committed[t] != CommitStatus::Committed {
                    continue;
                }
                let touches_system = self.trs[t].transaction.mutations.iter().any(|m| {
                    let key = match m {
                        Mutation::ClearRange { end, .. } => end.as_slice(),
                        other => other.key(),
                    };
                    key >= keys::NON_METADATA_SYSTEM_END
                });
                if !touches_system {
                    self.committed[t] = CommitStatus::Conflict;
                }
            }
        }
    }

    /// First pass over the winners: apply their metadata effects locally and
    /// emit the corresponding private log messages.
    fn apply_metadata_to_committed(&mut self) -> Result<(), ProxyError> {
        let data = self.data.clone();

        for t in 0..self.trs.len() {
            if self.committed[t] == CommitStatus::Committed
                && (!self.locked || self.trs[t].lock_aware)
            {
                self.commit_count += 1;
                let mut store = data.store.lock();
                let mut routing = data.routing.lock();
                apply_metadata_mutations(
                    data.id,
                    &self.trs[t].transaction.mutations,
                    &mut store,
                    &mut routing,
                    Some(&mut self.to_commit),
                    false,
                );
            }
        }

        {
            let mut store = data.store.lock();
            self.locked_after = store
                .read_value(keys::DATABASE_LOCKED_KEY)
                .is_some_and(|v| !v.is_empty());
            self.metadata_version_after = store.read_value(keys::METADATA_VERSION_KEY);
            self.store_commits.push(store.commit());
        }

        data.version.fetch_max(self.commit_version, Ordering::Relaxed);
        data.valid_state.set(true);
        debug_assert!(self.commit_version > 0);

        if !self.is_my_first_batch
            && data.store.lock().read_value(keys::COORDINATORS_KEY) != self.old_coordinators
        {
            // A new coordinator set takes effect through recovery; this
            // server's epoch is over.
            return Err(ProxyError::CoordinatorsChanged);
        }
        Ok(())
    }

    async fn maybe_yield(&mut self) {
        if self.yield_bytes > self.data.knobs.desired_total_bytes {
            self.yield_bytes = 0;
            self.compute_duration += now_seconds() - self.compute_start;
            tokio::task::yield_now().await;
            self.compute_start = now_seconds();
        }
    }

    /// Second pass over the winners: tag every mutation to its storage
    /// servers, sample commit costs, and intercept mutations for registered
    /// backup ranges.
    async fn assign_mutations_to_storage_servers(&mut self) -> Result<(), ProxyError> {
        let data = self.data.clone();
        let knobs = data.knobs.clone();
        let has_backup = has_backup_ranges(&data.routing.lock());

        for t in 0..self.trs.len() {
            if !(self.committed[t] == CommitStatus::Committed
                && (!self.locked || self.trs[t].lock_aware))
            {
                continue;
            }

            let mutations = std::mem::take(&mut self.trs[t].transaction.mutations);
            let tag_set = self.trs[t].tag_set.clone();
            let mut cost_estimation = self.trs[t].commit_cost_estimation.clone();
            let check_sample = cost_estimation.is_some();

            for (mutation_num, m) in mutations.iter().enumerate() {
                self.mutation_count += 1;
                let size = m.expected_size();
                self.mutation_bytes += size;
                self.yield_bytes += size;
                self.maybe_yield().await;

                match m {
                    Mutation::Set { key, .. } | Mutation::Atomic { key, .. } => {
                        let (tags, src) = {
                            let mut routing = data.routing.lock();
                            let tags = routing.tags_for_key(key);
                            let src = routing.key_info.range_containing(key).1.src.clone();
                            (tags, src)
                        };

                        if let Some(estimation) = cost_estimation.as_ref() {
                            // Expectation: one sample per commit_sample_cost
                            // of write cost.
                            let total = estimation.write_costs.max(1) as f64;
                            let cost = write_operation_cost(size);
                            let multiplier =
                                (total / knobs.commit_sample_cost.max(1) as f64).max(1.0);
                            let probability = multiplier * cost as f64 / total;
                            if rand::thread_rng().gen::<f64>() < probability {
                                let scaled = cost.max(knobs.commit_sample_cost);
                                let mut costs = data.ss_tag_commit_cost.lock();
                                for ss in &src {
                                    update_ss_tag_cost(&mut costs, *ss, &tag_set, scaled);
                                }
                            }
                        }

                        self.to_commit.add_tags(&tags);
                        if *data.routing.lock().cache_info.range_containing(key).1 {
                            self.to_commit.add_tag(Tag::cache());
                        }
                        self.to_commit.add_typed_message(m);
                    }
                    Mutation::ClearRange { begin, end } => {
                        let clear_range = KeyRange::new(begin.clone(), end.clone());
                        let intersecting: Vec<(KeyRange, crate::metadata::ServerCacheInfo)> = {
                            let routing = data.routing.lock();
                            routing
                                .key_info
                                .intersecting_ranges(&clear_range)
                                .into_iter()
                                .map(|(range, info)| (range, info.clone()))
                                .collect()
                        };

                        let sampled_clear_cost = cost_estimation.as_mut().and_then(|est| {
                            match est.clear_idx_costs.front() {
                                Some(&(idx, cost)) if idx == mutation_num => {
                                    est.clear_idx_costs.pop_front();
                                    Some(cost)
                                }
                                _ => None,
                            }
                        });

                        let mut all_tags: BTreeSet<Tag> = BTreeSet::new();
                        for (range, info) in &intersecting {
                            let tags = data.routing.lock().populate_tags(range, info);
                            all_tags.extend(tags);
                            if check_sample {
                                if let Some(cost) = sampled_clear_cost {
                                    let mut costs = data.ss_tag_commit_cost.lock();
                                    for ss in &info.src {
                                        update_ss_tag_cost(&mut costs, *ss, &tag_set, cost);
                                    }
                                }
                            }
                        }
                        let tags: Vec<Tag> = all_tags.into_iter().collect();
                        self.to_commit.add_tags(&tags);
                        if data.routing.lock().needs_cache_tag(&clear_range) {
                            self.to_commit.add_tag(Tag::cache());
                        }
                        self.to_commit.add_typed_message(m);
                    }
                    Mutation::SetVersionstampedKey { .. }
                    | Mutation::SetVersionstampedValue { .. } => {
                        return Err(ProxyError::Internal(
                            "versionstamped mutation survived resolution".into(),
                        ));
                    }
                }

                // Backup interception applies to normal keys plus the
                // metadata version marker.
                let backed_up = has_backup
                    && (keys::normal_keys().contains_key(m.key())
                        || m.key() == keys::METADATA_VERSION_KEY);
                if !backed_up {
                    continue;
                }
                match m {
                    Mutation::ClearRange { begin, end } => {
                        let mutation_range = KeyRange::new(begin.clone(), end.clone());
                        let clipped: Vec<(KeyRange, BTreeSet<Key>)> = {
                            let routing = data.routing.lock();
                            routing
                                .backup_keys
                                .intersecting_ranges(&mutation_range)
                                .into_iter()
                                .map(|(range, dests)| {
                                    (mutation_range.intersection(&range), dests.clone())
                                })
                                .collect()
                        };
                        for (range, destinations) in clipped {
                            if range.is_empty() || destinations.is_empty() {
                                continue;
                            }
                            let clipped_clear = Mutation::ClearRange {
                                begin: range.begin,
                                end: range.end,
                            };
                            for destination in destinations {
                                self.log_range_mutations
                                    .entry(destination)
                                    .or_default()
                                    .push(clipped_clear.clone());
                            }
                        }
                    }
                    _ => {
                        let destinations = {
                            let routing = data.routing.lock();
                            routing.backup_keys.range_containing(m.key()).1.clone()
                        };
                        for destination in destinations {
                            self.log_range_mutations
                                .entry(destination)
                                .or_default()
                                .push(m.clone());
                        }
                    }
                }
            }

            if let Some(estimation) = &self.trs[t].commit_cost_estimation {
                add(
                    &data.stats.txn_expensive_clear_cost_est_count,
                    estimation.expensive_cost_est_count,
                );
            }
        }
        Ok(())
    }

    /// Serialize the intercepted backup mutations as block-partitioned
    /// messages addressed to each backup destination's progress keyspace.
    async fn add_backup_mutations(&mut self) {
        let data = self.data.clone();
        let knobs = data.knobs.clone();
        let block = self.commit_version / knobs.log_range_block_size;
        let block_hash = {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            block.hash(&mut hasher);
            hasher.finish() as u8
        };

        for (destination, mutations) in std::mem::take(&mut self.log_range_mutations) {
            let mut value = Vec::new();
            for m in &mutations {
                let encoded = encode_mutation(m);
                value.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
                value.extend_from_slice(&encoded);
                self.yield_bytes += encoded.len();
                self.maybe_yield().await;
            }

            for (part, chunk) in value.chunks(knobs.mutation_block_size).enumerate() {
                let mut key = destination.clone();
                key.push(block_hash);
                key.extend_from_slice(&(self.commit_version as u64).to_be_bytes());
                key.extend_from_slice(&(part as u32).to_be_bytes());
                debug_assert!(key.starts_with(&destination));

                let tags = data.routing.lock().tags_for_key(&key);
                self.to_commit.add_tags(&tags);
                self.to_commit.add_typed_message(&Mutation::Set {
                    key,
                    value: chunk.to_vec(),
                });
            }
        }
    }

    /// Phase 4: wait for durability, then let the log shed old store
    /// messages.
    async fn logging_phase(&mut self) -> Result<(), ProxyError> {
        let data = self.data.clone();
        let logging = self
            .logging
            .take()
            .ok_or_else(|| ProxyError::Internal("logging phase without a push".into()))?;

        tokio::select! {
            result = logging => {
                let durable = result
                    .map_err(|_| ProxyError::MasterTlogFailed)?
                    .map_err(|_| ProxyError::MasterTlogFailed)?;
                data.min_known_committed_version.fetch_max(durable, Ordering::Relaxed);
            }
            // A later overlapping batch may already have driven durability
            // past us.
            _ = data.committed_version.when_at_least(self.commit_version + 1) => {}
        }

        {
            let mut volatile = data.volatile.lock();
            volatile.last_commit_latency = now_seconds() - self.commit_start_time;
            volatile.last_commit_time = volatile.last_commit_time.max(self.commit_start_time);
        }
        tokio::task::yield_now().await;

        if let Some(message) = &self.store_message {
            {
                let mut pops = data.pops.lock();
                if pops.pop_remote {
                    pops.record(
                        self.commit_version,
                        message.pop_to,
                        data.knobs.max_txs_pop_version_history,
                    );
                }
            }
            let log_system = data.log_system.clone();
            let pop_to = message.pop_to;
            tokio::spawn(async move {
                if let Err(err) = log_system.pop_txs(pop_to, TAG_LOCALITY_TXS).await {
                    tracing::warn!(error = ?err, "txs pop failed");
                }
            });
        }
        Ok(())
    }

    /// Phase 5: report to the master before advancing the local watermark,
    /// then answer every client and do periodic upkeep.
    async fn reply_phase(&mut self) -> Result<(), ProxyError> {
        let data = self.data.clone();
        let knobs = data.knobs.clone();

        // The master must learn of this commit before any client can see a
        // read version at or past it, else the next GRV could run backwards.
        if self.commit_version >= data.committed_version.get() {
            data.master
                .report_live_committed_version(ReportRawCommittedVersionRequest {
                    version: self.commit_version,
                    locked: self.locked_after,
                    metadata_version: self.metadata_version_after.clone(),
                    min_known_committed_version: data
                        .min_known_committed_version
                        .load(Ordering::Relaxed),
                })
                .await
                .map_err(|_| ProxyError::MasterTlogFailed)?;
        }
        if self.commit_version > data.committed_version.get() {
            let mut volatile = data.volatile.lock();
            volatile.locked = self.locked_after;
            volatile.metadata_version = self.metadata_version_after.clone();
            drop(volatile);
            data.committed_version.set(self.commit_version);
        }

        {
            let mut store = data.store.lock();
            for _ in self.store_commits.drain(..) {
                store.acknowledge();
            }
        }

        for counter in self.next_tr.iter_mut() {
            *counter = 0;
        }
        let trs = std::mem::take(&mut self.trs);
        for (t, tr) in trs.into_iter().enumerate() {
            if self.committed[t] == CommitStatus::Committed && (!self.locked || tr.lock_aware) {
                let _ = tr.reply.send(Ok(CommitReply {
                    version: self.commit_version,
                    batch_index: t as u16,
                    metadata_version: self.metadata_version_after.clone(),
                }));
            } else if self.committed[t] == CommitStatus::TooOld {
                let _ = tr.reply.send(Err(ProxyError::TransactionTooOld));
            } else if tr.transaction.report_conflicting_keys {
                let mut conflicting = Vec::new();
                for &r in &self.transaction_resolver_map[t] {
                    let local_index = self.next_tr[r];
                    for &range_index in &self.resolution[r].conflicting_key_ranges[local_index] {
                        conflicting.push(self.read_range_index_map[t][r][range_index]);
                    }
                }
                // A lock demotion can fail a transaction no resolver
                // flagged; there are no ranges to report then.
                let conflicting_ranges = if conflicting.is_empty() {
                    None
                } else {
                    Some(conflicting)
                };
                let _ = tr.reply.send(Err(ProxyError::NotCommitted { conflicting_ranges }));
            } else {
                let _ = tr.reply.send(Err(ProxyError::NotCommitted {
                    conflicting_ranges: None,
                }));
            }
            for &r in &self.transaction_resolver_map[t] {
                self.next_tr[r] += 1;
            }
        }

        bump(&data.stats.commit_batch_out);
        add(&data.stats.txn_commit_out, self.committed.len() as u64);
        add(
            &data.stats.txn_conflicts,
            (self.committed.len() - self.commit_count) as u64,
        );
        add(&data.stats.txn_commit_out_success, self.commit_count as u64);

        let coalesce_due = {
            let mut volatile = data.volatile.lock();
            if now_seconds() - volatile.last_coalesce_time > knobs.resolver_coalesce_time {
                volatile.last_coalesce_time = now_seconds();
                true
            } else {
                false
            }
        };
        if coalesce_due {
            let oldest = self.prev_version - knobs.max_write_transaction_life_versions;
            let mut routing = data.routing.lock();
            let before = routing.key_resolvers.len();
            routing.key_resolvers.modify(&keys::all_keys(), |_, history| {
                while history.len() > 1 && history[1].0 < oldest {
                    history.pop_front();
                }
                if let Some(front) = history.front_mut() {
                    if front.0 < oldest {
                        front.0 = 0;
                    }
                }
            });
            routing.key_resolvers.coalesce(&keys::all_keys());
            if routing.key_resolvers.len() != before {
                tracing::debug!(
                    id = data.id,
                    size = routing.key_resolvers.len(),
                    "coalesced key resolver map"
                );
            }
        }

        {
            let target =
                (now_seconds() - self.start_time) * knobs.commit_transaction_batch_interval_latency_fraction;
            let alpha = knobs.commit_transaction_batch_interval_smoother_alpha;
            let mut volatile = data.volatile.lock();
            volatile.commit_batch_interval = (target * alpha
                + volatile.commit_batch_interval * (1.0 - alpha))
                .clamp(
                    knobs.commit_transaction_batch_interval_min,
                    knobs.commit_transaction_batch_interval_max,
                );
        }

        if let Some(release) = self.release_future.take() {
            let _ = release.await;
        }
        Ok(())
    }
}

async fn release_resolving_after(data: Arc<CommitData>, release_delay: f64, batch_number: Version) {
    delay(release_delay).await;
    debug_assert_eq!(
        data.latest_local_commit_batch_resolving.get(),
        batch_number - 1
    );
    data.latest_local_commit_batch_resolving.set(batch_number);
}

/// Periodically hands accumulated per-storage-server tag costs to the rate
/// keeper. Samples are lossy by design, so a failed report just drops them.
pub async fn report_commit_cost_loop(data: Arc<CommitData>, rate_keeper: Arc<dyn RateKeeperClient>) {
    loop {
        delay(data.knobs.report_transaction_cost_estimation_delay).await;
        let costs = std::mem::take(&mut *data.ss_tag_commit_cost.lock());
        if costs.is_empty() {
            continue;
        }
        if let Err(err) = rate_keeper
            .report_commit_cost(ReportCommitCostRequest { ss_tag_cost: costs })
            .await
        {
            tracing::warn!(id = data.id, error = ?err, "commit cost report failed");
        }
    }
}

/// Paces remote txs pops against the durability floor reported by the
/// remote logs.
pub async fn monitor_remote_committed(data: Arc<CommitData>) {
    loop {
        match data.log_system.queuing_metrics().await {
            Ok(versions) if !versions.is_empty() => {
                data.pops.lock().pop_remote = true;
                let floor = versions.into_iter().min().unwrap_or(0);
                let to_pop = data.pops.lock().drain_durable(floor);
                for version in to_pop {
                    if let Err(err) = data
                        .log_system
                        .pop_txs(version, TAG_LOCALITY_REMOTE_LOG)
                        .await
                    {
                        tracing::warn!(error = ?err, "remote txs pop failed");
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(id = data.id, error = ?err, "log queuing metrics unavailable");
            }
        }
        delay(data.knobs.update_remote_log_version_interval).await;
    }
}
