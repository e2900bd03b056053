//! The two server roles of the vellum transaction coordination core.
//!
//! A GRV server assigns read versions under priority-aware admission
//! control; a commit server batches commits, resolves conflicts through the
//! resolver collaborators, applies metadata effects and drives batches to
//! the replicated log. Both are collections of cooperative tasks wired
//! together with channels; collaborators are reached through the contract
//! traits in `vellum_core::interfaces`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use vellum_core::interfaces::{
    DataDistributorClient, LogSystemClient, MasterClient, RateKeeperClient, ResolverClient,
};
use vellum_core::messages::{
    CommitTransactionRequest, ExclusionSafetyCheckRequest, GetDDMetricsRequest,
    GetKeyServerLocationsRequest, GetStorageServerRejoinInfoRequest, ProxySnapRequest,
    TxnStateRequest,
};

pub mod commit;
pub mod grv;
pub mod knobs;
pub mod local;
pub mod metadata;
pub mod push;
pub mod rate;
pub mod resolution;
pub mod rpc_service;
pub mod stats;
pub mod throttle;
pub mod txn_state;
pub mod util;

pub use commit::{CommitData, CommitProxyConfig};
pub use grv::{spawn_grv_proxy, GrvProxyConfig, GrvProxyHandle};
pub use knobs::Knobs;

/// Request sinks and background tasks of one running commit server.
pub struct CommitProxyHandle {
    pub commits: mpsc::UnboundedSender<CommitTransactionRequest>,
    pub locations: mpsc::UnboundedSender<GetKeyServerLocationsRequest>,
    pub rejoins: mpsc::UnboundedSender<GetStorageServerRejoinInfoRequest>,
    pub dd_metrics: mpsc::UnboundedSender<GetDDMetricsRequest>,
    pub exclusion_checks: mpsc::UnboundedSender<ExclusionSafetyCheckRequest>,
    pub snapshots: mpsc::UnboundedSender<ProxySnapRequest>,
    pub txn_state: mpsc::UnboundedSender<TxnStateRequest>,
    pub data: Arc<CommitData>,
    tasks: Vec<JoinHandle<()>>,
}

impl CommitProxyHandle {
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for CommitProxyHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wire up and start every task of one commit server.
pub fn spawn_commit_proxy(
    config: CommitProxyConfig,
    master: Arc<dyn MasterClient>,
    resolvers: Vec<Arc<dyn ResolverClient>>,
    log_system: Arc<dyn LogSystemClient>,
    rate_keeper: Arc<dyn RateKeeperClient>,
    data_distributor: Arc<dyn DataDistributorClient>,
    txn_state_peers: Vec<mpsc::UnboundedSender<TxnStateRequest>>,
) -> CommitProxyHandle {
    assert!(!resolvers.is_empty(), "a commit server needs at least one resolver");

    let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
    let data = Arc::new(CommitData::new(
        &config,
        master,
        resolvers,
        log_system,
        fatal_tx,
    ));

    let (commits_tx, commits_rx) = mpsc::unbounded_channel();
    let (locations_tx, locations_rx) = mpsc::unbounded_channel();
    let (rejoins_tx, rejoins_rx) = mpsc::unbounded_channel();
    let (dd_tx, dd_rx) = mpsc::unbounded_channel();
    let (exclusion_tx, exclusion_rx) = mpsc::unbounded_channel();
    let (snap_tx, snap_rx) = mpsc::unbounded_channel();
    let (txn_state_tx, txn_state_rx) = mpsc::unbounded_channel();
    let (batched_tx, batched_rx) = mpsc::channel(16);

    let desired_bytes = config.knobs.commit_batch_byte_limit(config.commit_proxy_count);
    tracing::info!(
        id = config.id,
        mem_limit = config.knobs.commit_batches_memory_limit(),
        batch_bytes = desired_bytes,
        "commit server starting"
    );

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(commit::commit_batcher(
        data.clone(),
        batched_tx,
        commits_rx,
        desired_bytes,
    )));
    tasks.push(tokio::spawn(commit::commit_loop(
        data.clone(),
        batched_rx,
        fatal_rx,
    )));
    tasks.push(tokio::spawn(rpc_service::read_request_server(
        data.clone(),
        locations_rx,
    )));
    tasks.push(tokio::spawn(rpc_service::rejoin_server(
        data.clone(),
        rejoins_rx,
    )));
    tasks.push(tokio::spawn(rpc_service::dd_metrics_server(
        data.clone(),
        data_distributor.clone(),
        dd_rx,
    )));
    tasks.push(tokio::spawn(rpc_service::exclusion_safety_server(
        data.clone(),
        data_distributor.clone(),
        exclusion_rx,
    )));
    tasks.push(tokio::spawn(rpc_service::snapshot_server(
        data.clone(),
        data_distributor,
        snap_rx,
    )));
    tasks.push(tokio::spawn(rpc_service::txn_state_server(
        data.clone(),
        txn_state_rx,
        txn_state_peers,
    )));
    tasks.push(tokio::spawn(commit::report_commit_cost_loop(
        data.clone(),
        rate_keeper,
    )));
    tasks.push(tokio::spawn(commit::monitor_remote_committed(data.clone())));
    tasks.push(tokio::spawn(commit_stats_logger(data.clone())));

    CommitProxyHandle {
        commits: commits_tx,
        locations: locations_tx,
        rejoins: rejoins_tx,
        dd_metrics: dd_tx,
        exclusion_checks: exclusion_tx,
        snapshots: snap_tx,
        txn_state: txn_state_tx,
        data,
        tasks,
    }
}

async fn commit_stats_logger(data: Arc<CommitData>) {
    loop {
        util::delay(5.0).await;
        let snapshot = data.stats.snapshot();
        tracing::debug!(
            id = data.id,
            commits_in = snapshot.txn_commit_in,
            commits_out = snapshot.txn_commit_out,
            conflicts = snapshot.txn_conflicts,
            mutations = snapshot.mutations,
            mutation_bytes = snapshot.mutation_bytes,
            committed_version = data.committed_version.get(),
            "commit server metrics"
        );
    }
}
