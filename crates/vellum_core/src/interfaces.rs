//! Contracts presented by external collaborators.
//!
//! The core is transport-agnostic; concrete implementations can sit on an
//! RPC framework, in-memory channels, or test harnesses. A failed call is
//! the moral equivalent of a broken promise and is translated into the error
//! taxonomy by the caller.

use async_trait::async_trait;

use crate::messages::{
    GetCommitVersionReply, GetCommitVersionRequest, GetDDMetricsReply, GetRateInfoReply,
    GetRateInfoRequest, GetRawCommittedVersionReply, ReportCommitCostRequest,
    ReportRawCommittedVersionRequest, ResolveTransactionBatchReply,
    ResolveTransactionBatchRequest, TaggedMessage,
};
use crate::types::{KeyRange, Version};

/// The master: mints commit versions, tracks the live committed version and
/// the resolver-range assignment.
#[async_trait]
pub trait MasterClient: Send + Sync + 'static {
    async fn get_commit_version(
        &self,
        req: GetCommitVersionRequest,
    ) -> anyhow::Result<GetCommitVersionReply>;

    async fn get_live_committed_version(&self) -> anyhow::Result<GetRawCommittedVersionReply>;

    /// Must be observed by the master before the caller advances its local
    /// committed version.
    async fn report_live_committed_version(
        &self,
        req: ReportRawCommittedVersionRequest,
    ) -> anyhow::Result<()>;
}

/// A resolver: decides per-transaction conflict verdicts for the key ranges
/// it owns.
#[async_trait]
pub trait ResolverClient: Send + Sync + 'static {
    async fn resolve(
        &self,
        req: ResolveTransactionBatchRequest,
    ) -> anyhow::Result<ResolveTransactionBatchReply>;
}

/// The replicated log: durability and epoch liveness.
#[async_trait]
pub trait LogSystemClient: Send + Sync + 'static {
    /// Make a batch durable. Returns the version known durable after the
    /// push completes.
    async fn push(
        &self,
        prev_version: Version,
        version: Version,
        committed_version: Version,
        min_known_committed_version: Version,
        messages: Vec<TaggedMessage>,
    ) -> anyhow::Result<Version>;

    /// Heartbeat proving this epoch is still authoritative.
    async fn confirm_epoch_live(&self) -> anyhow::Result<()>;

    /// Allow the log to discard transaction-state messages at or below
    /// `up_to` for the given locality.
    async fn pop_txs(&self, up_to: Version, locality: i8) -> anyhow::Result<()>;

    /// Durable version reported by each remote log, for remote-pop pacing.
    async fn queuing_metrics(&self) -> anyhow::Result<Vec<Version>>;
}

/// The rate keeper: computes allowed transaction rates and tag throttles.
#[async_trait]
pub trait RateKeeperClient: Send + Sync + 'static {
    async fn get_rate_info(&self, req: GetRateInfoRequest) -> anyhow::Result<GetRateInfoReply>;

    async fn report_commit_cost(&self, req: ReportCommitCostRequest) -> anyhow::Result<()>;
}

/// The data distributor: shard metrics and cluster-wide safety operations.
#[async_trait]
pub trait DataDistributorClient: Send + Sync + 'static {
    async fn get_metrics(
        &self,
        range: KeyRange,
        shard_limit: usize,
    ) -> anyhow::Result<GetDDMetricsReply>;

    async fn exclusion_safety_check(&self, exclusions: Vec<String>) -> anyhow::Result<bool>;

    async fn snapshot(&self, payload: Vec<u8>, snap_id: u64) -> anyhow::Result<()>;
}
