//! Request and reply shapes exchanged with clients and collaborators.
//!
//! Wire framing belongs to whatever transport carries these; the core only
//! cares about the shapes. Client-facing requests own a oneshot reply sink,
//! drained exactly once by the pipeline that finishes them.

use std::collections::{HashMap, VecDeque};

use anyhow::bail;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::ProxyError;
use crate::types::{
    AtomicOp, CommitStatus, CommitTransaction, Key, KeyRange, Mutation, Tag, TransactionPriority,
    TransactionTag, Version,
};

pub type ReplySender<T> = oneshot::Sender<Result<T, ProxyError>>;

/// One throttle bucket handed back to clients: a target rate and when it
/// stops applying (seconds on the shared monotonic clock).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientTagThrottleLimits {
    pub tps_rate: f64,
    pub expiration: f64,
}

/// Throttles keyed by priority then tag, as maintained by the rate keeper.
pub type ThrottledTagMap =
    HashMap<TransactionPriority, HashMap<TransactionTag, ClientTagThrottleLimits>>;

#[derive(Debug)]
pub struct GetReadVersionRequest {
    pub priority: TransactionPriority,
    /// Number of client transactions this request will start.
    pub transaction_count: i64,
    pub causal_read_risky: bool,
    pub use_min_known_committed_version: bool,
    pub tags: Vec<(TransactionTag, u64)>,
    pub debug_id: Option<u64>,
    pub reply: ReplySender<GetReadVersionReply>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetReadVersionReply {
    pub version: Version,
    pub locked: bool,
    pub metadata_version: Option<Vec<u8>>,
    pub mid_shard_size: i64,
    pub tag_throttle_info: HashMap<TransactionTag, ClientTagThrottleLimits>,
}

/// Client-estimated commit costs, used to sample per-storage-server tag cost.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientCommitCostEstimation {
    pub write_costs: u64,
    /// `(mutation index, cost)` for each clear, front to back.
    pub clear_idx_costs: VecDeque<(usize, u64)>,
    pub expensive_cost_est_count: u64,
}

#[derive(Debug)]
pub struct CommitTransactionRequest {
    pub transaction: CommitTransaction,
    pub lock_aware: bool,
    /// Forces this request to open a fresh batch.
    pub first_in_batch: bool,
    pub tag_set: Option<Vec<TransactionTag>>,
    pub commit_cost_estimation: Option<ClientCommitCostEstimation>,
    pub debug_id: Option<u64>,
    pub reply: ReplySender<CommitReply>,
}

impl CommitTransactionRequest {
    pub fn expected_size(&self) -> usize {
        self.transaction.expected_size()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReply {
    pub version: Version,
    pub batch_index: u16,
    pub metadata_version: Option<Vec<u8>>,
}

/// A transaction as seen by one resolver: only the conflict ranges routed to
/// it, plus metadata mutations when the first resolver must replicate
/// transaction-state effects.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResolverTransaction {
    pub read_snapshot: Version,
    pub read_conflict_ranges: Vec<KeyRange>,
    pub write_conflict_ranges: Vec<KeyRange>,
    pub mutations: Vec<Mutation>,
    pub report_conflicting_keys: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolveTransactionBatchRequest {
    pub prev_version: Version,
    pub version: Version,
    /// Highest version this server has already received a resolution for;
    /// lets the resolver prune its reply backlog.
    pub last_received_version: Version,
    pub transactions: Vec<ResolverTransaction>,
    /// Indices (into `transactions`) that carry transaction-state effects.
    pub txn_state_transactions: Vec<usize>,
    pub debug_id: Option<u64>,
}

/// One peer server's batch of metadata effects, with this resolver's verdict.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateMutationGroup {
    pub committed: bool,
    pub mutations: Vec<Mutation>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResolveTransactionBatchReply {
    /// Verdicts aligned with the request's transaction order.
    pub committed: Vec<CommitStatus>,
    /// Time-ordered metadata effects of versions between `last_received` and
    /// this batch: outer per version, inner per txn-state transaction.
    pub state_mutations: Vec<Vec<StateMutationGroup>>,
    /// Per transaction, the resolver-local read-range indices that conflicted.
    pub conflicting_key_ranges: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GetCommitVersionRequest {
    pub request_num: u64,
    pub most_recent_processed_request_num: u64,
}

/// A key range moving to a different resolver as of `resolver_changes_version`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolverMove {
    pub range: KeyRange,
    pub dest: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetCommitVersionReply {
    pub version: Version,
    pub prev_version: Version,
    pub request_num: u64,
    pub resolver_changes: Vec<ResolverMove>,
    pub resolver_changes_version: Version,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetRawCommittedVersionReply {
    pub version: Version,
    pub locked: bool,
    pub metadata_version: Option<Vec<u8>>,
    pub min_known_committed_version: Version,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportRawCommittedVersionRequest {
    pub version: Version,
    pub locked: bool,
    pub metadata_version: Option<Vec<u8>>,
    pub min_known_committed_version: Version,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub tps_limit: f64,
    pub batch_limited: bool,
    pub worst_storage_queue: i64,
    pub worst_storage_durability_lag: i64,
    pub worst_tlog_queue: i64,
}

impl HealthMetrics {
    /// Fold in a fresher sample; detailed fields only move when the sample
    /// carried them.
    pub fn update(&mut self, sample: &HealthMetrics, detailed: bool) {
        self.tps_limit = sample.tps_limit;
        self.batch_limited = sample.batch_limited;
        if detailed {
            self.worst_storage_queue = sample.worst_storage_queue;
            self.worst_storage_durability_lag = sample.worst_storage_durability_lag;
            self.worst_tlog_queue = sample.worst_tlog_queue;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetRateInfoRequest {
    pub proxy_id: u64,
    pub total_released_transactions: i64,
    pub batch_released_transactions: i64,
    pub tag_counts: HashMap<TransactionTag, u64>,
    pub detailed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetRateInfoReply {
    pub transaction_rate: f64,
    pub batch_transaction_rate: f64,
    /// Seconds the rates remain valid without renewal.
    pub lease_duration: f64,
    pub health_metrics: HealthMetrics,
    pub throttled_tags: Option<ThrottledTagMap>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct CommitCost {
    pub ops: u64,
    pub cost: u64,
}

/// Accumulated `storage server -> tag -> cost` samples reported to the rate
/// keeper.
pub type StorageTagCostMap = HashMap<u64, HashMap<TransactionTag, CommitCost>>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportCommitCostRequest {
    pub ss_tag_cost: StorageTagCostMap,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageServerInterface {
    pub id: u64,
    pub address: String,
}

#[derive(Debug)]
pub struct GetKeyServerLocationsRequest {
    pub begin: Key,
    pub end: Option<Key>,
    pub limit: usize,
    pub reverse: bool,
    pub reply: ReplySender<GetKeyServerLocationsReply>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetKeyServerLocationsReply {
    pub results: Vec<(KeyRange, Vec<StorageServerInterface>)>,
}

#[derive(Debug)]
pub struct GetStorageServerRejoinInfoRequest {
    pub id: u64,
    pub dc_id: Option<Vec<u8>>,
    pub reply: ReplySender<GetStorageServerRejoinInfoReply>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStorageServerRejoinInfoReply {
    pub version: Version,
    pub tag: Tag,
    /// Prior tags, newest first.
    pub history: Vec<(Version, Tag)>,
    pub new_tag: Option<Tag>,
    pub new_locality: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DDShardMetrics {
    pub range: KeyRange,
    pub bytes: i64,
}

#[derive(Debug)]
pub struct GetDDMetricsRequest {
    pub range: KeyRange,
    pub shard_limit: usize,
    pub reply: ReplySender<GetDDMetricsReply>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetDDMetricsReply {
    pub storage_metrics: Vec<DDShardMetrics>,
    pub mid_shard_size: Option<i64>,
}

#[derive(Debug)]
pub struct ExclusionSafetyCheckRequest {
    pub exclusions: Vec<String>,
    pub reply: oneshot::Sender<ExclusionSafetyCheckReply>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ExclusionSafetyCheckReply {
    pub safe: bool,
}

#[derive(Debug)]
pub struct ProxySnapRequest {
    pub payload: Vec<u8>,
    pub snap_id: u64,
    pub reply: ReplySender<()>,
}

/// One sequenced slice of the transaction-state snapshot broadcast at
/// recovery.
#[derive(Debug)]
pub struct TxnStateRequest {
    pub sequence: u64,
    pub last: bool,
    pub data: Vec<(Key, Vec<u8>)>,
    pub reply: oneshot::Sender<()>,
}

#[derive(Debug)]
pub struct GetHealthMetricsRequest {
    pub detailed: bool,
    pub reply: oneshot::Sender<HealthMetrics>,
}

/// A log message plus the storage-server streams it fans out to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaggedMessage {
    pub tags: Vec<Tag>,
    pub message: Vec<u8>,
}

const MUTATION_SET: u8 = 0;
const MUTATION_CLEAR_RANGE: u8 = 1;
const MUTATION_ATOMIC: u8 = 2;
const MUTATION_VS_KEY: u8 = 3;
const MUTATION_VS_VALUE: u8 = 4;

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn take_bytes<'a>(data: &'a [u8]) -> anyhow::Result<(&'a [u8], &'a [u8])> {
    if data.len() < 4 {
        bail!("truncated mutation field length");
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let data = &data[4..];
    if data.len() < len {
        bail!("truncated mutation field");
    }
    Ok((&data[..len], &data[len..]))
}

/// Flat log-message encoding of one mutation: a type byte, an optional
/// atomic-op byte, then two length-prefixed operands.
pub fn encode_mutation(m: &Mutation) -> Vec<u8> {
    let mut out = Vec::with_capacity(m.expected_size() + 16);
    match m {
        Mutation::Set { key, value } => {
            out.push(MUTATION_SET);
            put_bytes(&mut out, key);
            put_bytes(&mut out, value);
        }
        Mutation::ClearRange { begin, end } => {
            out.push(MUTATION_CLEAR_RANGE);
            put_bytes(&mut out, begin);
            put_bytes(&mut out, end);
        }
        Mutation::Atomic { op, key, param } => {
            out.push(MUTATION_ATOMIC);
            out.push(*op as u8);
            put_bytes(&mut out, key);
            put_bytes(&mut out, param);
        }
        Mutation::SetVersionstampedKey { key, value } => {
            out.push(MUTATION_VS_KEY);
            put_bytes(&mut out, key);
            put_bytes(&mut out, value);
        }
        Mutation::SetVersionstampedValue { key, value } => {
            out.push(MUTATION_VS_VALUE);
            put_bytes(&mut out, key);
            put_bytes(&mut out, value);
        }
    }
    out
}

pub fn decode_mutation(data: &[u8]) -> anyhow::Result<Mutation> {
    if data.is_empty() {
        bail!("empty mutation message");
    }
    let (kind, mut rest) = (data[0], &data[1..]);
    let op = if kind == MUTATION_ATOMIC {
        if rest.is_empty() {
            bail!("truncated atomic op");
        }
        let op = match rest[0] {
            x if x == AtomicOp::Add as u8 => AtomicOp::Add,
            x if x == AtomicOp::BitAnd as u8 => AtomicOp::BitAnd,
            x if x == AtomicOp::BitOr as u8 => AtomicOp::BitOr,
            x if x == AtomicOp::BitXor as u8 => AtomicOp::BitXor,
            x if x == AtomicOp::Max as u8 => AtomicOp::Max,
            x if x == AtomicOp::Min as u8 => AtomicOp::Min,
            x if x == AtomicOp::ByteMin as u8 => AtomicOp::ByteMin,
            x if x == AtomicOp::ByteMax as u8 => AtomicOp::ByteMax,
            other => bail!("unknown atomic op {other}"),
        };
        rest = &rest[1..];
        Some(op)
    } else {
        None
    };
    let (a, rest) = take_bytes(rest)?;
    let (b, rest) = take_bytes(rest)?;
    if !rest.is_empty() {
        bail!("trailing bytes after mutation");
    }
    Ok(match kind {
        MUTATION_SET => Mutation::Set { key: a.to_vec(), value: b.to_vec() },
        MUTATION_CLEAR_RANGE => Mutation::ClearRange { begin: a.to_vec(), end: b.to_vec() },
        MUTATION_ATOMIC => Mutation::Atomic {
            op: op.expect("atomic op decoded above"),
            key: a.to_vec(),
            param: b.to_vec(),
        },
        MUTATION_VS_KEY => Mutation::SetVersionstampedKey { key: a.to_vec(), value: b.to_vec() },
        MUTATION_VS_VALUE => Mutation::SetVersionstampedValue { key: a.to_vec(), value: b.to_vec() },
        other => bail!("unknown mutation kind {other}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_codec_round_trips() {
        let cases = vec![
            Mutation::Set { key: b"k".to_vec(), value: b"v".to_vec() },
            Mutation::ClearRange { begin: b"a".to_vec(), end: b"z".to_vec() },
            Mutation::Atomic { op: AtomicOp::Add, key: b"c".to_vec(), param: vec![1] },
            Mutation::SetVersionstampedKey { key: vec![0; 14], value: b"v".to_vec() },
        ];
        for m in cases {
            assert_eq!(decode_mutation(&encode_mutation(&m)).unwrap(), m);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_mutation(&[]).is_err());
        assert!(decode_mutation(&[99, 0, 0, 0, 0]).is_err());
        assert!(decode_mutation(&[MUTATION_SET, 0, 0, 0, 9]).is_err());
    }

    #[test]
    fn health_metrics_detailed_gating() {
        let mut base = HealthMetrics::default();
        let sample = HealthMetrics {
            tps_limit: 100.0,
            batch_limited: true,
            worst_storage_queue: 7,
            worst_storage_durability_lag: 8,
            worst_tlog_queue: 9,
        };
        base.update(&sample, false);
        assert_eq!(base.tps_limit, 100.0);
        assert_eq!(base.worst_storage_queue, 0);
        base.update(&sample, true);
        assert_eq!(base.worst_storage_queue, 7);
    }
}
