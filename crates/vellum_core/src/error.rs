//! Error taxonomy shared with clients.
//!
//! Kinds matter more than payloads here: clients retry some of these,
//! surface others, and treat a third group as "the server is gone, find a
//! new one". Collaborator plumbing failures are translated into one of
//! these at the boundary where they are observed.

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProxyError {
    /// The transaction conflicted with a prior commit. When the client asked
    /// for conflicting keys, carries the indices of the read-conflict ranges
    /// (in the client's original order) that the resolvers flagged.
    #[error("transaction not committed due to conflict with another transaction")]
    NotCommitted { conflicting_ranges: Option<Vec<usize>> },

    /// The read snapshot fell out of the MVCC window.
    #[error("transaction is too old to perform reads or be committed")]
    TransactionTooOld,

    /// A read asked a storage peer for a version it has not yet received.
    #[error("request for future version")]
    FutureVersion,

    /// Batch-priority work is shed before queueing when the aggregate batch
    /// rate cannot cover the peer set.
    #[error("batch transaction throttled")]
    BatchTransactionThrottled,

    /// The transaction's tag is throttled; the client should back off per
    /// the throttle hints in its read-version reply.
    #[error("transaction tag throttled")]
    TagThrottled,

    /// The database is locked and the transaction was not lock-aware.
    #[error("database is locked")]
    DatabaseLocked,

    /// The reply was lost after the durability point; the commit may or may
    /// not have happened.
    #[error("transaction may or may not have committed")]
    CommitUnknownResult,

    /// Server-side queue or batch memory cap exceeded; the request was shed.
    #[error("proxy memory limit exceeded")]
    ProxyMemoryLimitExceeded,

    /// This server is no longer part of the recruited set.
    #[error("normal worker shut down")]
    WorkerRemoved,

    #[error("tlog stopped")]
    TlogStopped,

    /// Master or log-system collaborator broke its promise.
    #[error("master terminating because a tlog failed")]
    MasterTlogFailed,

    #[error("coordinators have changed")]
    CoordinatorsChanged,

    /// The data distributor is not reachable.
    #[error("data distributor not found")]
    DataDistributorNotFound,

    /// Internal invariant violation surfaced instead of aborting the process.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Errors a client resolves by retrying the transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::NotCommitted { .. }
                | ProxyError::TransactionTooOld
                | ProxyError::FutureVersion
                | ProxyError::BatchTransactionThrottled
                | ProxyError::TagThrottled
                | ProxyError::DatabaseLocked
                | ProxyError::ProxyMemoryLimitExceeded
        )
    }

    /// Errors that end this server's life; a replacement is recruited
    /// externally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::WorkerRemoved
                | ProxyError::TlogStopped
                | ProxyError::MasterTlogFailed
                | ProxyError::CoordinatorsChanged
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_and_fatal_are_disjoint() {
        let all = [
            ProxyError::NotCommitted { conflicting_ranges: None },
            ProxyError::TransactionTooOld,
            ProxyError::FutureVersion,
            ProxyError::BatchTransactionThrottled,
            ProxyError::TagThrottled,
            ProxyError::DatabaseLocked,
            ProxyError::CommitUnknownResult,
            ProxyError::ProxyMemoryLimitExceeded,
            ProxyError::WorkerRemoved,
            ProxyError::TlogStopped,
            ProxyError::MasterTlogFailed,
            ProxyError::CoordinatorsChanged,
            ProxyError::DataDistributorNotFound,
        ];
        for err in &all {
            assert!(!(err.is_retryable() && err.is_fatal()), "{err:?}");
        }
    }
}
