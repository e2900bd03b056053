//! Server counters.
//!
//! Plain atomics bumped inline on the hot paths; a background task snapshots
//! and logs them. Queue depth checks subtract the in/out pairs directly.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

macro_rules! counters {
    ($name:ident, $snapshot:ident, { $($field:ident),+ $(,)? }) => {
        #[derive(Debug, Default)]
        pub struct $name {
            $(pub $field: AtomicU64,)+
        }

        #[derive(Clone, Copy, Debug, Default, serde::Serialize)]
        pub struct $snapshot {
            $(pub $field: u64,)+
        }

        impl $name {
            pub fn snapshot(&self) -> $snapshot {
                $snapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)+
                }
            }
        }
    };
}

counters!(GrvProxyStats, GrvProxyStatsSnapshot, {
    txn_request_in,
    txn_request_out,
    txn_request_errors,
    txn_start_in,
    txn_start_out,
    txn_start_batch,
    txn_system_priority_start_in,
    txn_system_priority_start_out,
    txn_default_priority_start_in,
    txn_default_priority_start_out,
    txn_batch_priority_start_in,
    txn_batch_priority_start_out,
    txn_throttled,
});

counters!(CommitProxyStats, CommitProxyStatsSnapshot, {
    txn_commit_in,
    txn_commit_version_assigned,
    txn_commit_resolving,
    txn_commit_resolved,
    txn_commit_out,
    txn_commit_out_success,
    txn_commit_errors,
    txn_conflicts,
    commit_batch_in,
    commit_batch_out,
    mutations,
    mutation_bytes,
    conflict_ranges,
    key_server_location_in,
    key_server_location_out,
    key_server_location_errors,
    txn_expensive_clear_cost_est_count,
});

impl GrvProxyStats {
    /// Requests accepted but not yet replied to.
    pub fn requests_in_flight(&self) -> i64 {
        self.txn_request_in.load(Ordering::Relaxed) as i64
            - self.txn_request_out.load(Ordering::Relaxed) as i64
    }
}

impl CommitProxyStats {
    pub fn location_requests_in_flight(&self) -> i64 {
        self.key_server_location_in.load(Ordering::Relaxed) as i64
            - self.key_server_location_out.load(Ordering::Relaxed) as i64
    }
}

pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn add(counter: &AtomicU64, amount: u64) {
    counter.fetch_add(amount, Ordering::Relaxed);
}

/// Signed gauge used for memory accounting.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn add(&self, delta: i64) -> i64 {
        self.0.fetch_add(delta, Ordering::Relaxed) + delta
    }
}
