//! Runtime tunables.
//!
//! Every tunable both pipelines read at steady state lives here. The struct
//! is built once at startup (optionally overridden by node flags) and shared
//! immutably; nothing reads ambient configuration afterwards.

use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
pub struct Knobs {
    // GRV batching.
    /// Floor for the dynamic GRV batch interval (seconds).
    pub start_transaction_batch_interval_min: f64,
    /// Ceiling for the dynamic GRV batch interval (seconds).
    pub start_transaction_batch_interval_max: f64,
    /// Fraction of observed reply latency targeted as batch interval.
    pub start_transaction_batch_interval_latency_fraction: f64,
    /// EMA weight for new latency observations.
    pub start_transaction_batch_interval_smoother_alpha: f64,
    /// Re-check interval while queues are non-empty (seconds).
    pub start_transaction_batch_queue_check_interval: f64,
    /// In-flight GRV request cap before shedding.
    pub start_transaction_max_queue_size: i64,
    /// Requests drained per starter firing.
    pub start_transaction_max_requests_to_start: usize,

    // GRV rate accounting.
    /// Window over which unused rate allowance accumulates (seconds).
    pub start_transaction_rate_window: f64,
    /// Budget retained while a priority's queue is empty.
    pub start_transaction_max_empty_queue_budget: f64,
    /// Hard cap on transactions started per window.
    pub start_transaction_max_transactions_to_start: i64,

    // Epoch liveness.
    /// Target bound on how stale a confirmed commit may be before a GRV is
    /// released (seconds). Zero disables the recency relaxation.
    pub required_min_recovery_duration: f64,
    /// Treat every request as causal-read-risky.
    pub always_causal_read_risky: bool,
    /// Floor between epoch-live confirmations (seconds).
    pub min_confirm_interval: f64,
    /// Cap on concurrent epoch-live confirmations.
    pub max_commit_updates: i64,
    /// Detailed health metrics refresh period (seconds).
    pub detailed_metric_update_rate: f64,

    // Commit batching.
    pub commit_transaction_batch_interval_from_idle: f64,
    pub commit_transaction_batch_interval_min: f64,
    pub commit_transaction_batch_interval_max: f64,
    pub commit_transaction_batch_interval_latency_fraction: f64,
    pub commit_transaction_batch_interval_smoother_alpha: f64,
    /// Transactions per batch cap. Also bounds the batch index field.
    pub commit_transaction_batch_count_max: usize,
    pub commit_transaction_batch_bytes_min: f64,
    pub commit_transaction_batch_bytes_max: f64,
    pub commit_transaction_batch_bytes_scale_base: f64,
    pub commit_transaction_batch_bytes_scale_power: f64,
    /// Idle flush period; an empty batch is cut at this cadence (seconds).
    pub max_commit_batch_interval: f64,
    /// Requests above this size open their own batch.
    pub transaction_size_limit: usize,

    // Commit memory accounting.
    pub commit_batches_mem_bytes_hard_limit: i64,
    pub server_mem_limit: f64,
    pub commit_batches_mem_fraction_of_total: f64,
    pub commit_batches_mem_to_total_mem_scale_factor: f64,

    // Commit compute pacing.
    pub proxy_compute_buckets: usize,
    pub max_proxy_compute: f64,
    pub min_proxy_compute: f64,
    pub proxy_compute_growth_rate: f64,
    /// Mutation bytes processed between cooperative yields.
    pub desired_total_bytes: usize,
    pub proxy_spin_delay: f64,

    // MVCC window.
    pub max_read_transaction_life_versions: i64,
    pub max_write_transaction_life_versions: i64,
    pub max_versions_in_flight: i64,

    // Routing state upkeep.
    pub resolver_coalesce_time: f64,
    pub key_location_max_queue_size: i64,
    pub max_txs_pop_version_history: usize,
    pub update_remote_log_version_interval: f64,

    // Cost accounting.
    pub report_transaction_cost_estimation_delay: f64,
    pub commit_sample_cost: u64,

    // Backup message framing.
    pub log_range_block_size: i64,
    pub mutation_block_size: usize,

    // Client-visible size limits (used for latency bucketing).
    pub value_size_limit: usize,
    pub key_size_limit: usize,

    // Transaction-state broadcast.
    pub txn_state_send_amount: usize,

    // Shard size hints.
    pub mid_shard_size_max_staleness: f64,
    pub min_shard_bytes: i64,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            start_transaction_batch_interval_min: 0.0005,
            start_transaction_batch_interval_max: 0.010,
            start_transaction_batch_interval_latency_fraction: 0.5,
            start_transaction_batch_interval_smoother_alpha: 0.1,
            start_transaction_batch_queue_check_interval: 0.001,
            start_transaction_max_queue_size: 1_000_000,
            start_transaction_max_requests_to_start: 10_000,

            start_transaction_rate_window: 2.0,
            start_transaction_max_empty_queue_budget: 10.0,
            start_transaction_max_transactions_to_start: 100_000,

            required_min_recovery_duration: 0.080,
            always_causal_read_risky: false,
            min_confirm_interval: 0.05,
            max_commit_updates: 2_000,
            detailed_metric_update_rate: 5.0,

            commit_transaction_batch_interval_from_idle: 0.0005,
            commit_transaction_batch_interval_min: 0.001,
            commit_transaction_batch_interval_max: 0.010,
            commit_transaction_batch_interval_latency_fraction: 0.1,
            commit_transaction_batch_interval_smoother_alpha: 0.1,
            commit_transaction_batch_count_max: 32_768,
            commit_transaction_batch_bytes_min: 100_000.0,
            commit_transaction_batch_bytes_max: 1_000_000.0,
            commit_transaction_batch_bytes_scale_base: 200_000.0,
            commit_transaction_batch_bytes_scale_power: 0.333,
            max_commit_batch_interval: 0.5,
            transaction_size_limit: 10_000_000,

            commit_batches_mem_bytes_hard_limit: 2_000_000_000,
            server_mem_limit: 8e9,
            commit_batches_mem_fraction_of_total: 0.5,
            commit_batches_mem_to_total_mem_scale_factor: 10.0,

            proxy_compute_buckets: 20_000,
            max_proxy_compute: 0.02,
            min_proxy_compute: 0.000_5,
            proxy_compute_growth_rate: 0.01,
            desired_total_bytes: 150_000,
            proxy_spin_delay: 0.01,

            max_read_transaction_life_versions: 5_000_000,
            max_write_transaction_life_versions: 5_000_000,
            max_versions_in_flight: 100_000_000,

            resolver_coalesce_time: 1.0,
            key_location_max_queue_size: 10_000,
            max_txs_pop_version_history: 1_000_000,
            update_remote_log_version_interval: 2.0,

            report_transaction_cost_estimation_delay: 0.1,
            commit_sample_cost: 100,

            log_range_block_size: 1_000_000,
            mutation_block_size: 10_000,

            value_size_limit: 100_000,
            key_size_limit: 10_000,

            txn_state_send_amount: 2,

            mid_shard_size_max_staleness: 10.0,
            min_shard_bytes: 200_000,
        }
    }
}

impl Knobs {
    /// Memory allowed for in-flight commit batches.
    pub fn commit_batches_memory_limit(&self) -> i64 {
        self.commit_batches_mem_bytes_hard_limit.min(
            (self.server_mem_limit * self.commit_batches_mem_fraction_of_total
                / self.commit_batches_mem_to_total_mem_scale_factor) as i64,
        )
    }

    /// Desired batch bytes, grown sublinearly with the commit server count.
    pub fn commit_batch_byte_limit(&self, commit_proxy_count: usize) -> usize {
        let scaled = self.commit_transaction_batch_bytes_scale_base
            * (commit_proxy_count.max(1) as f64).powf(self.commit_transaction_batch_bytes_scale_power);
        self.commit_transaction_batch_bytes_max
            .min(self.commit_transaction_batch_bytes_min.max(scaled)) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_byte_limit_is_clamped() {
        let knobs = Knobs::default();
        let one = knobs.commit_batch_byte_limit(1);
        let many = knobs.commit_batch_byte_limit(64);
        assert!(one >= knobs.commit_transaction_batch_bytes_min as usize);
        assert!(many <= knobs.commit_transaction_batch_bytes_max as usize);
        assert!(many >= one);
    }

    #[test]
    fn mvcc_window_fits_in_flight_budget() {
        let knobs = Knobs::default();
        assert!(knobs.max_read_transaction_life_versions <= knobs.max_versions_in_flight);
    }
}
