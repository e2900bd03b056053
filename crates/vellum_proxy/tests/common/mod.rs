//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;

use vellum_proxy::local::{LocalCluster, LocalClusterConfig};
use vellum_proxy::Knobs;

/// Run a test body on a single-threaded runtime, matching the cooperative
/// scheduling model the servers are written for.
pub fn run<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("building test runtime")
        .block_on(future)
}

/// Knobs tightened so idle flushes and batch windows do not slow tests down.
pub fn test_knobs() -> Knobs {
    let mut knobs = Knobs::default();
    knobs.max_commit_batch_interval = 0.02;
    knobs.commit_transaction_batch_interval_max = 0.005;
    knobs.resolver_coalesce_time = 0.1;
    knobs
}

pub fn test_config(resolver_count: usize) -> LocalClusterConfig {
    LocalClusterConfig {
        knobs: Arc::new(test_knobs()),
        resolver_count,
        ..Default::default()
    }
}

pub async fn start_cluster(resolver_count: usize) -> LocalCluster {
    LocalCluster::start(test_config(resolver_count)).await
}

/// The test key prefix; everything the tests write lives under it.
pub const P: &[u8] = b"vt/";

pub fn key(suffix: &str) -> Vec<u8> {
    let mut out = P.to_vec();
    out.extend_from_slice(suffix.as_bytes());
    out
}
