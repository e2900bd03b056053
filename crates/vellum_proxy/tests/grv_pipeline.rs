//! GRV pipeline behavior: queueing, causal gating, throttle hints.

mod common;

use common::{key, run, start_cluster, test_knobs};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use vellum_core::messages::{GetHealthMetricsRequest, GetReadVersionRequest};
use vellum_core::types::TransactionPriority;
use vellum_proxy::local::{LocalCluster, LocalClusterConfig};

fn raw_grv_request(
    priority: TransactionPriority,
    use_min_known: bool,
    tags: Vec<(String, u64)>,
) -> (
    GetReadVersionRequest,
    oneshot::Receiver<Result<vellum_core::messages::GetReadVersionReply, vellum_core::ProxyError>>,
) {
    let (reply_tx, reply_rx) = oneshot::channel();
    (
        GetReadVersionRequest {
            priority,
            transaction_count: 1,
            causal_read_risky: false,
            use_min_known_committed_version: use_min_known,
            tags,
            debug_id: None,
            reply: reply_tx,
        },
        reply_rx,
    )
}

#[test]
fn read_versions_observe_prior_commits() {
    run(async {
        let cluster = start_cluster(1).await;
        let client = cluster.client();

        let mut writer = client.begin();
        writer.set(&key("grv"), b"v");
        let commit = writer.commit().await.unwrap();

        let mut reader = client.begin();
        let read_version = reader.get_read_version().await.unwrap();
        assert!(read_version >= commit.version);

        // The non-risky path confirmed epoch liveness along the way.
        assert!(cluster.log.confirm_count() > 0);
    });
}

#[test]
fn queue_overflow_sends_soft_signal() {
    run(async {
        let mut knobs = test_knobs();
        // Every request finds the queue "over" the cap.
        knobs.start_transaction_max_queue_size = -1;
        let cluster = LocalCluster::start(LocalClusterConfig {
            knobs: Arc::new(knobs),
            ..Default::default()
        })
        .await;

        let (request, reply_rx) = raw_grv_request(TransactionPriority::Default, false, Vec::new());
        cluster.grv.requests.send(request).unwrap();
        let reply = reply_rx.await.unwrap().unwrap();
        assert_eq!(reply.version, 1);
        assert!(reply.locked);
    });
}

#[test]
fn min_known_committed_flag_substitutes_version() {
    run(async {
        let cluster = start_cluster(1).await;

        let (normal, normal_rx) = raw_grv_request(TransactionPriority::Default, false, Vec::new());
        cluster.grv.requests.send(normal).unwrap();
        let normal_reply = normal_rx.await.unwrap().unwrap();

        let (durable, durable_rx) = raw_grv_request(TransactionPriority::Default, true, Vec::new());
        cluster.grv.requests.send(durable).unwrap();
        let durable_reply = durable_rx.await.unwrap().unwrap();

        assert!(durable_reply.version >= 1_000_000, "at least the recovery version");
        // The durable substitute can only trail the live committed version.
        assert!(durable_reply.version <= cluster.master.committed_version());
        assert!(normal_reply.version <= cluster.master.committed_version());
    });
}

#[test]
fn throttled_tags_are_returned_to_matching_requests() {
    run(async {
        let cluster = start_cluster(1).await;

        let expiration = vellum_core::time::now_seconds() + 100.0;
        cluster
            .rate_keeper
            .set_throttle(TransactionPriority::Default, "hot", 5.0, expiration);

        // Wait out a lease renewal so the GRV server picks up the new map.
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        let (tagged, tagged_rx) = raw_grv_request(
            TransactionPriority::Default,
            false,
            vec![("hot".to_string(), 1)],
        );
        cluster.grv.requests.send(tagged).unwrap();
        let reply = tagged_rx.await.unwrap().unwrap();
        let throttle = reply.tag_throttle_info.get("hot").expect("throttle entry");
        assert_eq!(throttle.tps_rate, 5.0);

        // A request with different tags gets no hint.
        let (other, other_rx) = raw_grv_request(
            TransactionPriority::Default,
            false,
            vec![("cold".to_string(), 1)],
        );
        cluster.grv.requests.send(other).unwrap();
        assert!(other_rx.await.unwrap().unwrap().tag_throttle_info.is_empty());

        // Tag traffic flows back to the rate keeper with rate requests.
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        let counted = cluster
            .rate_keeper
            .rate_requests()
            .iter()
            .any(|req| req.tag_counts.contains_key("hot"));
        assert!(counted, "expected the hot tag count to reach the rate keeper");
    });
}

#[test]
fn health_metrics_are_served() {
    run(async {
        let cluster = start_cluster(1).await;
        let (reply_tx, reply_rx) = oneshot::channel();
        cluster
            .grv
            .health_requests
            .send(GetHealthMetricsRequest { detailed: false, reply: reply_tx })
            .unwrap();
        let metrics = reply_rx.await.unwrap();
        assert!(metrics.tps_limit >= 0.0);
    });
}
