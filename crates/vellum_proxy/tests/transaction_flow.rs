//! End-to-end transaction scenarios against a single-process cluster.

mod common;

use common::{key, run, start_cluster, test_knobs};

use std::sync::Arc;

use vellum_core::types::{key_after, AtomicOp};
use vellum_core::ProxyError;
use vellum_proxy::local::{LocalCluster, LocalClusterConfig};

#[test]
fn read_your_writes_before_commit() {
    run(async {
        let cluster = start_cluster(1).await;
        let client = cluster.client();

        let mut txn = client.begin();
        txn.set(&key("foo"), b"bar");
        let value = txn.get(&key("foo")).await.unwrap();
        assert_eq!(value, Some(b"bar".to_vec()));

        // Nothing is visible to other transactions yet.
        let mut other = client.begin();
        assert_eq!(other.get(&key("foo")).await.unwrap(), None);
    });
}

#[test]
fn range_read_honors_limit_and_reports_more() {
    run(async {
        let cluster = start_cluster(1).await;
        let client = cluster.client();

        let mut setup = client.begin();
        setup.set(&key("a"), b"1");
        setup.set(&key("b"), b"2");
        setup.set(&key("c"), b"3");
        setup.set(&key("d"), b"4");
        setup.commit().await.unwrap();

        let mut txn = client.begin();
        let (pairs, more) = txn
            .get_range(&key("a"), &key_after(&key("d")), 2)
            .await
            .unwrap();
        assert_eq!(
            pairs,
            vec![(key("a"), b"1".to_vec()), (key("b"), b"2".to_vec())]
        );
        assert!(more);
    });
}

#[test]
fn atomic_add_increments_byte_value() {
    run(async {
        let cluster = start_cluster(1).await;
        let client = cluster.client();

        let mut setup = client.begin();
        setup.set(&key("foo"), b"a");
        setup.commit().await.unwrap();

        let mut txn = client.begin();
        txn.atomic(AtomicOp::Add, &key("foo"), &[0x01]);
        // The uncommitted atomic is visible to this transaction's reads.
        assert_eq!(txn.get(&key("foo")).await.unwrap(), Some(vec![0x62]));
        txn.commit().await.unwrap();

        // And to everyone after commit.
        let mut check = client.begin();
        assert_eq!(check.get(&key("foo")).await.unwrap(), Some(vec![0x62]));
    });
}

#[test]
fn stale_read_version_is_too_old() {
    run(async {
        let cluster = start_cluster(1).await;
        let client = cluster.client();

        let mut txn = client.begin();
        txn.set_read_version(1);
        assert_eq!(
            txn.get(&key("anything")).await,
            Err(ProxyError::TransactionTooOld)
        );
    });
}

#[test]
fn overlapping_write_conflicts() {
    run(async {
        let cluster = start_cluster(1).await;
        let client = cluster.client();

        // T1 takes its snapshot first.
        let mut t1 = client.begin();
        let v1 = t1.get_read_version().await.unwrap();

        // T2 writes the contended key and commits at a later version.
        let mut t2 = client.begin();
        t2.set(&key("a"), b"1");
        let reply = t2.commit().await.unwrap();
        assert!(reply.version > v1);

        // T1 declares it read the key at its old snapshot, then writes it.
        t1.set(&key("a"), b"2");
        t1.add_read_conflict_range(&key("a"), &key_after(&key("a")));
        assert_eq!(
            t1.commit().await,
            Err(ProxyError::NotCommitted { conflicting_ranges: None })
        );

        // T2's write survives.
        let mut check = client.begin();
        assert_eq!(check.get(&key("a")).await.unwrap(), Some(b"1".to_vec()));
    });
}

#[test]
fn starved_batch_priority_is_throttled_immediately() {
    run(async {
        let config = LocalClusterConfig {
            knobs: Arc::new(test_knobs()),
            resolver_count: 1,
            batch_transaction_rate: 0.5,
            ..Default::default()
        };
        let cluster = LocalCluster::start(config).await;
        let client = cluster.client();

        let mut txn = client.begin();
        txn.priority = vellum_core::types::TransactionPriority::Batch;
        assert_eq!(
            txn.get_read_version().await,
            Err(ProxyError::BatchTransactionThrottled)
        );
    });
}
