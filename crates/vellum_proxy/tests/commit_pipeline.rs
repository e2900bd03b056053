//! Commit pipeline behavior across batches, resolvers and the log.

mod common;

use common::{key, run, start_cluster};

use tokio::sync::oneshot;

use vellum_core::keys;
use vellum_core::messages::{decode_mutation, GetKeyServerLocationsRequest};
use vellum_core::types::{key_after, Mutation, VERSIONSTAMP_SIZE};
use vellum_core::ProxyError;

#[test]
fn commit_versions_strictly_increase() {
    run(async {
        let cluster = start_cluster(1).await;
        let client = cluster.client();

        let mut last = 0;
        for i in 0..10 {
            let mut txn = client.begin();
            txn.set(&key(&format!("mono/{i}")), b"v");
            let reply = txn.commit().await.unwrap();
            assert!(reply.version > last, "versions must strictly increase");
            last = reply.version;
        }
    });
}

#[test]
fn committed_version_reported_before_reply() {
    run(async {
        let cluster = start_cluster(1).await;
        let client = cluster.client();

        let mut txn = client.begin();
        txn.set(&key("reported"), b"v");
        let reply = txn.commit().await.unwrap();

        // By the time the client holds the reply, the master has seen the
        // report for that version.
        assert!(cluster
            .master
            .reports()
            .iter()
            .any(|report| report.version == reply.version));
        assert!(cluster.master.committed_version() >= reply.version);
    });
}

#[test]
fn any_disagreeing_resolver_fails_the_transaction() {
    run(async {
        // Keyspace split across two resolvers at "m".
        let cluster = start_cluster(2).await;
        let client = cluster.client();

        // Take the snapshot before the contended write.
        let mut reader = client.begin();
        reader.get_read_version().await.unwrap();

        let mut writer = client.begin();
        writer.set(b"rkey", b"1");
        writer.commit().await.unwrap();

        // The reader's range spans both resolvers; only the one owning
        // "rkey" sees a conflict, and that is enough.
        reader.set(b"bkey", b"2");
        reader.add_read_conflict_range(b"b", b"z");
        assert!(matches!(
            reader.commit().await,
            Err(ProxyError::NotCommitted { .. })
        ));

        // A fresh transaction touching both halves commits fine.
        let mut fresh = client.begin();
        fresh.set(b"bkey2", b"3");
        fresh.set(b"rkey2", b"4");
        fresh.commit().await.unwrap();
    });
}

#[test]
fn conflicting_range_indices_map_back_to_the_request() {
    run(async {
        let cluster = start_cluster(2).await;
        let client = cluster.client();

        let mut reader = client.begin();
        reader.get_read_version().await.unwrap();

        let mut writer = client.begin();
        writer.set(b"rkey", b"1");
        writer.commit().await.unwrap();

        // Index 0 cannot conflict; index 1 covers the contended key and is
        // routed to the second resolver, so the reply must translate the
        // resolver-local index back to 1.
        reader.report_conflicting_keys = true;
        reader.set(b"bval", b"x");
        reader.add_read_conflict_range(b"b0", b"b1");
        reader.add_read_conflict_range(b"r", b"s");
        match reader.commit().await {
            Err(ProxyError::NotCommitted { conflicting_ranges: Some(indices) }) => {
                assert_eq!(indices, vec![1]);
            }
            other => panic!("expected a conflict with indices, got {other:?}"),
        }
    });
}

#[test]
fn locked_database_rejects_non_lock_aware_commits() {
    run(async {
        let cluster = start_cluster(1).await;
        let client = cluster.client();

        let mut lock = client.begin();
        lock.set(keys::DATABASE_LOCKED_KEY, b"locked-uid");
        lock.commit().await.unwrap();

        let mut plain = client.begin();
        plain.set(&key("blocked"), b"v");
        assert!(matches!(
            plain.commit().await,
            Err(ProxyError::NotCommitted { .. })
        ));

        let mut aware = client.begin();
        aware.lock_aware = true;
        aware.set(&key("allowed"), b"v");
        aware.commit().await.unwrap();

        // The GRV path reports the lock to new transactions.
        let mut observer = client.begin();
        observer.lock_aware = true;
        let reply = observer.read_version_reply().await.unwrap();
        assert!(reply.locked);
    });
}

#[test]
fn versionstamped_key_lands_at_commit_version() {
    run(async {
        let cluster = start_cluster(1).await;
        let client = cluster.client();

        let prefix = key("vs/");
        let mut stamped = prefix.clone();
        stamped.extend_from_slice(&[0u8; VERSIONSTAMP_SIZE]);
        stamped.extend_from_slice(&(prefix.len() as u32).to_le_bytes());

        let mut txn = client.begin();
        txn.set_versionstamped_key(&stamped, b"payload");
        let reply = txn.commit().await.unwrap();

        let mut expected = prefix.clone();
        expected.extend_from_slice(&(reply.version as u64).to_be_bytes());
        expected.extend_from_slice(&reply.batch_index.to_be_bytes());

        let mut check = client.begin();
        assert_eq!(check.get(&expected).await.unwrap(), Some(b"payload".to_vec()));
    });
}

#[test]
fn pushes_respect_the_mvcc_window() {
    run(async {
        let cluster = start_cluster(1).await;
        let client = cluster.client();

        for i in 0..20 {
            let mut txn = client.begin();
            txn.set(&key(&format!("mvcc/{i}")), b"v");
            txn.commit().await.unwrap();
        }

        let window = common::test_knobs().max_read_transaction_life_versions;
        for push in cluster.log.pushes() {
            assert!(
                push.version - push.committed_version <= window,
                "push at {} exceeded the window over {}",
                push.version,
                push.committed_version
            );
        }
    });
}

#[test]
fn shard_reassignment_reshapes_location_lookups() {
    run(async {
        let cluster = start_cluster(1).await;
        let client = cluster.client();

        // Assign everything from "q" onward to storage server 2 only.
        let mut reassign = client.begin();
        reassign.set(
            &keys::key_servers_key(b"q"),
            &keys::encode_key_servers_value(&[2], &[]),
        );
        reassign.commit().await.unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        cluster
            .commit
            .locations
            .send(GetKeyServerLocationsRequest {
                begin: b"z".to_vec(),
                end: None,
                limit: 1,
                reverse: false,
                reply: reply_tx,
            })
            .unwrap();
        let reply = reply_rx.await.unwrap().unwrap();
        assert_eq!(reply.results.len(), 1);
        let (range, servers) = &reply.results[0];
        assert_eq!(range.begin, b"q".to_vec());
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, 2);
    });
}

#[test]
fn backup_registration_intercepts_mutations() {
    run(async {
        let cluster = start_cluster(1).await;
        let client = cluster.client();

        let destination = b"\xff\x02/blog/uid0/".to_vec();
        let mut register = client.begin();
        register.set(
            &keys::log_ranges_key_for(common::P),
            &keys::encode_log_range_value(&key_after(&key("zzz")), &destination),
        );
        register.commit().await.unwrap();

        let mut txn = client.begin();
        txn.set(&key("backed"), b"v");
        txn.commit().await.unwrap();

        // Some push carries a block-partitioned backup message under the
        // destination prefix.
        let found = cluster.log.pushes().iter().any(|push| {
            push.messages.iter().any(|tagged| {
                matches!(
                    decode_mutation(&tagged.message),
                    Ok(Mutation::Set { key, .. }) if key.starts_with(&destination)
                )
            })
        });
        assert!(found, "expected an intercepted backup mutation");
    });
}
