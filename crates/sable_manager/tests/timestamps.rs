mod common;

use std::time::Duration;

use common::{maintenance_topology, start_node, test_config, wait_until};
use sable_core::{Role, StreamId, TsVbuuid};

#[tokio::test]
async fn reports_are_merged_committed_and_broadcast() {
    let node = start_node(test_config(), Role::Follower);
    node.manager
        .set_topology_by_bucket(&maintenance_topology("default"))
        .await
        .unwrap();
    let mut broadcast = node
        .manager
        .stability_timestamp_channel(StreamId::Maintenance);

    node.log.set_role(Role::Leader);
    let opened = node.source.wait_for_opens(1).await;
    assert_eq!(opened[0].stream_id, StreamId::Maintenance);
    assert_eq!(opened[0].bucket, "default");
    assert_eq!(opened[0].vbuckets, vec![0, 1, 2, 3]);
    assert!(opened[0].start.is_empty(), "no checkpoint on first open");

    node.source.send_report(0, TsVbuuid::new(0, 5, 1)).await;
    node.source.send_report(0, TsVbuuid::new(1, 7, 1)).await;

    let manager = node.manager.clone();
    wait_until(
        || {
            manager
                .stability_timestamp_for_vb(StreamId::Maintenance, "default", 1)
                .unwrap()
                == Some((7, 1))
        },
        "reports committed to the checkpoint",
    )
    .await;
    assert_eq!(
        node.manager
            .stability_timestamp_for_vb(StreamId::Maintenance, "default", 0)
            .unwrap(),
        Some((5, 1))
    );

    // Every committed merge is fanned out to subscribers; the last one seen
    // must cover both reports.
    let mut last = tokio::time::timeout(Duration::from_secs(5), broadcast.recv())
        .await
        .expect("committed timestamp broadcast")
        .unwrap();
    wait_until(
        || {
            while let Ok(ts) = broadcast.try_recv() {
                last = ts;
            }
            last.get(0).map(|e| e.seqno) == Some(5) && last.get(1).map(|e| e.seqno) == Some(7)
        },
        "broadcast covers both reports",
    )
    .await;
    assert_eq!(last.stream_id, StreamId::Maintenance);
    assert_eq!(last.bucket, "default");

    node.manager.close().await;
}

#[tokio::test]
async fn stale_seqno_in_same_epoch_does_not_regress() {
    let node = start_node(test_config(), Role::Follower);
    node.manager
        .set_topology_by_bucket(&maintenance_topology("default"))
        .await
        .unwrap();
    node.log.set_role(Role::Leader);
    node.source.wait_for_opens(1).await;

    node.source.send_report(0, TsVbuuid::new(0, 5, 1)).await;
    let manager = node.manager.clone();
    wait_until(
        || {
            manager
                .stability_timestamp_for_vb(StreamId::Maintenance, "default", 0)
                .unwrap()
                == Some((5, 1))
        },
        "initial report committed",
    )
    .await;

    // Stale within the same epoch: ignored. Use a second vbucket as a
    // sequencing marker so the checkpoint read below is post-stale.
    node.source.send_report(0, TsVbuuid::new(0, 3, 1)).await;
    node.source.send_report(0, TsVbuuid::new(1, 1, 1)).await;
    wait_until(
        || {
            manager
                .stability_timestamp_for_vb(StreamId::Maintenance, "default", 1)
                .unwrap()
                == Some((1, 1))
        },
        "marker report committed",
    )
    .await;
    assert_eq!(
        node.manager
            .stability_timestamp_for_vb(StreamId::Maintenance, "default", 0)
            .unwrap(),
        Some((5, 1)),
        "lower seqno in the same epoch must not replace the entry"
    );

    node.manager.close().await;
}

#[tokio::test]
async fn higher_epoch_wins_even_with_lower_seqno() {
    let node = start_node(test_config(), Role::Follower);
    node.manager
        .set_topology_by_bucket(&maintenance_topology("default"))
        .await
        .unwrap();
    node.log.set_role(Role::Leader);
    node.source.wait_for_opens(1).await;

    node.source.send_report(0, TsVbuuid::new(0, 100, 1)).await;
    let manager = node.manager.clone();
    wait_until(
        || {
            manager
                .stability_timestamp_for_vb(StreamId::Maintenance, "default", 0)
                .unwrap()
                == Some((100, 1))
        },
        "pre-failover report committed",
    )
    .await;

    // Vbucket failover: the new epoch truncates history, so a lower seqno
    // under a higher epoch replaces the entry.
    node.source.send_report(0, TsVbuuid::new(0, 4, 2)).await;
    wait_until(
        || {
            manager
                .stability_timestamp_for_vb(StreamId::Maintenance, "default", 0)
                .unwrap()
                == Some((4, 2))
        },
        "post-failover report committed",
    )
    .await;

    node.manager.close().await;
}

#[tokio::test]
async fn failed_timestamp_submit_is_retried_on_later_reports() {
    let node = start_node(test_config(), Role::Follower);
    node.manager
        .set_topology_by_bucket(&maintenance_topology("default"))
        .await
        .unwrap();
    node.log.set_role(Role::Leader);
    node.source.wait_for_opens(1).await;

    node.source.send_report(0, TsVbuuid::new(0, 5, 1)).await;
    let manager = node.manager.clone();
    wait_until(
        || {
            manager
                .stability_timestamp_for_vb(StreamId::Maintenance, "default", 0)
                .unwrap()
                == Some((5, 1))
        },
        "initial report committed",
    )
    .await;

    // The keeper is the only proposer from here on; its next two submits
    // fail, the stream stays dirty, and a later report retries the merged
    // value.
    node.log.fail_next_proposes(2);
    node.source.send_report(0, TsVbuuid::new(0, 6, 1)).await;
    node.source.send_report(0, TsVbuuid::new(0, 7, 1)).await;
    node.source.send_report(0, TsVbuuid::new(0, 8, 1)).await;
    wait_until(
        || {
            manager
                .stability_timestamp_for_vb(StreamId::Maintenance, "default", 0)
                .unwrap()
                == Some((8, 1))
        },
        "merged value committed after submit failures",
    )
    .await;

    node.manager.close().await;
}

#[tokio::test]
async fn cleanup_discards_persisted_checkpoints() {
    let node = start_node(test_config(), Role::Follower);
    node.manager
        .set_topology_by_bucket(&maintenance_topology("default"))
        .await
        .unwrap();
    node.log.set_role(Role::Leader);
    node.source.wait_for_opens(1).await;

    node.source.send_report(0, TsVbuuid::new(0, 9, 1)).await;
    let manager = node.manager.clone();
    wait_until(
        || {
            manager
                .stability_timestamp_for_vb(StreamId::Maintenance, "default", 0)
                .unwrap()
                == Some((9, 1))
        },
        "report committed before cleanup",
    )
    .await;

    node.manager.cleanup_stability_timestamp().await.unwrap();
    assert_eq!(
        node.manager
            .stability_timestamp_for_vb(StreamId::Maintenance, "default", 0)
            .unwrap(),
        None
    );

    node.manager.close().await;
}
