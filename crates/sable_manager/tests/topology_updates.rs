mod common;

use std::time::Duration;

use common::{maintenance_topology, start_node, test_config};
use sable_core::Role;
use sable_manager::MetaEvent;

#[tokio::test]
async fn set_topology_is_readable_and_tracked_globally() {
    let node = start_node(test_config(), Role::Leader);
    let mut updates = node.manager.listen_topology_update("t1").unwrap();

    let topology = maintenance_topology("default");
    node.manager.set_topology_by_bucket(&topology).await.unwrap();

    assert_eq!(
        node.manager.get_topology_by_bucket("default").unwrap(),
        Some(topology.clone())
    );
    let global = node
        .manager
        .get_global_topology()
        .unwrap()
        .expect("global index written alongside the first topology");
    assert_eq!(global.topology_keys, vec!["topology/default".to_string()]);

    let event = tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("topology update notification")
        .unwrap();
    match event {
        MetaEvent::TopologyUpdated { bucket } => assert_eq!(bucket, "default"),
        other => panic!("unexpected event {other:?}"),
    }

    // Replacing the topology must not duplicate the global key.
    let mut replaced = topology;
    replaced.version = 2;
    node.manager.set_topology_by_bucket(&replaced).await.unwrap();
    let global = node.manager.get_global_topology().unwrap().unwrap();
    assert_eq!(global.topology_keys.len(), 1);
    assert_eq!(
        node.manager
            .get_topology_by_bucket("default")
            .unwrap()
            .unwrap()
            .version,
        2
    );

    node.manager.close().await;
}

#[tokio::test]
async fn topology_committed_while_leader_opens_streams() {
    // Leadership gained with no topology: nothing to open yet.
    let node = start_node(test_config(), Role::Leader);

    node.manager
        .set_topology_by_bucket(&maintenance_topology("default"))
        .await
        .unwrap();
    let opened = node.source.wait_for_opens(1).await;
    assert_eq!(opened[0].bucket, "default");

    // Replacing the same topology must not double-subscribe its stream;
    // a new bucket still gets one.
    let mut replaced = maintenance_topology("default");
    replaced.version = 2;
    node.manager.set_topology_by_bucket(&replaced).await.unwrap();
    node.manager
        .set_topology_by_bucket(&maintenance_topology("other"))
        .await
        .unwrap();

    let opened = node.source.wait_for_opens(2).await;
    assert_eq!(opened[1].bucket, "other");
    // Give any stray duplicate scan time to surface before counting.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        node.source.opened().len(),
        2,
        "no duplicate subscription for a replaced topology"
    );

    node.manager.close().await;
}

#[tokio::test]
async fn cleanup_removes_topologies_and_global_index() {
    let node = start_node(test_config(), Role::Leader);
    node.manager
        .set_topology_by_bucket(&maintenance_topology("one"))
        .await
        .unwrap();
    node.manager
        .set_topology_by_bucket(&maintenance_topology("two"))
        .await
        .unwrap();

    node.manager.cleanup_topology().await.unwrap();

    assert_eq!(node.manager.get_topology_by_bucket("one").unwrap(), None);
    assert_eq!(node.manager.get_topology_by_bucket("two").unwrap(), None);
    assert_eq!(node.manager.get_global_topology().unwrap(), None);

    node.manager.close().await;
}
