//! Retries, timeouts and node loss.

use std::time::{Duration, Instant};

use spire_client::{Client, ClientError, Key, Value};

use crate::helpers::{wait_for, FakeCluster, Faults, NAMESPACE};

/// A key mastered by node `index`.
fn key_on(cluster: &FakeCluster, index: usize) -> Key {
    (0..1000_i64)
        .map(|i| Key::new(NAMESPACE, "failover", i).unwrap())
        .find(|k| cluster.master_of(&k.digest).name == cluster.nodes[index].name)
        .unwrap()
}

#[test]
fn read_moves_to_the_replica_when_the_master_drops_connections() {
    let cluster = FakeCluster::start(2);
    let key = key_on(&cluster, 1);
    Client::connect(cluster.config())
        .unwrap()
        .put(&key, &[("v", Value::Int(9))])
        .unwrap();

    let reader = Client::connect(cluster.config()).unwrap();
    let master = &cluster.nodes[1];
    master.set_faults(Faults {
        drop_connections: 100,
        ..Faults::default()
    });
    let accepted = master.connections();

    let record = reader.get(&key, &[]).unwrap().unwrap();
    assert_eq!(record.get("v"), Some(&Value::Int(9)));
    assert!(master.connections() > accepted);
}

#[test]
fn stalled_write_times_out_in_doubt() {
    let cluster = FakeCluster::start(1);
    let client = Client::connect(cluster.config()).unwrap();
    let key = Key::new(NAMESPACE, "failover", "slow").unwrap();
    cluster.nodes[0].set_faults(Faults {
        delay: Duration::from_secs(2),
        ..Faults::default()
    });

    let started = Instant::now();
    let err = client.put(&key, &[("v", Value::Int(1))]).unwrap_err();
    assert!(matches!(err, ClientError::Timeout { client: true, .. }), "{err:?}");
    assert!(err.in_doubt());
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[test]
fn dead_node_is_dropped_and_replicas_take_over() {
    let cluster = FakeCluster::start(2);
    let key = key_on(&cluster, 1);
    let client = Client::connect(cluster.config()).unwrap();
    client.put(&key, &[("v", Value::Int(5))]).unwrap();

    cluster.nodes[1].stop();
    let gone = wait_for(Duration::from_secs(3), || {
        client.cluster().node_names() == ["N0"]
    });
    assert!(gone, "nodes: {:?}", client.cluster().node_names());

    let record = client.get(&key, &[]).unwrap().unwrap();
    assert_eq!(record.get("v"), Some(&Value::Int(5)));
}

#[test]
fn terminal_server_errors_are_not_retried() {
    let cluster = FakeCluster::start(2);
    let key = key_on(&cluster, 0);
    let client = Client::connect(cluster.config()).unwrap();
    cluster.nodes[0].set_faults(Faults {
        force_code: Some(spire_client::ResultCode::KeyBusy),
        ..Faults::default()
    });
    let before: usize = cluster.nodes.iter().map(|n| n.requests()).sum();

    let err = client.put(&key, &[("v", Value::Int(1))]).unwrap_err();
    let after: usize = cluster.nodes.iter().map(|n| n.requests()).sum();
    assert_eq!(err.result_code(), spire_client::ResultCode::KeyBusy);
    assert_eq!(after - before, 1);
}
