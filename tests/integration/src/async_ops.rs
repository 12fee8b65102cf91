//! Commands on the event loops.

use std::time::Duration;

use spire_client::{Client, ClientError, Key, Value};

use crate::helpers::{wait_for, FakeCluster, Faults, NAMESPACE};

#[tokio::test]
async fn async_commands_round_trip() {
    let cluster = FakeCluster::start(2);
    let client = Client::connect(cluster.config()).unwrap();
    let key = Key::new(NAMESPACE, "async", "k1").unwrap();

    client.put_async(&key, &[("n", Value::Int(3))]).await.unwrap();
    assert!(client.exists_async(&key).await.unwrap());
    let record = client.get_async(&key, &[]).await.unwrap().unwrap();
    assert_eq!(record.get("n"), Some(&Value::Int(3)));
    client.touch_async(&key, 60).await.unwrap();
    assert!(client.delete_async(&key).await.unwrap());
    assert!(client.get_async(&key, &[]).await.unwrap().is_none());
}

#[test]
fn async_and_sync_see_the_same_records() {
    let cluster = FakeCluster::start(2);
    let client = Client::connect(cluster.config()).unwrap();
    let keys: Vec<Key> = (0..20_i64)
        .map(|i| Key::new(NAMESPACE, "mixed", i).unwrap())
        .collect();

    let handles: Vec<_> = keys
        .iter()
        .enumerate()
        .map(|(i, k)| client.put_async(k, &[("i", Value::Int(i as i64))]))
        .collect();
    for handle in handles {
        handle.wait_blocking().unwrap();
    }
    for (i, key) in keys.iter().enumerate() {
        let record = client.get(key, &[]).unwrap().unwrap();
        assert_eq!(record.get("i"), Some(&Value::Int(i as i64)));
    }
}

#[test]
fn pipelined_commands_reuse_one_connection_per_node() {
    let cluster = FakeCluster::start(1);
    let mut config = cluster.config();
    config.event_loops.pipelining = true;
    let client = Client::connect(config).unwrap();
    let before = cluster.nodes[0].connections();

    let handles: Vec<_> = (0..10_i64)
        .map(|i| {
            let key = Key::new(NAMESPACE, "pipe", i).unwrap();
            client.put_async(&key, &[("i", Value::Int(i))])
        })
        .collect();
    for handle in handles {
        handle.wait_blocking().unwrap();
    }
    assert_eq!(cluster.nodes[0].connections() - before, 1);
}

#[test]
fn aborted_command_completes_once_and_frees_its_connection() {
    let cluster = FakeCluster::start(1);
    let mut config = cluster.config();
    config.policy.socket_timeout = Duration::from_secs(5);
    config.policy.total_timeout = Duration::from_secs(5);
    let client = Client::connect(config).unwrap();
    cluster.nodes[0].set_faults(Faults {
        delay: Duration::from_secs(1),
        ..Faults::default()
    });

    let key = Key::new(NAMESPACE, "abort", 1_i64).unwrap();
    let mut handle = client.get_async(&key, &[]);
    assert!(wait_for(Duration::from_secs(2), || cluster.nodes[0].requests() > 0));
    handle.abort();
    assert!(matches!(handle.wait_blocking(), Err(ClientError::Aborted)));
}

#[test]
fn closing_the_client_aborts_pending_commands() {
    let cluster = FakeCluster::start(1);
    let mut config = cluster.config();
    config.policy.socket_timeout = Duration::from_secs(5);
    config.policy.total_timeout = Duration::from_secs(5);
    let client = Client::connect(config).unwrap();
    cluster.nodes[0].set_faults(Faults {
        delay: Duration::from_secs(1),
        ..Faults::default()
    });

    let key = Key::new(NAMESPACE, "close", 1_i64).unwrap();
    let handle = client.get_async(&key, &[]);
    assert!(wait_for(Duration::from_secs(2), || cluster.nodes[0].requests() > 0));
    client.close();
    assert!(matches!(handle.wait_blocking(), Err(ClientError::Aborted)));
}
