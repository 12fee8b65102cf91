//! Record commands against a healthy cluster.

use spire_client::{Client, ClientError, Key, ResultCode, Value, WriteOptions};

use crate::helpers::{FakeCluster, NAMESPACE, N_PARTITIONS};

fn connect(cluster: &FakeCluster) -> Client {
    Client::connect(cluster.config()).unwrap()
}

#[test]
fn discovers_every_node_from_one_seed() {
    let cluster = FakeCluster::start(3);
    let client = connect(&cluster);
    let mut names = client.cluster().node_names();
    names.sort();
    assert_eq!(names, ["N0", "N1", "N2"]);
}

#[test]
fn put_then_get() {
    let cluster = FakeCluster::start(2);
    let client = connect(&cluster);
    let key = Key::new(NAMESPACE, "users", "alice").unwrap();

    client
        .put(&key, &[("name", Value::from("alice")), ("age", Value::Int(31))])
        .unwrap();
    let record = client.get(&key, &[]).unwrap().unwrap();
    assert_eq!(record.get("name"), Some(&Value::from("alice")));
    assert_eq!(record.get("age"), Some(&Value::Int(31)));
    assert_eq!(record.generation, 1);

    let partial = client.get(&key, &["age"]).unwrap().unwrap();
    assert_eq!(partial.bins.len(), 1);
}

#[test]
fn commands_go_to_the_partition_master() {
    let cluster = FakeCluster::start(2);
    let client = connect(&cluster);
    let key = Key::new(NAMESPACE, "users", 42_i64).unwrap();
    let master = cluster.master_of(&key.digest);
    let before: Vec<usize> = cluster.nodes.iter().map(|n| n.requests()).collect();

    client.put(&key, &[("n", Value::Int(1))]).unwrap();
    for (node, before) in cluster.nodes.iter().zip(before) {
        let expected = if node.name == master.name { 1 } else { 0 };
        assert_eq!(node.requests() - before, expected, "node {}", node.name);
    }
}

#[test]
fn batch_get_asks_each_master_once() {
    let cluster = FakeCluster::start(3);
    let client = connect(&cluster);
    let keys: Vec<Key> = (0..12_i64)
        .map(|i| Key::new(NAMESPACE, "users", i).unwrap())
        .collect();
    for (i, key) in keys.iter().enumerate() {
        // every third key stays missing
        if i % 3 != 2 {
            client
                .put(key, &[("n", Value::Int(i as i64)), ("pad", Value::from("x"))])
                .unwrap();
        }
    }

    let mut masters: Vec<&str> = keys
        .iter()
        .map(|k| cluster.master_of(&k.digest).name.as_str())
        .collect();
    masters.sort();
    masters.dedup();
    let before: usize = cluster.nodes.iter().map(|n| n.requests()).sum();

    let records = client.batch_get(&keys, &["n"]).unwrap();

    let after: usize = cluster.nodes.iter().map(|n| n.requests()).sum();
    assert_eq!(after - before, masters.len());
    assert_eq!(records.len(), keys.len());
    for (i, record) in records.iter().enumerate() {
        match record {
            Some(record) => {
                assert_ne!(i % 3, 2, "key {i} should be missing");
                assert_eq!(record.get("n"), Some(&Value::Int(i as i64)));
                assert_eq!(record.bins.len(), 1);
            }
            None => assert_eq!(i % 3, 2, "key {i} should exist"),
        }
    }
}

#[test]
fn missing_records() {
    let cluster = FakeCluster::start(1);
    let client = connect(&cluster);
    let key = Key::new(NAMESPACE, "users", "nobody").unwrap();

    assert!(client.get(&key, &[]).unwrap().is_none());
    assert!(!client.exists(&key).unwrap());
    assert!(!client.delete(&key).unwrap());
    let err = client.touch(&key, 60).unwrap_err();
    assert_eq!(err.result_code(), ResultCode::KeyNotFound);
}

#[test]
fn exists_delete_and_touch() {
    let cluster = FakeCluster::start(1);
    let client = connect(&cluster);
    let key = Key::new(NAMESPACE, "users", "bob").unwrap();

    client.put(&key, &[("n", Value::Int(1))]).unwrap();
    assert!(client.exists(&key).unwrap());

    client.touch(&key, 300).unwrap();
    let record = client.get(&key, &[]).unwrap().unwrap();
    assert_eq!(record.ttl, 300);
    assert_eq!(record.generation, 2);

    assert!(client.delete(&key).unwrap());
    assert!(!client.exists(&key).unwrap());
}

#[test]
fn write_conditions_are_terminal() {
    let cluster = FakeCluster::start(1);
    let client = connect(&cluster);
    let key = Key::new(NAMESPACE, "users", "carol").unwrap();
    let create = WriteOptions {
        create_only: true,
        ..WriteOptions::default()
    };

    client.put_with(&key, &[("n", Value::Int(1))], create).unwrap();
    let err = client
        .put_with(&key, &[("n", Value::Int(2))], create)
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Server {
            code: ResultCode::KeyExists,
            in_doubt: false
        }
    ));

    let stale = WriteOptions {
        expected_generation: Some(7),
        ..WriteOptions::default()
    };
    let requests = cluster.nodes[0].requests();
    let err = client
        .put_with(&key, &[("n", Value::Int(3))], stale)
        .unwrap_err();
    assert_eq!(err.result_code(), ResultCode::GenerationMismatch);
    assert_eq!(cluster.nodes[0].requests() - requests, 1);
}

#[test]
fn large_requests_are_compressed() {
    let cluster = FakeCluster::start(1);
    let mut config = cluster.config();
    config.policy.compress_threshold = 128;
    let client = Client::connect(config).unwrap();
    let key = Key::new(NAMESPACE, "blobs", "big").unwrap();
    let blob = Value::Blob(vec![7u8; 64 * 1024].into());

    client.put(&key, &[("data", blob.clone())]).unwrap();
    let record = client.get(&key, &[]).unwrap().unwrap();
    assert_eq!(record.get("data"), Some(&blob));
}

#[test]
fn scan_returns_the_partitions_records() {
    let cluster = FakeCluster::start(1);
    let client = connect(&cluster);

    let mut keys = Vec::new();
    for i in 0..50_i64 {
        let key = Key::new(NAMESPACE, "scan", i).unwrap();
        client.put(&key, &[("i", Value::Int(i))]).unwrap();
        keys.push(key);
    }
    let target = keys[0].partition_id(N_PARTITIONS);
    let expected = keys
        .iter()
        .filter(|k| k.partition_id(N_PARTITIONS) == target)
        .count();

    let records = client
        .scan_partition(NAMESPACE, Some("scan"), vec![target], &[])
        .unwrap();
    assert_eq!(records.len(), expected);
    assert!(records.iter().any(|r| r.digest == keys[0].digest));

    let empty = (0..N_PARTITIONS)
        .find(|p| keys.iter().all(|k| k.partition_id(N_PARTITIONS) != *p))
        .unwrap();
    let records = client
        .scan_partition(NAMESPACE, None, vec![empty], &[])
        .unwrap();
    assert!(records.is_empty());
}
