//! Connecting from a configuration file.

use std::io::Write;

use spire_client::{Client, ClientError, Key, ReplicaPolicy, Value};

use crate::helpers::{FakeCluster, NAMESPACE};

#[test]
fn client_from_toml_file() {
    let cluster = FakeCluster::start(2);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
seeds = ["{}"]

[policy]
replica = "master"
max_retries = 1
socket_timeout = "200ms"
total_timeout = "1s"

[tend]
interval = "50ms"

[event_loops]
count = 2
pipelining = true
"#,
        cluster.nodes[0].addr
    )
    .unwrap();

    let client = Client::from_file(file.path()).unwrap();
    assert_eq!(client.policy().replica, ReplicaPolicy::Master);
    assert_eq!(client.cluster().node_names().len(), 2);

    let key = Key::new(NAMESPACE, "file", "k").unwrap();
    client.put_async(&key, &[("v", Value::Int(2))]).wait_blocking().unwrap();
    assert!(client.exists(&key).unwrap());
}

#[test]
fn invalid_file_is_rejected_before_connecting() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
seeds = ["127.0.0.1:1"]

[policy]
socket_timeout = "5s"
total_timeout = "1s"
"#
    )
    .unwrap();
    let err = Client::from_file(file.path()).unwrap_err();
    assert!(matches!(err, ClientError::Config(_)), "{err:?}");
}
