//! Authentication on sync, async and tend connections.

use spire_client::{Client, ClientConfig, ClientError, Key, Value};

use crate::helpers::{FakeCluster, NAMESPACE};

fn secured(cluster: &FakeCluster) {
    for node in &cluster.nodes {
        node.require_auth("admin", "s3cret");
    }
}

fn with_credentials(mut config: ClientConfig, credential: &str) -> ClientConfig {
    config.auth.user = Some("admin".into());
    config.auth.credential = Some(credential.into());
    config
}

#[test]
fn authenticated_client_runs_commands() {
    let cluster = FakeCluster::start(2);
    secured(&cluster);
    let client = Client::connect(with_credentials(cluster.config(), "s3cret")).unwrap();
    let key = Key::new(NAMESPACE, "auth", "k").unwrap();

    client.put(&key, &[("v", Value::Int(1))]).unwrap();
    let record = client.get_async(&key, &[]).wait_blocking().unwrap();
    assert_eq!(record.unwrap().get("v"), Some(&Value::Int(1)));
}

#[test]
fn wrong_credential_finds_no_seed() {
    let cluster = FakeCluster::start(1);
    secured(&cluster);
    let err = Client::connect(with_credentials(cluster.config(), "wrong")).unwrap_err();
    assert!(matches!(err, ClientError::NoSeeds), "{err:?}");
}

#[test]
fn user_without_credential_is_a_config_error() {
    let cluster = FakeCluster::start(1);
    let mut config = cluster.config();
    config.auth.user = Some("admin".into());
    let err = Client::connect(config).unwrap_err();
    assert!(matches!(err, ClientError::Config(_)));
}
