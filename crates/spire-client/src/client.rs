//! The public client API.

use std::path::Path;

use spire_protocol::Value;
use tracing::debug;

use crate::cluster::Cluster;
use crate::command::{Operation, Record, ScanCommand, ScannedRecord, SingleCommand, WriteOptions};
use crate::config::{ClientConfig, PolicyConfig};
use crate::error::ClientError;
use crate::event::CommandHandle;
use crate::key::Key;

/// A client bound to one cluster.
///
/// Blocking methods run on the calling thread. The `_async` variants run
/// on the cluster's event loops and return a [`CommandHandle`] that can be
/// awaited, waited on, or aborted.
#[derive(Debug)]
pub struct Client {
    cluster: Cluster,
    policy: PolicyConfig,
}

impl Client {
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let policy = config.policy;
        Ok(Self {
            cluster: Cluster::connect(config)?,
            policy,
        })
    }

    /// Connects with configuration read from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        Self::connect(ClientConfig::from_file(path)?)
    }

    pub(crate) fn from_cluster(cluster: Cluster) -> Self {
        let policy = cluster.config().policy;
        Self { cluster, policy }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// The policy commands run with.
    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Replaces the default policy for commands issued from now on.
    pub fn set_policy(&mut self, policy: PolicyConfig) {
        self.policy = policy;
    }

    /// Reads a record. Empty `bins` reads all of them. Returns `None` when
    /// the record doesn't exist.
    pub fn get(&self, key: &Key, bins: &[&str]) -> Result<Option<Record>, ClientError> {
        let mut cmd = self.single(key, get_op(bins));
        self.cluster.execute(&mut cmd, &self.policy)?;
        Ok(cmd.into_record())
    }

    pub fn put(&self, key: &Key, bins: &[(&str, Value)]) -> Result<(), ClientError> {
        self.put_with(key, bins, WriteOptions::default())
    }

    pub fn put_with(
        &self,
        key: &Key,
        bins: &[(&str, Value)],
        options: WriteOptions,
    ) -> Result<(), ClientError> {
        let mut cmd = self.single(key, put_op(bins, options));
        self.cluster.execute(&mut cmd, &self.policy)
    }

    /// Deletes a record. Returns whether it existed.
    pub fn delete(&self, key: &Key) -> Result<bool, ClientError> {
        let mut cmd = self.single(key, Operation::Delete {
            options: WriteOptions::default(),
        });
        self.cluster.execute(&mut cmd, &self.policy)?;
        Ok(cmd.found())
    }

    pub fn exists(&self, key: &Key) -> Result<bool, ClientError> {
        let mut cmd = self.single(key, Operation::Exists);
        self.cluster.execute(&mut cmd, &self.policy)?;
        Ok(cmd.found())
    }

    /// Resets a record's TTL to `ttl` seconds (zero: namespace default).
    /// Fails with `KeyNotFound` when there's no record.
    pub fn touch(&self, key: &Key, ttl: u32) -> Result<(), ClientError> {
        let mut cmd = self.single(key, touch_op(ttl));
        self.cluster.execute(&mut cmd, &self.policy)
    }

    /// Reads every record of the given partitions. The partitions must be
    /// owned by one node; the first one picks the node.
    ///
    /// A scan that already received records is not retried: a retry
    /// would deliver them twice.
    pub fn scan_partition(
        &self,
        namespace: &str,
        set: Option<&str>,
        partitions: Vec<u32>,
        bins: &[&str],
    ) -> Result<Vec<ScannedRecord>, ClientError> {
        let n_partitions = self.cluster.n_partitions();
        if let Some(&p) = partitions.iter().find(|&&p| p >= n_partitions) {
            return Err(ClientError::InvalidArgument(format!(
                "partition {p} out of range (cluster has {n_partitions})"
            )));
        }
        let mut cmd = ScanCommand::new(
            namespace,
            set,
            partitions,
            bins.iter().map(|b| b.to_string()).collect(),
            millis(self.policy.socket_timeout),
        )?;
        self.cluster.execute(&mut cmd, &self.policy)?;
        debug!(namespace, done = cmd.partitions_done(), "partition scan finished");
        Ok(cmd.into_records())
    }

    /// Reads many records with one request per serving node, asking the
    /// nodes one after another. The result holds one entry per key, in key
    /// order, `None` where the record doesn't exist. Empty `bins` reads
    /// all of them.
    pub fn batch_get(
        &self,
        keys: &[Key],
        bins: &[&str],
    ) -> Result<Vec<Option<Record>>, ClientError> {
        let bins: Vec<String> = bins.iter().map(|b| b.to_string()).collect();
        let mut records = vec![None; keys.len()];
        for mut cmd in self.cluster.batch(keys, &bins, &self.policy)? {
            self.cluster.execute(&mut cmd, &self.policy)?;
            debug!(node = cmd.node().name(), keys = cmd.len(), "batch node finished");
            for (index, record) in cmd.into_results() {
                records[index] = record;
            }
        }
        Ok(records)
    }

    pub fn get_async(&self, key: &Key, bins: &[&str]) -> CommandHandle<Option<Record>> {
        let cmd = self.single(key, get_op(bins));
        self.cluster
            .submit(cmd, self.policy, |cmd| Ok(cmd.into_record()))
    }

    pub fn put_async(&self, key: &Key, bins: &[(&str, Value)]) -> CommandHandle<()> {
        let cmd = self.single(key, put_op(bins, WriteOptions::default()));
        self.cluster.submit(cmd, self.policy, |_| Ok(()))
    }

    pub fn delete_async(&self, key: &Key) -> CommandHandle<bool> {
        let cmd = self.single(key, Operation::Delete {
            options: WriteOptions::default(),
        });
        self.cluster.submit(cmd, self.policy, |cmd| Ok(cmd.found()))
    }

    pub fn exists_async(&self, key: &Key) -> CommandHandle<bool> {
        let cmd = self.single(key, Operation::Exists);
        self.cluster.submit(cmd, self.policy, |cmd| Ok(cmd.found()))
    }

    pub fn touch_async(&self, key: &Key, ttl: u32) -> CommandHandle<()> {
        let cmd = self.single(key, touch_op(ttl));
        self.cluster.submit(cmd, self.policy, |_| Ok(()))
    }

    /// Closes the cluster. See [`Cluster::close`].
    pub fn close(&self) {
        self.cluster.close();
    }

    fn single(&self, key: &Key, op: Operation) -> SingleCommand {
        SingleCommand::new(key.clone(), self.cluster.n_partitions(), op)
    }
}

fn get_op(bins: &[&str]) -> Operation {
    Operation::Get {
        bins: bins.iter().map(|b| b.to_string()).collect(),
    }
}

fn put_op(bins: &[(&str, Value)], options: WriteOptions) -> Operation {
    Operation::Put {
        bins: bins
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect(),
        options,
    }
}

fn touch_op(ttl: u32) -> Operation {
    Operation::Touch {
        options: WriteOptions {
            ttl,
            ..WriteOptions::default()
        },
    }
}

fn millis(d: std::time::Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::tender::tests::{two_nodes, FakeCluster};

    fn client() -> Client {
        let fake = FakeCluster::default();
        two_nodes(&fake);
        let config = ClientConfig {
            seeds: vec!["10.0.0.1:3000".into()],
            ..ClientConfig::default()
        };
        Client::from_cluster(Cluster::start(config, Arc::new(fake), None, None).unwrap())
    }

    #[test]
    fn put_without_bins_is_rejected_before_routing() {
        let client = client();
        let key = Key::new("test", "users", "alice").unwrap();
        let err = client.put(&key, &[]).unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[test]
    fn scan_checks_partition_ids() {
        let client = client();
        let err = client
            .scan_partition("test", None, vec![4096], &[])
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
        let err = client.scan_partition("test", None, vec![], &[]).unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[test]
    fn empty_batch_needs_no_nodes() {
        let client = client();
        assert!(client.batch_get(&[], &["a"]).unwrap().is_empty());
    }

    #[test]
    fn commands_after_close_fail() {
        let client = client();
        client.close();
        let key = Key::new("test", "users", 7_i64).unwrap();
        assert!(matches!(client.exists(&key), Err(ClientError::Closed)));
        assert!(matches!(
            client.batch_get(&[key.clone()], &[]),
            Err(ClientError::Closed)
        ));
        let handle = client.exists_async(&key);
        assert!(matches!(handle.wait_blocking(), Err(ClientError::Aborted)));
    }

    #[test]
    fn policy_can_be_replaced() {
        let mut client = client();
        let mut policy = *client.policy();
        policy.max_retries = 0;
        client.set_policy(policy);
        assert_eq!(client.policy().max_retries, 0);
    }
}
