//! Cluster tending.
//!
//! Once per interval the tender refreshes every node over the info
//! protocol, discovers peers, reloads partition ownership when a node's
//! partition generation moved, and retires nodes that stopped answering.
//! In shared-memory mode only the tend master does this; every other
//! process copies the master's results out of the segment instead.
//!
//! Refresh failures are logged and never surface to callers: a stale but
//! previously valid topology keeps serving traffic.

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use spire_cluster::shm::now_ms;
use spire_cluster::{features, parse_replicas, Node, NodeInfo, SharedTopology, TendRole};
use spire_protocol::ProtocolError;
use tracing::{debug, info, warn};

use crate::cluster::ClusterInner;
use crate::error::ClientError;
use crate::executor::open;
use crate::transport::request_info;

/// Values asked of every node on every cycle.
const REFRESH: &[&str] = &[
    "node",
    "partition-generation",
    "features",
    "rack-ids",
    "services",
];

/// Stops the tender thread.
#[derive(Debug, Default)]
pub(crate) struct Shutdown {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Shutdown {
    /// Sleeps for `timeout` or until triggered. Returns true once
    /// triggered.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.wake.wait_for(&mut stopped, timeout);
        }
        *stopped
    }

    pub fn trigger(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }
}

/// What a node refresh learned.
enum Refresh {
    Alive { peers: Vec<SocketAddr> },
    /// Another node answers at this node's address.
    Renamed(String),
}

pub(crate) struct Tender {
    cluster: Arc<ClusterInner>,
    cycle: u64,
}

impl Tender {
    pub fn new(cluster: Arc<ClusterInner>) -> Self {
        Self { cluster, cycle: 0 }
    }

    /// Runs cycles every tend interval until `shutdown` fires.
    pub fn spawn(mut self, shutdown: Arc<Shutdown>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("spire-tend".into())
            .spawn(move || {
                let interval = self.cluster.config.tend.interval;
                while !shutdown.wait(interval) {
                    self.run_cycle();
                }
                debug!("tender stopped");
            })
    }

    /// One tend cycle.
    pub fn run_cycle(&mut self) {
        self.cycle += 1;
        let cluster = Arc::clone(&self.cluster);

        match &cluster.shared {
            Some(shared) => match shared.begin_cycle(now_ms()) {
                TendRole::Master => {
                    self.tend();
                    shared.heartbeat(now_ms());
                }
                TendRole::Follower => self.mirror(shared),
            },
            None => self.tend(),
        }

        let window = u64::from(cluster.config.tend.error_rate_window.max(1));
        let now = Instant::now();
        for node in cluster.registry.nodes() {
            if self.cycle % window == 0 {
                node.reset_error_window();
            }
            node.pool().trim_idle(now);
        }
    }

    fn mirror(&self, shared: &SharedTopology) {
        let cluster = &self.cluster;
        let result = shared.mirror_into(&cluster.registry, &cluster.partitions, |index, info| {
            cluster.make_node(index, info)
        });
        match result {
            Ok(outcome) if outcome.nodes_copied || outcome.partitions_copied => {
                debug!(
                    nodes = outcome.nodes_copied,
                    partitions = outcome.partitions_copied,
                    "mirrored shared topology"
                );
            }
            Ok(_) => {}
            Err(e) => warn!("failed to mirror shared topology: {e}"),
        }
    }

    /// Full tend: seed if needed, refresh nodes, add peers. Peers found
    /// during the cycle are refreshed in the same cycle, so a new node
    /// serves its partitions as soon as it is added.
    fn tend(&mut self) {
        let cluster = Arc::clone(&self.cluster);
        if cluster.registry.active_count() == 0 {
            self.seed();
        }

        let mut pending: Vec<Arc<Node>> = cluster
            .registry
            .nodes()
            .into_iter()
            .filter(|n| n.is_active())
            .collect();
        let mut tried = HashSet::new();
        while !pending.is_empty() {
            let mut peers = Vec::new();
            for node in &pending {
                match self.refresh(node) {
                    Ok(Refresh::Alive { peers: found }) => {
                        node.reset_tend_failures();
                        peers.extend(found);
                    }
                    Ok(Refresh::Renamed(name)) => {
                        warn!(node = node.name(), answered = %name, "node name changed");
                        self.remove(node, "name mismatch");
                    }
                    Err(e) => {
                        let failures = node.record_tend_failure();
                        warn!(node = node.name(), failures, "node refresh failed: {e}");
                        if failures >= cluster.config.tend.failure_limit {
                            self.remove(node, "unresponsive");
                        }
                    }
                }
            }
            pending = self.add_peers(peers, &mut tried);
        }
    }

    /// Adds the peers not known yet and returns the new nodes.
    fn add_peers(
        &self,
        peers: Vec<SocketAddr>,
        tried: &mut HashSet<SocketAddr>,
    ) -> Vec<Arc<Node>> {
        let known: HashSet<SocketAddr> = self
            .cluster
            .registry
            .nodes()
            .iter()
            .filter(|n| n.is_active())
            .flat_map(|n| n.addresses())
            .collect();
        let mut added = Vec::new();
        for addr in peers {
            if known.contains(&addr) || !tried.insert(addr) {
                continue;
            }
            match self.discover(addr) {
                Ok(Some(node)) => {
                    info!(node = node.name(), %addr, "added peer node");
                    added.push(node);
                }
                Ok(None) => {}
                Err(e) => warn!(%addr, "failed to add peer: {e}"),
            }
        }
        added
    }

    /// Adds nodes from the configured seed hosts.
    fn seed(&mut self) {
        let seeds = self.cluster.config.seeds.clone();
        for seed in &seeds {
            let addrs = match seed.to_socket_addrs() {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!(seed = %seed, "failed to resolve seed: {e}");
                    continue;
                }
            };
            for addr in addrs {
                match self.discover(addr) {
                    Ok(Some(node)) => info!(node = node.name(), %addr, "added seed node"),
                    Ok(None) => {}
                    Err(e) => warn!(seed = %seed, %addr, "seed unreachable: {e}"),
                }
            }
        }
    }

    /// Connects to `addr`, learns who answers there, and adds it unless
    /// it's already known under that name.
    fn discover(&self, addr: SocketAddr) -> Result<Option<Arc<Node>>, ClientError> {
        let cluster = &self.cluster;
        let timeout = cluster.config.tend.connect_timeout;
        let tls_name = cluster.config.tls.name.as_deref();
        let mut conn = cluster.connector.connect(addr, tls_name, timeout)?;
        let values = request_info(conn.as_mut(), &["node", "features"])?;
        let name = required(&values, "node")?.to_string();

        if let Some(existing) = cluster.registry.by_name(&name) {
            if existing.is_active() {
                let mut addresses = existing.addresses();
                if !addresses.contains(&addr) {
                    addresses.push(addr);
                    existing.set_addresses(addresses);
                }
                return Ok(None);
            }
        }

        let mut info = NodeInfo::new(name, addr);
        info.tls_name = cluster.config.tls.name.clone();
        info.features = values.get("features").map_or(0, |f| features::parse(f));
        let node = self.add(info)?;
        node.put_info_conn(conn);
        debug!(node = node.name(), %addr, index = node.index(), "discovered node");
        Ok(Some(node))
    }

    /// Registers a node. A tend master takes the index the shared segment
    /// assigns so every process agrees on it.
    fn add(&self, info: NodeInfo) -> Result<Arc<Node>, ClientError> {
        let cluster = &self.cluster;
        match &cluster.shared {
            Some(shared) if shared.is_master() => {
                let index = shared.publish_node(&info)?;
                Ok(cluster.registry.insert_at(cluster.make_node(index, info)))
            }
            _ => Ok(cluster
                .registry
                .insert_with(|index| cluster.make_node(index, info))),
        }
    }

    fn refresh(&self, node: &Arc<Node>) -> Result<Refresh, ClientError> {
        let cluster = &self.cluster;
        let values = self.info(node, REFRESH)?;

        let name = required(&values, "node")?;
        if name != node.name() {
            return Ok(Refresh::Renamed(name.to_string()));
        }
        if let Some(list) = values.get("features") {
            node.set_features(features::parse(list));
        }
        if let Some(value) = values.get("rack-ids") {
            let racks = parse_racks(value);
            if let Some((_, first)) = racks.first() {
                node.set_rack_id(*first);
            }
            node.set_racks(racks.into_iter().collect());
        }
        let shared = cluster.shared.as_ref().filter(|s| s.is_master());
        if let Some(shared) = shared {
            shared.publish_node(&node.info())?;
        }

        let generation: u32 = required(&values, "partition-generation")?
            .parse()
            .map_err(|_| malformed("partition-generation"))?;
        if node.needs_partition_refresh(generation) {
            self.load_partitions(node, shared)?;
            node.set_partition_generation(generation);
        }

        let peers = values
            .get("services")
            .map(|s| parse_services(s))
            .unwrap_or_default();
        Ok(Refresh::Alive { peers })
    }

    fn load_partitions(
        &self,
        node: &Arc<Node>,
        shared: Option<&SharedTopology>,
    ) -> Result<(), ClientError> {
        let cluster = &self.cluster;
        let values = self.info(node, &["replicas"])?;
        let replicas = parse_replicas(
            required(&values, "replicas")?,
            cluster.partitions.n_partitions(),
        )?;
        let mut changed = 0;
        for ns in &replicas {
            changed += cluster.partitions.apply_replicas(node, ns)?;
            if let Some(shared) = shared {
                shared.publish_partitions(node.index(), ns)?;
            }
        }
        debug!(
            node = node.name(),
            namespaces = replicas.len(),
            changed,
            "loaded partitions"
        );
        Ok(())
    }

    /// Info request over the node's cached tend connection.
    fn info(
        &self,
        node: &Node,
        names: &[&str],
    ) -> Result<HashMap<String, String>, ClientError> {
        let timeout = self.cluster.config.tend.connect_timeout;
        let mut conn = match node.take_info_conn() {
            Some(conn) => conn,
            None => open(self.cluster.connector.as_ref(), node, timeout)?,
        };
        conn.set_timeout(Some(timeout))?;
        let values = request_info(conn.as_mut(), names)?;
        node.put_info_conn(conn);
        Ok(values)
    }

    fn remove(&self, node: &Arc<Node>, reason: &str) {
        let cluster = &self.cluster;
        info!(node = node.name(), reason, "removing node");
        cluster.partitions.remove_node(node);
        cluster.registry.remove(node.index());
        node.deactivate();
        if let Some(shared) = cluster.shared.as_ref().filter(|s| s.is_master()) {
            shared.deactivate_node(node.index());
        }
    }
}

fn required<'a>(values: &'a HashMap<String, String>, name: &str) -> Result<&'a str, ClientError> {
    values
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| malformed(name))
}

fn malformed(name: &str) -> ClientError {
    ProtocolError::MalformedInfo(format!("missing or invalid '{name}'")).into()
}

/// `host:port;host:port`. Unparseable entries are skipped.
fn parse_services(value: &str) -> Vec<SocketAddr> {
    value
        .split(';')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}

/// `ns:rack;ns:rack`, in server order. Malformed entries are skipped.
fn parse_racks(value: &str) -> Vec<(String, i32)> {
    value
        .split(';')
        .filter_map(|entry| entry.split_once(':'))
        .filter_map(|(ns, rack)| Some((ns.trim().to_string(), rack.trim().parse().ok()?)))
        .collect()
}
