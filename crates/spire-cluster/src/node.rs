//! Cluster nodes as seen by the client.
//!
//! A `Node` is created when the tender discovers a cluster member and lives
//! behind an `Arc`. Partition slots, in-flight commands and the registry
//! each hold a reference, so a node that leaves the cluster is deactivated
//! immediately but only freed once the last command using it finishes.
//! Command threads only touch the atomic health counters and the pool.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::pool::{ConnectionPool, PoolConfig, PooledConnection};

/// Server feature bits advertised through the `features` info value.
pub mod features {
    pub const PARTITION_SCAN: u32 = 1;
    pub const QUERY_SHOW: u32 = 1 << 1;
    pub const BATCH_ANY: u32 = 1 << 2;
    pub const PARTITION_QUERY: u32 = 1 << 3;

    /// Parses the `;`-separated feature list into bits. Unknown names are
    /// ignored.
    pub fn parse(list: &str) -> u32 {
        list.split(';').fold(0, |acc, name| {
            acc | match name.trim() {
                "pscans" => PARTITION_SCAN,
                "query-show" => QUERY_SHOW,
                "batch-any" => BATCH_ANY,
                "pquery" => PARTITION_QUERY,
                _ => 0,
            }
        })
    }
}

/// Rack id of a node whose rack is unknown.
pub const RACK_UNKNOWN: i32 = -1;

/// Partition generation that forces a `replicas` refresh on the next tend.
pub const GENERATION_STALE: u32 = u32::MAX;

/// Identity and addressing of a node, as learned from the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub addresses: Vec<SocketAddr>,
    pub tls_name: Option<String>,
    pub features: u32,
    pub rack_id: i32,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addresses: vec![address],
            tls_name: None,
            features: 0,
            rack_id: RACK_UNKNOWN,
        }
    }
}

/// A cluster member.
pub struct Node {
    name: String,
    /// Slot in the registry arena. Stable for the node's lifetime.
    index: usize,
    addresses: RwLock<Vec<SocketAddr>>,
    tls_name: Option<String>,
    features: AtomicU32,
    rack_id: AtomicI32,
    /// Rack per namespace, when the node reports them.
    racks: RwLock<HashMap<String, i32>>,
    active: AtomicBool,

    partition_generation: AtomicU32,
    /// Consecutive tend cycles in which this node failed to answer.
    failures: AtomicU32,
    /// Command errors in the current error-rate window.
    error_count: AtomicU32,
    /// Consecutive command errors, reset by any success.
    error_streak: AtomicU32,

    pool: ConnectionPool,
    /// Open async connections per event loop.
    async_open: Box<[AtomicUsize]>,
    /// Dedicated connection for tender info requests.
    info_conn: Mutex<Option<Box<dyn PooledConnection>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Creates an active node.
    pub fn new(index: usize, info: NodeInfo, pool: PoolConfig, event_loops: usize) -> Self {
        Self {
            name: info.name,
            index,
            addresses: RwLock::new(info.addresses),
            tls_name: info.tls_name,
            features: AtomicU32::new(info.features),
            rack_id: AtomicI32::new(info.rack_id),
            racks: RwLock::new(HashMap::new()),
            active: AtomicBool::new(true),
            partition_generation: AtomicU32::new(GENERATION_STALE),
            failures: AtomicU32::new(0),
            error_count: AtomicU32::new(0),
            error_streak: AtomicU32::new(0),
            pool: ConnectionPool::new(pool),
            async_open: (0..event_loops).map(|_| AtomicUsize::new(0)).collect(),
            info_conn: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn tls_name(&self) -> Option<&str> {
        self.tls_name.as_deref()
    }

    /// Primary address used for new connections.
    pub fn address(&self) -> Option<SocketAddr> {
        self.addresses.read().first().copied()
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.addresses.read().clone()
    }

    /// Replaces the address list, e.g. after a peers refresh.
    pub fn set_addresses(&self, addresses: Vec<SocketAddr>) {
        if !addresses.is_empty() {
            *self.addresses.write() = addresses;
        }
    }

    /// Current identity, for publishing to shared memory.
    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            name: self.name.clone(),
            addresses: self.addresses(),
            tls_name: self.tls_name.clone(),
            features: self.features(),
            rack_id: self.rack_id(),
        }
    }

    pub fn features(&self) -> u32 {
        self.features.load(Ordering::Relaxed)
    }

    pub fn set_features(&self, bits: u32) {
        self.features.store(bits, Ordering::Relaxed);
    }

    pub fn has_feature(&self, bit: u32) -> bool {
        self.features() & bit != 0
    }

    pub fn rack_id(&self) -> i32 {
        self.rack_id.load(Ordering::Relaxed)
    }

    pub fn set_rack_id(&self, rack: i32) {
        self.rack_id.store(rack, Ordering::Relaxed);
    }

    /// Replaces the per-namespace racks.
    pub fn set_racks(&self, racks: HashMap<String, i32>) {
        *self.racks.write() = racks;
    }

    /// Rack the node belongs to for `namespace`. Without per-namespace
    /// racks the node-wide rack applies to every namespace.
    pub fn rack_in(&self, namespace: &str) -> i32 {
        let racks = self.racks.read();
        if racks.is_empty() {
            return self.rack_id();
        }
        racks.get(namespace).copied().unwrap_or(RACK_UNKNOWN)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Marks the node as gone. Routing skips it from now on; pooled
    /// connections are closed and in-flight commands finish normally.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        self.pool.close();
        *self.info_conn.lock() = None;
    }

    // -- partition refresh --

    pub fn partition_generation(&self) -> u32 {
        self.partition_generation.load(Ordering::Acquire)
    }

    pub fn set_partition_generation(&self, generation: u32) {
        self.partition_generation.store(generation, Ordering::Release);
    }

    /// Forces a `replicas` refresh on the next tend cycle. Called when this
    /// node loses a partition slot to another node, since it may be stale
    /// about other partitions too.
    pub fn force_partition_refresh(&self) {
        self.partition_generation
            .store(GENERATION_STALE, Ordering::Release);
    }

    /// True when the server-reported generation differs from ours.
    pub fn needs_partition_refresh(&self, reported: u32) -> bool {
        self.partition_generation() != reported
    }

    // -- tend failures --

    /// Records a failed tend refresh, returning the consecutive count.
    pub fn record_tend_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_tend_failures(&self) {
        self.failures.store(0, Ordering::Release);
    }

    pub fn tend_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    // -- command health --

    /// Counts a failed command attempt against the error-rate window.
    pub fn record_failure(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.error_streak.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.error_streak.store(0, Ordering::Relaxed);
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn error_streak(&self) -> u32 {
        self.error_streak.load(Ordering::Relaxed)
    }

    /// Starts a new error-rate window. Called by the tender.
    pub fn reset_error_window(&self) {
        self.error_count.store(0, Ordering::Relaxed);
    }

    /// False once the node exceeded `max_error_rate` errors in the current
    /// window, in which case commands skip it without a network round trip.
    /// A limit of zero disables the check.
    pub fn is_usable(&self, max_error_rate: u32) -> bool {
        max_error_rate == 0 || self.error_count() <= max_error_rate
    }

    // -- connections --

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Claims room for one more async connection on `event_loop`.
    /// Returns false at `max`, which callers report as no more connections.
    pub fn try_open_async(&self, event_loop: usize, max: usize) -> bool {
        let Some(counter) = self.async_open.get(event_loop) else {
            return false;
        };
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    /// Releases a slot claimed with `try_open_async`.
    pub fn close_async(&self, event_loop: usize) {
        if let Some(counter) = self.async_open.get(event_loop) {
            let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                n.checked_sub(1)
            });
        }
    }

    pub fn async_open(&self, event_loop: usize) -> usize {
        self.async_open
            .get(event_loop)
            .map_or(0, |c| c.load(Ordering::Acquire))
    }

    /// Takes the tender's info connection, if one is cached.
    pub fn take_info_conn(&self) -> Option<Box<dyn PooledConnection>> {
        self.info_conn.lock().take()
    }

    /// Caches the tender's info connection for the next cycle.
    pub fn put_info_conn(&self, conn: Box<dyn PooledConnection>) {
        if self.is_active() {
            *self.info_conn.lock() = Some(conn);
        }
    }
}
