//! Partition map and replica selection.
//!
//! Each namespace owns a table of `n_partitions` partitions, created once
//! and never resized. A partition holds up to `MAX_REPLICAS` replica slots
//! (slot 0 is the master). Slots are swapped atomically, so the many
//! command threads reading the map never block the single tender writing
//! it. A multi-slot scan may see slots from different tend generations;
//! that is fine because scans only accept active nodes and re-resolve on
//! the next retry.
//!
//! Every slot carries a regime. An update is applied only when its regime
//! is at least the stored one: equal regimes may still move ownership
//! (rebalance), higher regimes always win, lower ones are stale.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::bitmap::NamespaceReplicas;
use crate::error::ClusterError;
use crate::node::Node;

/// Highest replication factor tracked per partition.
pub const MAX_REPLICAS: usize = 3;

/// Partition count used by every current server version.
pub const DEFAULT_PARTITIONS: u32 = 4096;

/// Which replica a command may be served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaPolicy {
    /// Only the master. No fallback.
    Master,
    /// First active replica starting at the command's replica index.
    #[default]
    Sequence,
    /// Like `Sequence`, but the starting index is spread across commands.
    Any,
    /// A replica on one of the client's racks, if any is active.
    PreferRack,
}

/// Per-lookup routing inputs.
#[derive(Debug, Clone, Copy)]
pub struct Route<'a> {
    pub policy: ReplicaPolicy,
    /// Rotating start index, advanced on retries.
    pub replica_index: usize,
    /// Node the previous attempt used, if it failed.
    pub previous: Option<&'a Arc<Node>>,
    /// Client rack ids in preference order.
    pub racks: &'a [i32],
}

impl<'a> Route<'a> {
    pub fn new(policy: ReplicaPolicy) -> Self {
        Self {
            policy,
            replica_index: 0,
            previous: None,
            racks: &[],
        }
    }
}

/// What an `update` call did.
#[derive(Debug)]
pub enum UpdateOutcome {
    /// The slot already pointed at this node.
    Unchanged,
    /// The slot now points at the new node. Holds the node it replaced.
    Replaced(Option<Arc<Node>>),
    /// The incoming regime was older than the stored one.
    Stale,
}

struct Partition {
    slots: [ArcSwapOption<Node>; MAX_REPLICAS],
    regimes: [AtomicU32; MAX_REPLICAS],
}

impl Partition {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| ArcSwapOption::empty()),
            regimes: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    fn node(&self, slot: usize) -> Option<Arc<Node>> {
        self.slots[slot].load_full()
    }
}

/// Partitions of one namespace.
pub struct PartitionTable {
    namespace: String,
    partitions: Box<[Partition]>,
    replica_count: AtomicUsize,
    strong_consistency: AtomicBool,
}

impl std::fmt::Debug for PartitionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionTable")
            .field("namespace", &self.namespace)
            .field("partitions", &self.partitions.len())
            .field("replica_count", &self.replica_count())
            .finish_non_exhaustive()
    }
}

impl PartitionTable {
    fn new(namespace: &str, n_partitions: u32, replica_count: usize) -> Self {
        Self {
            namespace: namespace.to_string(),
            partitions: (0..n_partitions).map(|_| Partition::new()).collect(),
            replica_count: AtomicUsize::new(replica_count.clamp(1, MAX_REPLICAS)),
            strong_consistency: AtomicBool::new(false),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count.load(Ordering::Acquire)
    }

    pub fn set_replica_count(&self, count: usize) {
        self.replica_count
            .store(count.clamp(1, MAX_REPLICAS), Ordering::Release);
    }

    pub fn is_strong_consistency(&self) -> bool {
        self.strong_consistency.load(Ordering::Relaxed)
    }

    pub fn set_strong_consistency(&self, on: bool) {
        self.strong_consistency.store(on, Ordering::Relaxed);
    }

    /// Node in a slot, active or not.
    pub fn node_at(&self, partition: u32, slot: usize) -> Option<Arc<Node>> {
        self.partitions
            .get(partition as usize)
            .filter(|_| slot < MAX_REPLICAS)
            .and_then(|p| p.node(slot))
    }

    /// Stored regime of a slot.
    pub fn regime_at(&self, partition: u32, slot: usize) -> Option<u32> {
        self.partitions
            .get(partition as usize)
            .filter(|_| slot < MAX_REPLICAS)
            .map(|p| p.regimes[slot].load(Ordering::Acquire))
    }
}

/// All namespaces' partition tables.
pub struct PartitionMap {
    tables: ArcSwap<HashMap<String, Arc<PartitionTable>>>,
    n_partitions: u32,
    write: Mutex<()>,
    /// Round-robin start for `ReplicaPolicy::Any`.
    rotation: AtomicUsize,
}

impl std::fmt::Debug for PartitionMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionMap")
            .field("namespaces", &self.tables.load().len())
            .field("n_partitions", &self.n_partitions)
            .finish()
    }
}

impl Default for PartitionMap {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl PartitionMap {
    pub fn new(n_partitions: u32) -> Self {
        Self {
            tables: ArcSwap::from_pointee(HashMap::new()),
            n_partitions,
            write: Mutex::new(()),
            rotation: AtomicUsize::new(0),
        }
    }

    pub fn n_partitions(&self) -> u32 {
        self.n_partitions
    }

    pub fn table(&self, namespace: &str) -> Option<Arc<PartitionTable>> {
        self.tables.load().get(namespace).cloned()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.tables.load().keys().cloned().collect()
    }

    /// Returns the namespace's table, creating it on first sight.
    pub fn table_or_create(&self, namespace: &str, replica_count: usize) -> Arc<PartitionTable> {
        if let Some(table) = self.table(namespace) {
            return table;
        }
        let _guard = self.write.lock();
        // another writer may have won the race
        if let Some(table) = self.table(namespace) {
            return table;
        }
        let table = Arc::new(PartitionTable::new(
            namespace,
            self.n_partitions,
            replica_count,
        ));
        let mut tables = (**self.tables.load()).clone();
        tables.insert(namespace.to_string(), Arc::clone(&table));
        self.tables.store(Arc::new(tables));
        table
    }

    /// Starting replica index for the next command in `namespace`.
    /// Successive calls walk `0..replica_count` in turn, so commands are
    /// spread evenly over the replicas.
    pub fn next_replica_start(&self, namespace: &str) -> usize {
        let replicas = self.table(namespace).map_or(1, |t| t.replica_count());
        self.rotation.fetch_add(1, Ordering::Relaxed) % replicas
    }

    /// Picks the node a command should use. Never blocks.
    ///
    /// A missing table, an out-of-range partition, or no acceptable replica
    /// all return `NodeNotFound`, which callers retry.
    pub fn get_node(
        &self,
        namespace: &str,
        partition: u32,
        route: &Route<'_>,
    ) -> Result<Arc<Node>, ClusterError> {
        let not_found = || ClusterError::no_node(namespace, partition);
        let table = self.table(namespace).ok_or_else(not_found)?;
        let p = table
            .partitions
            .get(partition as usize)
            .ok_or_else(not_found)?;
        let replicas = table.replica_count();

        let found = match route.policy {
            ReplicaPolicy::Master => p.node(0).filter(|n| n.is_active()),
            ReplicaPolicy::Sequence | ReplicaPolicy::Any => {
                sequence_node(p, replicas, route.replica_index)
            }
            ReplicaPolicy::PreferRack if route.racks.is_empty() => {
                sequence_node(p, replicas, route.replica_index)
            }
            ReplicaPolicy::PreferRack => rack_node(p, replicas, namespace, route),
        };
        found.ok_or_else(not_found)
    }

    /// Points `(namespace, partition, replica)` at `node` if `regime` is
    /// current. A node displaced from the slot is flagged for a partition
    /// refresh.
    pub fn update(
        &self,
        namespace: &str,
        partition: u32,
        replica: usize,
        node: &Arc<Node>,
        regime: u32,
    ) -> Result<UpdateOutcome, ClusterError> {
        if replica >= MAX_REPLICAS {
            return Err(ClusterError::InvalidReplica(replica));
        }
        if partition >= self.n_partitions {
            return Err(ClusterError::InvalidPartition {
                partition,
                n_partitions: self.n_partitions,
            });
        }
        let table = self.table_or_create(namespace, replica + 1);
        if replica >= table.replica_count() {
            table.set_replica_count(replica + 1);
        }
        let p = &table.partitions[partition as usize];

        // the tender is the only writer, so load-then-store is not racy
        let stored = p.regimes[replica].load(Ordering::Acquire);
        if regime < stored {
            return Ok(UpdateOutcome::Stale);
        }
        if regime > stored {
            p.regimes[replica].store(regime, Ordering::Release);
        }

        let current = p.slots[replica].load();
        if let Some(current) = current.as_ref() {
            if Arc::ptr_eq(current, node) {
                return Ok(UpdateOutcome::Unchanged);
            }
        }
        let previous = p.slots[replica].swap(Some(Arc::clone(node)));
        if let Some(prev) = &previous {
            prev.force_partition_refresh();
        }
        Ok(UpdateOutcome::Replaced(previous))
    }

    /// Applies a node's decoded `replicas` bitmaps: every partition the node
    /// owns at replica `r` is pointed at it. Returns how many slots changed.
    pub fn apply_replicas(
        &self,
        node: &Arc<Node>,
        replicas: &NamespaceReplicas,
    ) -> Result<usize, ClusterError> {
        let table = self.table_or_create(&replicas.namespace, replicas.bitmaps.len());
        table.set_replica_count(replicas.bitmaps.len());
        // only strongly consistent namespaces report a regime
        if replicas.regime > 0 {
            table.set_strong_consistency(true);
        }

        let mut changed = 0;
        for (replica, bitmap) in replicas.bitmaps.iter().enumerate().take(MAX_REPLICAS) {
            for partition in bitmap.owned() {
                if let UpdateOutcome::Replaced(_) =
                    self.update(&replicas.namespace, partition, replica, node, replicas.regime)?
                {
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    /// Empties one slot regardless of regime. Used when mirroring shared
    /// memory that no longer names an owner.
    pub fn clear_slot(&self, namespace: &str, partition: u32, replica: usize) {
        if let Some(table) = self.table(namespace) {
            if let Some(p) = table.partitions.get(partition as usize) {
                if replica < MAX_REPLICAS {
                    p.slots[replica].store(None);
                }
            }
        }
    }

    /// Drops every reference to `node`. Called when it leaves the cluster.
    pub fn remove_node(&self, node: &Arc<Node>) -> usize {
        let mut cleared = 0;
        for table in self.tables.load().values() {
            for p in table.partitions.iter() {
                for slot in &p.slots {
                    let held = slot.load();
                    if held.as_ref().is_some_and(|n| Arc::ptr_eq(n, node)) {
                        slot.compare_and_swap(&*held, None);
                        cleared += 1;
                    }
                }
            }
        }
        cleared
    }
}

/// First active node in the circular scan `start, start+1, ..` over
/// `replicas` slots.
fn sequence_node(p: &Partition, replicas: usize, start: usize) -> Option<Arc<Node>> {
    let replicas = replicas.clamp(1, MAX_REPLICAS);
    (0..replicas)
        .map(|i| (start + i) % replicas)
        .filter_map(|slot| p.node(slot))
        .find(|n| n.is_active())
}

/// Rack-aware choice: a replica on one of the client's racks (in rack
/// preference order) that isn't the node that just failed; otherwise any
/// other active replica; otherwise the failed node itself.
fn rack_node(
    p: &Partition,
    replicas: usize,
    namespace: &str,
    route: &Route<'_>,
) -> Option<Arc<Node>> {
    let replicas = replicas.clamp(1, MAX_REPLICAS);
    let is_previous = |n: &Arc<Node>| route.previous.is_some_and(|prev| Arc::ptr_eq(prev, n));

    let mut fallback: Option<Arc<Node>> = None;
    let mut previous: Option<Arc<Node>> = None;

    for &rack in route.racks {
        for i in 0..replicas {
            let slot = (route.replica_index + i) % replicas;
            let Some(node) = p.node(slot) else { continue };
            if !node.is_active() {
                continue;
            }
            if is_previous(&node) {
                previous.get_or_insert(node);
                continue;
            }
            if node.rack_in(namespace) == rack {
                return Some(node);
            }
            fallback.get_or_insert(node);
        }
    }
    fallback.or(previous)
}
