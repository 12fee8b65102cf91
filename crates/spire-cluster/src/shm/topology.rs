use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use super::layout::{
    Layout, NodeRecord, NodeShm, PartitionShm, SharedHeader, TableHeader, NAMESPACE_SIZE,
    NODES_OFFSET,
};
use super::segment::{HeapRegion, Segment};
use super::{ShmError, ShmSettings};
use crate::bitmap::NamespaceReplicas;
use crate::node::{Node, NodeInfo};
use crate::partition::{PartitionMap, MAX_REPLICAS};
use crate::registry::NodeRegistry;

/// How long an attaching process waits for the creator to finish
/// initializing the header.
const READY_WAIT: Duration = Duration::from_secs(2);

/// Milliseconds since the unix epoch. Heartbeats use wall time since they
/// are compared across processes.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Answers whether a process still exists.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probes with a null signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProbe;

impl ProcessProbe for OsProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // exists, but belongs to another user
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

/// What this process should do in the current tend cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TendRole {
    /// Tend the cluster and publish the result.
    Master,
    /// Copy the master's view into local state.
    Follower,
}

/// What a `mirror_into` call copied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorOutcome {
    pub nodes_copied: bool,
    pub partitions_copied: bool,
}

/// This process's handle on the shared segment.
pub struct SharedTopology {
    segment: Segment,
    layout: Layout,
    pid: u32,
    threshold_ms: u64,
    probe: Box<dyn ProcessProbe>,
    master: AtomicBool,
    seen_nodes_gen: AtomicU32,
    seen_rebalance_gen: AtomicU32,
}

impl std::fmt::Debug for SharedTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTopology")
            .field("segment", &self.segment)
            .field("pid", &self.pid)
            .field("master", &self.is_master())
            .finish_non_exhaustive()
    }
}

impl SharedTopology {
    /// Creates or attaches to the System V segment named by `settings`.
    pub fn open(settings: &ShmSettings) -> Result<Self, ShmError> {
        let size = settings.layout().total_size();
        let segment = Segment::sysv(settings.key, size, settings.remove_on_drop)?;
        Self::attach(segment, settings, std::process::id(), Box::new(OsProbe))
    }

    /// Creates or attaches to a heap region, acting as process `pid`.
    pub fn open_heap(
        region: &Arc<HeapRegion>,
        settings: &ShmSettings,
        pid: u32,
        probe: Box<dyn ProcessProbe>,
    ) -> Result<Self, ShmError> {
        let segment = Segment::heap(region, settings.layout().total_size())?;
        Self::attach(segment, settings, pid, probe)
    }

    fn attach(
        segment: Segment,
        settings: &ShmSettings,
        pid: u32,
        probe: Box<dyn ProcessProbe>,
    ) -> Result<Self, ShmError> {
        let topo = Self {
            segment,
            layout: settings.layout(),
            pid,
            threshold_ms: settings.takeover_threshold.as_millis() as u64,
            probe,
            master: AtomicBool::new(false),
            seen_nodes_gen: AtomicU32::new(u32::MAX),
            seen_rebalance_gen: AtomicU32::new(u32::MAX),
        };

        if topo.segment.created() {
            topo.initialize();
            info!(pid, "created shared topology, acting as tend master");
        } else {
            topo.wait_ready()?;
            topo.validate()?;
            debug!(
                pid,
                owner = topo.owner_pid(),
                "attached to shared topology"
            );
        }
        Ok(topo)
    }

    fn initialize(&self) {
        let h = self.header();
        let layout = &self.layout;
        h.nodes_capacity
            .store(layout.nodes_capacity, Ordering::Relaxed);
        h.partition_tables_capacity
            .store(layout.tables_capacity, Ordering::Relaxed);
        h.n_partitions
            .store(layout.n_partitions, Ordering::Relaxed);
        h.partition_tables_offset
            .store(layout.tables_offset() as u32, Ordering::Relaxed);
        h.partition_table_byte_size
            .store(layout.table_byte_size() as u32, Ordering::Relaxed);
        h.owner_pid.store(self.pid, Ordering::Relaxed);
        h.timestamp.store(now_ms(), Ordering::Relaxed);
        h.lock.store(1, Ordering::Relaxed);
        self.master.store(true, Ordering::Release);
        h.ready.store(1, Ordering::Release);
    }

    fn wait_ready(&self) -> Result<(), ShmError> {
        let deadline = Instant::now() + READY_WAIT;
        while self.header().ready.load(Ordering::Acquire) == 0 {
            if Instant::now() >= deadline {
                return Err(ShmError::NotReady);
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    /// Refuses a segment created with different capacities.
    fn validate(&self) -> Result<(), ShmError> {
        let h = self.header();
        let checks = [
            ("node capacity", &h.nodes_capacity, self.layout.nodes_capacity),
            (
                "namespace capacity",
                &h.partition_tables_capacity,
                self.layout.tables_capacity,
            ),
            ("partition count", &h.n_partitions, self.layout.n_partitions),
            (
                "partition table size",
                &h.partition_table_byte_size,
                self.layout.table_byte_size() as u32,
            ),
        ];
        for (field, stored, expected) in checks {
            let found = stored.load(Ordering::Acquire);
            if found != expected {
                return Err(ShmError::CapacityMismatch {
                    field,
                    expected: u64::from(expected),
                    found: u64::from(found),
                });
            }
        }
        Ok(())
    }

    // -- election --

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_master(&self) -> bool {
        self.master.load(Ordering::Acquire)
    }

    pub fn owner_pid(&self) -> u32 {
        self.header().owner_pid.load(Ordering::Acquire)
    }

    /// Decides this process's role for one tend cycle.
    ///
    /// A master stays master and refreshes its heartbeat. A follower takes
    /// over when the lock was released, or when the heartbeat is at least
    /// the takeover threshold old and the owner process no longer exists.
    /// The stale check is repeated under the takeover spinlock so two
    /// followers can't both win.
    pub fn begin_cycle(&self, now: u64) -> TendRole {
        let h = self.header();

        if self.is_master() {
            if h.owner_pid.load(Ordering::Acquire) == self.pid {
                self.heartbeat(now);
                return TendRole::Master;
            }
            warn!(pid = self.pid, "lost tend mastership");
            self.master.store(false, Ordering::Release);
        }

        if h
            .lock
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.become_master(now);
            info!(pid = self.pid, "acquired released tend master lock");
            return TendRole::Master;
        }

        if !self.is_stale(now) {
            return TendRole::Follower;
        }

        let _guard = h.take_over_lock.lock();
        if !self.is_stale(now) {
            // another follower took over first
            return TendRole::Follower;
        }
        let owner = h.owner_pid.load(Ordering::Acquire);
        if owner != 0 && owner != self.pid && self.probe.is_alive(owner) {
            debug!(owner, "tend master heartbeat stale but process alive");
            return TendRole::Follower;
        }
        h.lock.store(1, Ordering::Release);
        self.become_master(now);
        warn!(
            pid = self.pid,
            previous = owner,
            "took over as tend master from dead process"
        );
        TendRole::Master
    }

    fn is_stale(&self, now: u64) -> bool {
        let ts = self.header().timestamp.load(Ordering::Acquire);
        now.saturating_sub(ts) >= self.threshold_ms
    }

    fn become_master(&self, now: u64) {
        let h = self.header();
        h.timestamp.store(now, Ordering::Release);
        h.owner_pid.store(self.pid, Ordering::Release);
        self.master.store(true, Ordering::Release);
    }

    /// Refreshes the master heartbeat.
    pub fn heartbeat(&self, now: u64) {
        if self.is_master() {
            self.header().timestamp.store(now, Ordering::Release);
        }
    }

    /// Hands mastership to whichever follower asks next.
    pub fn release(&self) {
        if self.master.swap(false, Ordering::AcqRel) {
            let h = self.header();
            h.owner_pid.store(0, Ordering::Release);
            h.lock.store(0, Ordering::Release);
            info!(pid = self.pid, "released tend master lock");
        }
    }

    // -- master writes --

    /// Publishes a live node and returns its shared index, which the
    /// master also uses as the node's registry index. A node already
    /// present by name keeps its index.
    pub fn publish_node(&self, info: &NodeInfo) -> Result<usize, ShmError> {
        let h = self.header();
        let record = NodeRecord::from_info(info, true);
        let size = h.nodes_size.load(Ordering::Acquire) as usize;

        let mut reusable = None;
        for index in 0..size {
            let shm = self.node_shm(index);
            let current = shm.read();
            if current.name == record.name {
                if current != record {
                    shm.write(record);
                    h.nodes_gen.fetch_add(1, Ordering::AcqRel);
                }
                return Ok(index);
            }
            if !current.is_active() && reusable.is_none() {
                reusable = Some(index);
            }
        }

        let index = if size < self.layout.nodes_capacity as usize {
            self.node_shm(size).write(record);
            h.nodes_size.store(size as u32 + 1, Ordering::Release);
            size
        } else if let Some(index) = reusable {
            self.clear_node_partitions(index);
            self.node_shm(index).write(record);
            index
        } else {
            return Err(ShmError::NodesFull {
                capacity: self.layout.nodes_capacity,
            });
        };
        h.nodes_gen.fetch_add(1, Ordering::AcqRel);
        debug!(node = %info.name, index, "published node");
        Ok(index)
    }

    /// Marks a node inactive and drops it from every partition.
    pub fn deactivate_node(&self, index: usize) {
        let h = self.header();
        if index >= h.nodes_size.load(Ordering::Acquire) as usize {
            return;
        }
        let shm = self.node_shm(index);
        if !shm.read().is_active() {
            return;
        }
        shm.set_active(false);
        self.clear_node_partitions(index);
        h.nodes_gen.fetch_add(1, Ordering::AcqRel);
    }

    /// Clears every partition slot that points at `index`.
    pub fn clear_node_partitions(&self, index: usize) -> usize {
        let value = index as u32 + 1;
        let mut cleared = 0;
        for t in 0..self.tables_size() {
            let (_, partitions) = self.table(t);
            for p in partitions {
                for slot in &p.nodes {
                    if slot
                        .compare_exchange(value, 0, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        cleared += 1;
                    }
                }
            }
        }
        if cleared > 0 {
            self.header().rebalance_gen.fetch_add(1, Ordering::AcqRel);
        }
        cleared
    }

    /// Writes a node's decoded ownership bitmaps into the shared tables.
    /// A slot is taken only when the incoming regime is at least the stored
    /// one. Returns how many slots changed owner.
    pub fn publish_partitions(
        &self,
        node_index: usize,
        replicas: &NamespaceReplicas,
    ) -> Result<usize, ShmError> {
        let t = self.table_index_or_create(&replicas.namespace)?;
        let (table, partitions) = self.table(t);
        table.replica_count.store(
            replicas.bitmaps.len().min(MAX_REPLICAS) as u8,
            Ordering::Release,
        );

        let value = node_index as u32 + 1;
        let mut changed = 0;
        for (replica, bitmap) in replicas.bitmaps.iter().enumerate().take(MAX_REPLICAS) {
            for pid in bitmap.owned() {
                let Some(p) = partitions.get(pid as usize) else {
                    continue;
                };
                let stored = p.regimes[replica].load(Ordering::Acquire);
                if replicas.regime < stored {
                    continue;
                }
                if replicas.regime > stored {
                    p.regimes[replica].store(replicas.regime, Ordering::Release);
                }
                if p.nodes[replica].swap(value, Ordering::AcqRel) != value {
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.header().rebalance_gen.fetch_add(1, Ordering::AcqRel);
        }
        Ok(changed)
    }

    fn table_index_or_create(&self, namespace: &str) -> Result<usize, ShmError> {
        if namespace.is_empty() || namespace.len() >= NAMESPACE_SIZE {
            return Err(ShmError::NamespaceTooLong(namespace.to_string()));
        }
        let size = self.tables_size();
        if let Some(t) = (0..size).find(|&t| self.table(t).0.namespace() == namespace) {
            return Ok(t);
        }
        if size >= self.layout.tables_capacity as usize {
            return Err(ShmError::TablesFull {
                capacity: self.layout.tables_capacity,
            });
        }
        self.table(size).0.init(namespace);
        self.header()
            .partition_tables_size
            .store(size as u32 + 1, Ordering::Release);
        Ok(size)
    }

    // -- follower reads --

    /// Copies shared state into this process's registry and partition map.
    /// Nodes are copied when `nodes_gen` moved, partitions when either
    /// generation moved; otherwise nothing is touched.
    pub fn mirror_into(
        &self,
        registry: &NodeRegistry,
        map: &PartitionMap,
        make_node: impl Fn(usize, NodeInfo) -> Node,
    ) -> Result<MirrorOutcome, ShmError> {
        if map.n_partitions() != self.layout.n_partitions {
            return Err(ShmError::CapacityMismatch {
                field: "partition count",
                expected: u64::from(map.n_partitions()),
                found: u64::from(self.layout.n_partitions),
            });
        }
        let h = self.header();
        let mut outcome = MirrorOutcome::default();

        let nodes_gen = h.nodes_gen.load(Ordering::Acquire);
        if nodes_gen != self.seen_nodes_gen.load(Ordering::Relaxed) {
            self.mirror_nodes(registry, map, &make_node);
            self.seen_nodes_gen.store(nodes_gen, Ordering::Relaxed);
            outcome.nodes_copied = true;
        }

        let rebalance_gen = h.rebalance_gen.load(Ordering::Acquire);
        if outcome.nodes_copied || rebalance_gen != self.seen_rebalance_gen.load(Ordering::Relaxed)
        {
            self.mirror_partitions(registry, map)?;
            self.seen_rebalance_gen.store(rebalance_gen, Ordering::Relaxed);
            outcome.partitions_copied = true;
        }
        Ok(outcome)
    }

    fn mirror_nodes(
        &self,
        registry: &NodeRegistry,
        map: &PartitionMap,
        make_node: &impl Fn(usize, NodeInfo) -> Node,
    ) {
        let size = (self.header().nodes_size.load(Ordering::Acquire))
            .min(self.layout.nodes_capacity) as usize;

        for index in 0..size {
            let record = self.node_shm(index).read();
            let Some(info) = record.to_info() else {
                continue;
            };
            match registry.get(index) {
                Some(node) if node.name() == info.name && node.is_active() => {
                    if record.is_active() {
                        node.set_features(info.features);
                        node.set_rack_id(info.rack_id);
                        node.set_addresses(info.addresses);
                    } else {
                        map.remove_node(&node);
                        registry.remove(index);
                        debug!(node = %info.name, "mirrored node removal");
                    }
                }
                Some(stale) => {
                    map.remove_node(&stale);
                    if record.is_active() {
                        debug!(node = %info.name, index, "mirrored node");
                        registry.insert_at(make_node(index, info));
                    } else {
                        registry.remove(index);
                    }
                }
                None if record.is_active() => {
                    debug!(node = %info.name, index, "mirrored node");
                    registry.insert_at(make_node(index, info));
                }
                None => {}
            }
        }
    }

    fn mirror_partitions(
        &self,
        registry: &NodeRegistry,
        map: &PartitionMap,
    ) -> Result<(), ShmError> {
        for t in 0..self.tables_size() {
            let (header, partitions) = self.table(t);
            let namespace = header.namespace();
            let replica_count = header.replica_count.load(Ordering::Acquire).max(1) as usize;
            let table = map.table_or_create(&namespace, replica_count);
            table.set_replica_count(replica_count);

            for (pid, p) in partitions.iter().enumerate() {
                let pid = pid as u32;
                for replica in 0..MAX_REPLICAS {
                    let owner = p.nodes[replica]
                        .load(Ordering::Acquire)
                        .checked_sub(1)
                        .and_then(|i| registry.get(i as usize));
                    match owner {
                        Some(node) => {
                            let regime = p.regimes[replica].load(Ordering::Acquire);
                            map.update(&namespace, pid, replica, &node, regime)?;
                        }
                        None if table.node_at(pid, replica).is_some() => {
                            map.clear_slot(&namespace, pid, replica);
                        }
                        None => {}
                    }
                }
            }
        }
        Ok(())
    }

    // -- layout access --

    fn header(&self) -> &SharedHeader {
        // SAFETY: the header sits at offset zero of every segment and is
        // made entirely of atomics.
        unsafe { self.segment.at(0) }
    }

    fn node_shm(&self, index: usize) -> &NodeShm {
        assert!(index < self.layout.nodes_capacity as usize);
        // SAFETY: bounds checked against the capacity the segment was
        // sized for; NodeShm is a lock plus lock-guarded plain data.
        unsafe { self.segment.at(NODES_OFFSET + index * size_of::<NodeShm>()) }
    }

    fn tables_size(&self) -> usize {
        (self.header().partition_tables_size.load(Ordering::Acquire))
            .min(self.layout.tables_capacity) as usize
    }

    fn table(&self, t: usize) -> (&TableHeader, &[PartitionShm]) {
        assert!(t < self.layout.tables_capacity as usize);
        let offset = self.layout.tables_offset() + t * self.layout.table_byte_size();
        // SAFETY: `t` is within capacity, so the table header and its
        // partitions lie inside the segment. Both are atomics or cells
        // guarded by the publish protocol.
        unsafe {
            (
                self.segment.at(offset),
                self.segment.slice_at(
                    offset + size_of::<TableHeader>(),
                    self.layout.n_partitions as usize,
                ),
            )
        }
    }
}

impl Drop for SharedTopology {
    fn drop(&mut self) {
        self.release();
    }
}
