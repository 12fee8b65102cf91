//! Byte layout of the shared topology segment.
//!
//! ```text
//! +-------------------+  0
//! | SharedHeader      |
//! +-------------------+  NODES_OFFSET
//! | NodeShm x nodes_capacity
//! +-------------------+  partition_tables_offset (8-aligned)
//! | table 0: TableHeader + PartitionShm x n_partitions
//! | table 1: ...
//! +-------------------+  total size
//! ```
//!
//! Every field is an atomic or sits behind a lock, so a zero-filled
//! segment is a valid empty topology. Capacities are fixed when the
//! segment is created; attaching processes must agree on them.

use std::cell::UnsafeCell;
use std::mem::size_of;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8};

use crate::node::NodeInfo;
use crate::partition::MAX_REPLICAS;
use crate::shm::lock::{SpinLock, SwLock};

pub const NAME_SIZE: usize = 32;
pub const HOST_SIZE: usize = 64;
pub const NAMESPACE_SIZE: usize = 32;

/// Segment header.
#[repr(C)]
#[derive(Debug)]
pub struct SharedHeader {
    /// Last heartbeat of the tend master, ms since the unix epoch.
    pub timestamp: AtomicU64,
    pub owner_pid: AtomicU32,
    pub nodes_size: AtomicU32,
    pub nodes_capacity: AtomicU32,
    /// Bumped whenever a node is added, removed or changes.
    pub nodes_gen: AtomicU32,
    pub n_partitions: AtomicU32,
    pub partition_tables_size: AtomicU32,
    pub partition_tables_capacity: AtomicU32,
    pub partition_tables_offset: AtomicU32,
    pub partition_table_byte_size: AtomicU32,
    /// Bumped whenever any partition slot changes.
    pub rebalance_gen: AtomicU32,
    /// Serializes follower takeover attempts.
    pub take_over_lock: SpinLock,
    /// Held (1) by the tend master.
    pub lock: AtomicU8,
    /// Set once the creator finished initializing the header.
    pub ready: AtomicU8,
    _pad: [u8; 6],
}

/// Plain-data part of a shared node record. Copied in and out under the
/// record's lock.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRecord {
    pub name: [u8; NAME_SIZE],
    pub host: [u8; HOST_SIZE],
    pub tls_name: [u8; HOST_SIZE],
    pub port: u16,
    pub active: u8,
    _pad: u8,
    pub features: u32,
    pub rack_id: i32,
}

impl NodeRecord {
    pub fn from_info(info: &NodeInfo, active: bool) -> Self {
        let mut rec = Self {
            name: [0; NAME_SIZE],
            host: [0; HOST_SIZE],
            tls_name: [0; HOST_SIZE],
            port: 0,
            active: u8::from(active),
            _pad: 0,
            features: info.features,
            rack_id: info.rack_id,
        };
        write_str(&mut rec.name, &info.name);
        if let Some(addr) = info.addresses.first() {
            write_str(&mut rec.host, &addr.ip().to_string());
            rec.port = addr.port();
        }
        if let Some(tls) = &info.tls_name {
            write_str(&mut rec.tls_name, tls);
        }
        rec
    }

    /// Converts back to node info. Returns `None` for an unused record.
    pub fn to_info(&self) -> Option<NodeInfo> {
        let name = read_str(&self.name);
        if name.is_empty() {
            return None;
        }
        let ip: IpAddr = read_str(&self.host).parse().ok()?;
        let tls = read_str(&self.tls_name);
        Some(NodeInfo {
            name,
            addresses: vec![SocketAddr::new(ip, self.port)],
            tls_name: (!tls.is_empty()).then_some(tls),
            features: self.features,
            rack_id: self.rack_id,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active != 0
    }
}

/// A node record plus the lock that guards it.
#[repr(C)]
pub struct NodeShm {
    pub lock: SwLock,
    record: UnsafeCell<NodeRecord>,
}

// SAFETY: `record` is only accessed through `read`/`write`, which hold the
// record's SwLock for the duration of the copy.
unsafe impl Sync for NodeShm {}

impl NodeShm {
    pub fn read(&self) -> NodeRecord {
        let _guard = self.lock.read();
        // SAFETY: readers hold the shared lock; writers are excluded.
        unsafe { *self.record.get() }
    }

    pub fn write(&self, record: NodeRecord) {
        let _guard = self.lock.write();
        // SAFETY: the write guard excludes all readers and other writers.
        unsafe { *self.record.get() = record };
    }

    /// Flips only the active flag.
    pub fn set_active(&self, active: bool) {
        let _guard = self.lock.write();
        // SAFETY: as in `write`.
        unsafe { (*self.record.get()).active = u8::from(active) };
    }
}

/// Header of one namespace's partition table.
#[repr(C)]
pub struct TableHeader {
    namespace: UnsafeCell<[u8; NAMESPACE_SIZE]>,
    pub replica_count: AtomicU8,
    _pad: [u8; 7],
}

// SAFETY: `namespace` is written once by the tend master before the table
// is published through a release store of `partition_tables_size`, and
// never written again.
unsafe impl Sync for TableHeader {}

impl TableHeader {
    pub fn namespace(&self) -> String {
        // SAFETY: see the `Sync` impl; readers acquire-load the table count
        // before touching a table.
        read_str(unsafe { &*self.namespace.get() })
    }

    /// Writes the namespace name. Only valid before the table is published.
    pub fn init(&self, namespace: &str) {
        // SAFETY: the table is not yet visible to any reader.
        unsafe { write_str(&mut *self.namespace.get(), namespace) };
    }
}

/// One partition: per-replica node index (1-based, 0 = none) and regime.
#[repr(C)]
#[derive(Debug)]
pub struct PartitionShm {
    pub nodes: [AtomicU32; MAX_REPLICAS],
    pub regimes: [AtomicU32; MAX_REPLICAS],
}

pub const HEADER_SIZE: usize = size_of::<SharedHeader>();
pub const NODES_OFFSET: usize = align8(HEADER_SIZE);

/// Sizes derived from the configured capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub nodes_capacity: u32,
    pub tables_capacity: u32,
    pub n_partitions: u32,
}

impl Layout {
    pub fn tables_offset(&self) -> usize {
        align8(NODES_OFFSET + self.nodes_capacity as usize * size_of::<NodeShm>())
    }

    pub fn table_byte_size(&self) -> usize {
        align8(size_of::<TableHeader>() + self.n_partitions as usize * size_of::<PartitionShm>())
    }

    pub fn total_size(&self) -> usize {
        self.tables_offset() + self.tables_capacity as usize * self.table_byte_size()
    }
}

const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn write_str(dst: &mut [u8], s: &str) {
    dst.fill(0);
    // leave room for a terminating zero
    let n = s.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&s.as_bytes()[..n]);
}

fn read_str(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_8_aligned() {
        assert_eq!(HEADER_SIZE % 8, 0);
        assert_eq!(NODES_OFFSET, HEADER_SIZE);
    }

    #[test]
    fn layout_sizes() {
        let layout = Layout {
            nodes_capacity: 4,
            tables_capacity: 2,
            n_partitions: 16,
        };
        assert_eq!(layout.tables_offset() % 8, 0);
        assert_eq!(layout.table_byte_size() % 8, 0);
        assert_eq!(
            layout.total_size(),
            layout.tables_offset() + 2 * layout.table_byte_size()
        );
    }

    #[test]
    fn node_record_round_trip() {
        let mut info = NodeInfo::new("BB9020011AC4202", "10.0.0.7:3000".parse().unwrap());
        info.tls_name = Some("db.example".into());
        info.features = 5;
        info.rack_id = 3;

        let rec = NodeRecord::from_info(&info, true);
        assert!(rec.is_active());
        assert_eq!(rec.to_info().unwrap(), info);
    }

    #[test]
    fn empty_record_has_no_info() {
        let rec = NodeRecord::from_info(&NodeInfo::new("", "1.2.3.4:1".parse().unwrap()), false);
        assert!(rec.to_info().is_none());
    }

    #[test]
    fn long_names_truncated() {
        let long = "x".repeat(100);
        let rec = NodeRecord::from_info(&NodeInfo::new(&long, "1.2.3.4:1".parse().unwrap()), true);
        assert_eq!(rec.to_info().unwrap().name.len(), NAME_SIZE - 1);
    }
}
