//! Cross-process topology cache.
//!
//! Several client processes on one host can share a single view of the
//! cluster. One of them, the tend master, talks to the cluster and
//! publishes nodes and partition ownership into shared memory. The rest
//! mirror that into their local registry and partition map each tend
//! interval without contacting the cluster themselves.
//!
//! Mastership is a one-byte lock plus an owner pid and a heartbeat. A
//! follower takes over when the lock is released, or when the heartbeat
//! is older than the takeover threshold and the owning process is gone.

mod layout;
mod lock;
mod segment;
mod topology;

use std::io;
use std::time::Duration;

pub use layout::{Layout, NAMESPACE_SIZE, NAME_SIZE};
pub use segment::{HeapRegion, Segment};
pub use topology::{
    now_ms, MirrorOutcome, OsProbe, ProcessProbe, SharedTopology, TendRole,
};

use crate::error::ClusterError;

/// Errors from creating, attaching to, or writing the shared segment.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("failed to create shared memory segment {key:#x}: {source} {hint}")]
    Create {
        key: i32,
        source: io::Error,
        hint: &'static str,
    },

    #[error("failed to attach shared memory segment {key:#x}: {source}")]
    Attach { key: i32, source: io::Error },

    #[error("shared memory {field} mismatch: configured {expected}, segment has {found}")]
    CapacityMismatch {
        field: &'static str,
        expected: u64,
        found: u64,
    },

    #[error("shared memory segment too small: need {expected} bytes, found {found}")]
    SegmentTooSmall { expected: usize, found: usize },

    #[error("shared memory segment was never initialized by its creator")]
    NotReady,

    #[error("shared memory node table full ({capacity} nodes)")]
    NodesFull { capacity: u32 },

    #[error("shared memory partition tables full ({capacity} namespaces)")]
    TablesFull { capacity: u32 },

    #[error("namespace '{0}' too long for shared memory")]
    NamespaceTooLong(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Shared-memory options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmSettings {
    /// System V key identifying the segment.
    pub key: i32,
    pub max_nodes: u32,
    pub max_namespaces: u32,
    pub n_partitions: u32,
    /// How long the master's heartbeat may stall before a follower
    /// considers taking over.
    pub takeover_threshold: Duration,
    /// Remove the segment when this process detaches. Meant for tests.
    pub remove_on_drop: bool,
}

impl Default for ShmSettings {
    fn default() -> Self {
        Self {
            key: 0xA900_0000_u32 as i32,
            max_nodes: 16,
            max_namespaces: 8,
            n_partitions: crate::partition::DEFAULT_PARTITIONS,
            takeover_threshold: Duration::from_secs(30),
            remove_on_drop: false,
        }
    }
}

impl ShmSettings {
    pub fn layout(&self) -> Layout {
        Layout {
            nodes_capacity: self.max_nodes,
            tables_capacity: self.max_namespaces,
            n_partitions: self.n_partitions,
        }
    }
}
