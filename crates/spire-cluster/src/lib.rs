//! spire-cluster: cluster topology for the spire client.
//!
//! Everything a command needs to pick a node lives here:
//!
//! - **Nodes**: identity, health counters and a connection pool per node
//! - **Registry**: the arena of known nodes, indexed stably
//! - **Partition map**: per-namespace replica slots with regime ordering
//! - **Replica bitmaps**: decoding of the `replicas` info value
//! - **Shared memory**: a cross-process mirror of the above with tend-master
//!   election, so many processes on one host can share one tender
//!
//! Nothing here speaks to the network. The client crate drives tending and
//! plugs its transports into the pool through [`PooledConnection`].
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use spire_cluster::{Node, NodeInfo, PartitionMap, PoolConfig, ReplicaPolicy, Route};
//!
//! let node = Arc::new(Node::new(
//!     0,
//!     NodeInfo::new("A", "127.0.0.1:3000".parse().unwrap()),
//!     PoolConfig::default(),
//!     1,
//! ));
//! let map = PartitionMap::new(4096);
//! map.update("test", 17, 0, &node, 1).unwrap();
//!
//! let picked = map.get_node("test", 17, &Route::new(ReplicaPolicy::Master)).unwrap();
//! assert_eq!(picked.name(), "A");
//! ```

pub mod bitmap;
mod error;
pub mod node;
mod partition;
mod pool;
mod registry;
pub mod shm;

pub use bitmap::{format_replicas, parse_replicas, NamespaceReplicas, PartitionBitmap};
pub use error::ClusterError;
pub use node::{features, Node, NodeInfo, GENERATION_STALE, RACK_UNKNOWN};
pub use partition::{
    PartitionMap, PartitionTable, ReplicaPolicy, Route, UpdateOutcome, DEFAULT_PARTITIONS,
    MAX_REPLICAS,
};
pub use pool::{Checkout, ConnectionPool, PoolConfig, PoolError, PooledConnection};
pub use registry::NodeRegistry;
pub use shm::{
    HeapRegion, MirrorOutcome, OsProbe, ProcessProbe, SharedTopology, ShmError, ShmSettings,
    TendRole,
};
