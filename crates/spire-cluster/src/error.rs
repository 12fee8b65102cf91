//! Error types for topology and routing operations.

/// Errors that can occur while routing or updating the partition map.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// No usable replica for the partition. The cluster may be mid-discovery
    /// or mid-rebalance, so callers treat this as retryable.
    #[error("no available node for {namespace}:{partition}")]
    NodeNotFound { namespace: String, partition: u32 },

    /// Partition id outside the namespace's table.
    #[error("partition {partition} out of range (table has {n_partitions})")]
    InvalidPartition { partition: u32, n_partitions: u32 },

    /// Replica index beyond the supported replication factor.
    #[error("replica index {0} exceeds the supported replication factor")]
    InvalidReplica(usize),

    /// A partition bitmap failed to decode or had the wrong length.
    #[error("invalid partition bitmap: {0}")]
    Bitmap(String),

    /// A `replicas` info value didn't parse.
    #[error("malformed replicas response: {0}")]
    MalformedReplicas(String),
}

impl ClusterError {
    /// Returns true when a later attempt may route successfully.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::NodeNotFound { .. })
    }

    /// Creates a `NodeNotFound` error for a partition.
    pub fn no_node(namespace: &str, partition: u32) -> Self {
        ClusterError::NodeNotFound {
            namespace: namespace.to_string(),
            partition,
        }
    }
}
