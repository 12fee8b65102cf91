//! spire-client: a cluster-aware client for spire.
//!
//! The client keeps a live view of the cluster and sends every command
//! straight to the node that owns its key:
//!
//! - **Routing**: keys hash to partitions, partitions map to replicas,
//!   and the replica policy picks one per attempt
//! - **Retries**: one retry policy for both execution models, bounded by
//!   a total deadline, with in-doubt tracking for writes
//! - **Tending**: a background thread refreshes nodes and partition
//!   ownership over the info protocol, optionally shared between processes
//!   through System V shared memory
//! - **Async**: event loop threads run commands as resumable state
//!   machines, with optional pipelining
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use spire_client::{Client, ClientConfig, Key, Value};
//!
//! spire_client::init_tracing();
//!
//! let config = ClientConfig {
//!     seeds: vec!["127.0.0.1:3000".into()],
//!     ..ClientConfig::default()
//! };
//! let client = Client::connect(config)?;
//!
//! let key = Key::new("test", "users", "alice")?;
//! client.put(&key, &[("age", Value::Int(31))])?;
//! let record = client.get(&key, &[])?;
//!
//! // or on an event loop
//! let found = client.exists_async(&key).wait_blocking()?;
//! ```

mod batch;
mod client;
mod cluster;
mod command;
pub mod config;
mod error;
mod event;
mod executor;
mod key;
mod retry;
mod tender;
mod tls;
mod transport;

pub use client::Client;
pub use cluster::Cluster;
pub use command::{Record, ScannedRecord, WriteOptions};
pub use config::{ClientConfig, ConfigError, PolicyConfig};
pub use error::ClientError;
pub use event::CommandHandle;
pub use key::{partition_id, Key, DIGEST_SIZE};
pub use spire_cluster::ReplicaPolicy;
pub use spire_protocol::{ResultCode, Value};

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, defaulting to
/// `spire=info`. Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spire=info".into()),
        )
        .try_init();
}
