//! Cluster handle: topology state plus the threads that keep it current.
//!
//! [`ClusterInner`] is everything commands read (config, registry,
//! partition map, transports). [`Cluster`] owns it together with the
//! tender thread and the event loops, which themselves hold references to
//! the inner state, and tears them down in order on close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use spire_cluster::{
    Node, NodeInfo, NodeRegistry, PartitionMap, SharedTopology, DEFAULT_PARTITIONS,
};
use spire_protocol::admin;
use tracing::{error, info, warn};

use crate::batch::{group_by_node, BatchCommand};
use crate::command::Command;
use crate::config::{AttachFailure, ClientConfig, PolicyConfig};
use crate::error::ClientError;
use crate::event::{CommandHandle, EventLoops};
use crate::executor::Executor;
use crate::key::Key;
use crate::retry::Router;
use crate::tender::{Shutdown, Tender};
use crate::tls;
use crate::transport::{Connector, NetConnector};

/// State shared by the executor, the tender and the event loops.
pub(crate) struct ClusterInner {
    pub config: ClientConfig,
    pub registry: NodeRegistry,
    pub partitions: PartitionMap,
    pub connector: Arc<dyn Connector>,
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Pre-encoded AUTHENTICATE request for new async connections.
    pub auth: Option<Bytes>,
    pub shared: Option<SharedTopology>,
}

impl ClusterInner {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        tls: Option<Arc<rustls::ClientConfig>>,
        shared: Option<SharedTopology>,
    ) -> Result<Self, ClientError> {
        let auth = match config.auth.credentials() {
            Some((user, credential)) => {
                let mut buf = BytesMut::new();
                admin::encode_authenticate(user, credential, &mut buf)?;
                Some(buf.freeze())
            }
            None => None,
        };
        Ok(Self {
            config,
            registry: NodeRegistry::new(),
            partitions: PartitionMap::new(DEFAULT_PARTITIONS),
            connector,
            tls,
            auth,
            shared,
        })
    }

    pub fn make_node(&self, index: usize, info: NodeInfo) -> Node {
        Node::new(
            index,
            info,
            self.config.pool.pool_config(),
            self.config.event_loops.count.max(1),
        )
    }

    pub fn n_partitions(&self) -> u32 {
        self.partitions.n_partitions()
    }

    pub fn router(&self, policy: &PolicyConfig) -> Router<'_> {
        Router {
            map: &self.partitions,
            policy: policy.replica,
            racks: &self.config.racks,
            max_error_rate: self.config.tend.max_error_rate,
        }
    }

    /// Runs a command on the calling thread.
    pub fn execute(&self, cmd: &mut dyn Command, policy: &PolicyConfig) -> Result<(), ClientError> {
        let executor = Executor {
            router: self.router(policy),
            connector: self.connector.as_ref(),
            policy,
            connect_timeout: self.config.tend.connect_timeout,
        };
        executor.execute(cmd)
    }
}

/// A connected cluster.
///
/// Dropping it closes it; [`Cluster::close`] does the same explicitly.
pub struct Cluster {
    inner: Arc<ClusterInner>,
    shutdown: Arc<Shutdown>,
    tender: Mutex<Option<JoinHandle<()>>>,
    loops: Mutex<EventLoops>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("nodes", &self.inner.registry.active_count())
            .field("shared", &self.is_shared())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Cluster {
    /// Validates `config`, discovers the cluster from its seeds and starts
    /// tending.
    ///
    /// Fails when no seed answers, unless this process follows a shared
    /// memory tend master, which may not have published anything yet.
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let tls = tls::client_config(&config.tls)?;
        let credentials = config
            .auth
            .credentials()
            .map(|(user, cred)| (user.to_string(), cred.to_vec()));
        let connector = Arc::new(NetConnector::new(
            tls.clone(),
            config.tls.name.clone(),
            credentials,
        ));
        let shared = open_shared(&config)?;
        Self::start(config, connector, tls, shared)
    }

    pub(crate) fn start(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        tls: Option<Arc<rustls::ClientConfig>>,
        shared: Option<SharedTopology>,
    ) -> Result<Self, ClientError> {
        let inner = Arc::new(ClusterInner::new(config, connector, tls, shared)?);

        let mut tender = Tender::new(Arc::clone(&inner));
        tender.run_cycle();
        let follower = inner.shared.as_ref().is_some_and(|s| !s.is_master());
        if inner.registry.active_count() == 0 && !follower {
            if let Some(shared) = &inner.shared {
                shared.release();
            }
            return Err(ClientError::NoSeeds);
        }

        let shutdown = Arc::new(Shutdown::default());
        let handle = tender
            .spawn(Arc::clone(&shutdown))
            .map_err(ClientError::connection)?;
        let loops = match EventLoops::start(&inner) {
            Ok(loops) => loops,
            Err(e) => {
                shutdown.trigger();
                let _ = handle.join();
                return Err(e);
            }
        };

        info!(
            nodes = inner.registry.active_count(),
            shared = inner.shared.is_some(),
            "cluster connected"
        );
        Ok(Self {
            inner,
            shutdown,
            tender: Mutex::new(Some(handle)),
            loops: Mutex::new(loops),
            closed: AtomicBool::new(false),
        })
    }

    /// True when topology comes from (or is published to) shared memory.
    /// False when shared memory is off or attaching failed with
    /// `on_attach_failure = "local"`.
    pub fn is_shared(&self) -> bool {
        self.inner.shared.is_some()
    }

    /// True while this process tends on behalf of the shared segment.
    pub fn is_tend_master(&self) -> bool {
        self.inner.shared.as_ref().is_some_and(|s| s.is_master())
    }

    /// Names of the active nodes.
    pub fn node_names(&self) -> Vec<String> {
        self.inner
            .registry
            .nodes()
            .iter()
            .filter(|n| n.is_active())
            .map(|n| n.name().to_string())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops tending, aborts in-flight async commands, hands shared-memory
    /// mastership to the next follower and closes every connection.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.trigger();
        if let Some(handle) = self.tender.lock().take() {
            if handle.join().is_err() {
                error!("tender thread panicked");
            }
        }
        self.loops.lock().shutdown();
        if let Some(shared) = &self.inner.shared {
            shared.release();
        }
        for node in self.inner.registry.nodes() {
            self.inner.partitions.remove_node(&node);
        }
        self.inner.registry.clear();
        info!("cluster closed");
    }

    pub(crate) fn execute(
        &self,
        cmd: &mut dyn Command,
        policy: &PolicyConfig,
    ) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        self.inner.execute(cmd, policy)
    }

    /// Groups a batch of keys into one command per serving node.
    pub(crate) fn batch(
        &self,
        keys: &[Key],
        bins: &[String],
        policy: &PolicyConfig,
    ) -> Result<Vec<BatchCommand>, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        group_by_node(keys, bins, &self.inner.router(policy), self.inner.n_partitions())
    }

    /// Queues a command on an event loop. After close, or without event
    /// loops, the handle resolves to [`ClientError::Aborted`].
    pub(crate) fn submit<C, T>(
        &self,
        cmd: C,
        policy: PolicyConfig,
        finish: fn(C) -> Result<T, ClientError>,
    ) -> CommandHandle<T>
    where
        C: Command + 'static,
        T: Send + 'static,
    {
        self.loops.lock().submit(cmd, policy, finish)
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub(crate) fn n_partitions(&self) -> u32 {
        self.inner.n_partitions()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_shared(config: &ClientConfig) -> Result<Option<SharedTopology>, ClientError> {
    if !config.shm.enabled {
        return Ok(None);
    }
    match SharedTopology::open(&config.shm.settings()) {
        Ok(shared) => Ok(Some(shared)),
        Err(e) => match config.shm.on_attach_failure {
            AttachFailure::Error => Err(e.into()),
            AttachFailure::Local => {
                warn!("shared memory unavailable, tending locally: {e}");
                Ok(None)
            }
        },
    }
}
