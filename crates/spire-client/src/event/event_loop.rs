//! Event loop threads and the async command driver.
//!
//! Each loop is a thread running a single-threaded tokio runtime. Commands
//! reach a loop through its channel and from then on are only touched by
//! that thread, together with the loop's idle connections and pipelines.
//! The retry decisions are the ones the sync executor makes: both go
//! through [`RetryState`], [`Router`](crate::retry::Router) and [`settle_failure`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustls::pki_types::ServerName;
use spire_cluster::Node;
use spire_protocol::ProtocolError;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::completion::{self, CommandHandle};
use super::io::{AsyncConn, AsyncSlot, CommandIo};
use super::pipeline::Pipeline;
use super::state::{Machine, Progress};
use crate::cluster::ClusterInner;
use crate::command::{handle_response, Command, Flow, Request};
use crate::config::PolicyConfig;
use crate::error::ClientError;
use crate::executor::no_address;
use crate::retry::{settle_failure, Decision, RetryState};
use crate::tls;

type LocalTask = Pin<Box<dyn Future<Output = ()>>>;
type Job = Box<dyn FnOnce(Rc<LoopContext>) -> LocalTask + Send>;

struct LoopHandle {
    tx: Option<mpsc::UnboundedSender<Job>>,
    thread: Option<JoinHandle<()>>,
}

/// The cluster's event loops.
pub(crate) struct EventLoops {
    loops: Vec<LoopHandle>,
    next: AtomicUsize,
}

impl EventLoops {
    pub fn start(cluster: &Arc<ClusterInner>) -> Result<Self, ClientError> {
        let count = cluster.config.event_loops.count;
        let mut loops = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            let cluster = Arc::clone(cluster);
            let thread = thread::Builder::new()
                .name(format!("spire-loop-{index}"))
                .spawn(move || run_loop(index, cluster, rx))
                .map_err(ClientError::connection)?;
            loops.push(LoopHandle {
                tx: Some(tx),
                thread: Some(thread),
            });
        }
        Ok(Self {
            loops,
            next: AtomicUsize::new(0),
        })
    }

    /// Hands a command to the next loop, round robin. `finish` turns the
    /// executed command into the caller's result.
    pub fn submit<C, T>(
        &self,
        cmd: C,
        policy: PolicyConfig,
        finish: fn(C) -> Result<T, ClientError>,
    ) -> CommandHandle<T>
    where
        C: Command + 'static,
        T: Send + 'static,
    {
        let (done, handle, cancel) = completion::channel();
        let job: Job = Box::new(move |ctx: Rc<LoopContext>| -> LocalTask {
            Box::pin(async move {
                let mut cmd = cmd;
                let result = tokio::select! {
                    biased;
                    Ok(()) = cancel => Err(ClientError::Aborted),
                    r = ctx.execute(&mut cmd, &policy) => r,
                };
                done.complete(result.and_then(|()| finish(cmd)));
            })
        });

        // a job that can't be delivered is dropped, which aborts it
        if !self.loops.is_empty() {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
            if let Some(tx) = &self.loops[index].tx {
                let _ = tx.send(job);
            }
        }
        handle
    }

    /// Stops every loop. Commands still running complete with
    /// [`ClientError::Aborted`].
    pub fn shutdown(&mut self) {
        for handle in &mut self.loops {
            handle.tx.take();
        }
        for handle in &mut self.loops {
            if let Some(thread) = handle.thread.take() {
                if thread.join().is_err() {
                    error!("event loop thread panicked");
                }
            }
        }
    }
}

impl Drop for EventLoops {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(index: usize, cluster: Arc<ClusterInner>, mut rx: mpsc::UnboundedReceiver<Job>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(event_loop = index, "failed to start event loop runtime: {e}");
            return;
        }
    };
    let local = tokio::task::LocalSet::new();
    let ctx = Rc::new(LoopContext::new(index, cluster));
    local.block_on(&runtime, async move {
        while let Some(job) = rx.recv().await {
            tokio::task::spawn_local(job(Rc::clone(&ctx)));
        }
    });
    debug!(event_loop = index, "event loop stopped");
}

/// State owned by one loop thread.
pub(crate) struct LoopContext {
    index: usize,
    cluster: Arc<ClusterInner>,
    idle: RefCell<HashMap<usize, Vec<AsyncConn>>>,
    pipelines: RefCell<HashMap<usize, (Arc<Node>, Rc<Pipeline>)>>,
}

impl LoopContext {
    pub fn new(index: usize, cluster: Arc<ClusterInner>) -> Self {
        Self {
            index,
            cluster,
            idle: RefCell::new(HashMap::new()),
            pipelines: RefCell::new(HashMap::new()),
        }
    }

    /// Runs one command to completion with retries.
    pub async fn execute(
        &self,
        cmd: &mut dyn Command,
        policy: &PolicyConfig,
    ) -> Result<(), ClientError> {
        let cluster = &self.cluster;
        let router = cluster.router(policy);
        let mut retry = RetryState::new(policy, cmd.is_read(), Instant::now())
            .starting_at(router.start_index(&*cmd));
        let mut request = Request::new(&*cmd, policy.compress_threshold)?;
        let mut previous: Option<Arc<Node>> = None;

        loop {
            retry.begin_attempt(Instant::now())?;

            let (node, result) = match router.select(&*cmd, &retry, previous.as_ref()) {
                Ok(node) => {
                    let result = self.attempt(&node, cmd, &mut request, &mut retry).await;
                    (Some(node), result)
                }
                Err(e) => (None, Err(e)),
            };

            let err = match result {
                Ok(()) => {
                    if let Some(node) = &node {
                        node.record_success();
                    }
                    return Ok(());
                }
                Err(e) => e,
            };
            match settle_failure(node.as_ref(), err, &*cmd, &mut retry) {
                Decision::Retry { sleep } => {
                    if !sleep.is_zero() {
                        tokio::time::sleep(sleep).await;
                    }
                    if node.is_some() {
                        previous = node;
                    }
                }
                Decision::Fail(err) => return Err(err),
            }
        }
    }

    async fn attempt(
        &self,
        node: &Arc<Node>,
        cmd: &mut dyn Command,
        request: &mut Request,
        retry: &mut RetryState,
    ) -> Result<(), ClientError> {
        let now = Instant::now();
        let timeout = retry.socket_timeout(now)?;
        let bytes = Bytes::copy_from_slice(request.for_attempt(retry.ttl_ms(now))?);

        if self.cluster.config.event_loops.pipelining && !cmd.is_streaming() {
            return self.pipelined(node, cmd, bytes, retry, timeout).await;
        }

        let (mut conn, mut machine) = match self.take_idle(node) {
            Some(conn) => (conn, Machine::pooled(bytes)),
            None => {
                let conn = connect_node(&self.cluster, node, self.index, timeout).await?;
                let tls = conn.is_tls();
                (
                    conn,
                    Machine::connecting(bytes, tls, self.cluster.auth.clone()),
                )
            }
        };

        let result = drive(&mut machine, &mut conn, cmd, retry).await;
        if machine.sent() {
            retry.mark_sent();
        }
        match result {
            Ok(()) => {
                self.put_idle(conn);
                Ok(())
            }
            Err(ClientError::Timeout { .. }) => Err(retry.timeout(!machine.header_parsed())),
            Err(e) => {
                if !e.poisons_connection() {
                    self.put_idle(conn);
                }
                Err(e)
            }
        }
    }

    async fn pipelined(
        &self,
        node: &Arc<Node>,
        cmd: &mut dyn Command,
        request: Bytes,
        retry: &mut RetryState,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let pipe = self.pipeline(node)?;
        let ticket = pipe.submit(request)?;
        let reply = tokio::time::timeout(timeout, ticket.reply).await;
        if ticket.sent.get() {
            retry.mark_sent();
        }
        let (header, body) = match reply {
            Ok(Ok(reply)) => reply?,
            Ok(Err(_)) => {
                return Err(ClientError::connection(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "pipeline closed",
                )))
            }
            Err(_) => {
                // the answer may still arrive; the connection can't be trusted
                pipe.abort();
                return Err(retry.timeout(true));
            }
        };
        match handle_response(cmd, header, &body)? {
            Flow::Done => Ok(()),
            Flow::More => Err(ProtocolError::Truncated {
                what: "pipelined response",
                offset: body.len(),
            }
            .into()),
        }
    }

    fn pipeline(&self, node: &Arc<Node>) -> Result<Rc<Pipeline>, ClientError> {
        let mut pipelines = self.pipelines.borrow_mut();
        if let Some((owner, pipe)) = pipelines.get(&node.index()) {
            if Arc::ptr_eq(owner, node) && node.is_active() && !pipe.is_closed() {
                return Ok(Rc::clone(pipe));
            }
        }

        let cluster = Arc::clone(&self.cluster);
        let owner = Arc::clone(node);
        let index = self.index;
        let timeout = cluster.config.tend.connect_timeout;
        let pipe = Rc::new(Pipeline::start(async move {
            let mut conn = connect_node(&cluster, &owner, index, timeout).await?;
            let mut machine = Machine::connecting(Bytes::new(), conn.is_tls(), cluster.auth.clone());
            loop {
                match machine.setup(&mut conn)? {
                    Progress::Ready(()) => return Ok(conn),
                    Progress::Wait(interest) => {
                        tokio::time::timeout(timeout, conn.wait(interest))
                            .await
                            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
                    }
                }
            }
        }));
        pipelines.insert(node.index(), (Arc::clone(node), Rc::clone(&pipe)));
        Ok(pipe)
    }

    /// Pops an idle connection that still belongs to `node` and whose peer
    /// hasn't closed it.
    fn take_idle(&self, node: &Arc<Node>) -> Option<AsyncConn> {
        let mut idle = self.idle.borrow_mut();
        let conns = idle.get_mut(&node.index())?;
        while let Some(mut conn) = conns.pop() {
            if Arc::ptr_eq(conn.node(), node) && node.is_active() && conn.is_reusable() {
                return Some(conn);
            }
        }
        None
    }

    fn put_idle(&self, conn: AsyncConn) {
        if !conn.node().is_active() {
            return;
        }
        let index = conn.node().index();
        self.idle.borrow_mut().entry(index).or_default().push(conn);
    }
}

/// Runs the state machine, suspending on the socket between steps. Each
/// wait is bounded by the command's socket timeout.
async fn drive(
    machine: &mut Machine,
    conn: &mut AsyncConn,
    cmd: &mut dyn Command,
    retry: &RetryState,
) -> Result<(), ClientError> {
    loop {
        match machine.resume(conn, cmd)? {
            Progress::Ready(()) => return Ok(()),
            Progress::Wait(interest) => {
                let limit = retry.socket_timeout(Instant::now())?;
                tokio::time::timeout(limit, conn.wait(interest))
                    .await
                    .map_err(|_| retry.timeout(true))??;
            }
        }
    }
}

/// Opens an async connection to the first reachable address of `node`,
/// within the node's per-loop connection limit.
async fn connect_node(
    cluster: &ClusterInner,
    node: &Arc<Node>,
    event_loop: usize,
    timeout: Duration,
) -> Result<AsyncConn, ClientError> {
    let max = cluster.config.pool.max_async_connections;
    let timeout = timeout.min(cluster.config.tend.connect_timeout);
    let mut last = None;
    for addr in node.addresses() {
        let Some(slot) = AsyncSlot::claim(node, event_loop, max) else {
            return Err(ClientError::NoMoreConnections {
                node: node.name().to_string(),
            });
        };
        let tls = tls_session(cluster, node, addr)?;
        match AsyncConn::connect(addr, tls, slot, timeout).await {
            Ok(conn) => {
                debug!(node = node.name(), %addr, event_loop, "opened async connection");
                return Ok(conn);
            }
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| no_address(node)))
}

fn tls_session(
    cluster: &ClusterInner,
    node: &Node,
    addr: SocketAddr,
) -> Result<Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>, ClientError> {
    let Some(config) = &cluster.tls else {
        return Ok(None);
    };
    let name = tls::server_name(node.tls_name(), cluster.config.tls.name.as_deref(), addr)?;
    Ok(Some((Arc::clone(config), name)))
}
