//! Synchronous command execution.
//!
//! Runs one command to completion on the calling thread: pick a node,
//! borrow a connection, send, read until the command is satisfied, and on
//! failure let [`RetryState`] decide whether to go again. Only the final,
//! classified error reaches the caller.

use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use spire_cluster::{Checkout, Node, PooledConnection};
use spire_protocol::{ProtoHeader, PROTO_HEADER_SIZE};

use crate::command::{handle_response, Command, Flow, Request, MAX_RESPONSE_SIZE};
use crate::config::PolicyConfig;
use crate::error::ClientError;
use crate::retry::{settle_failure, Decision, RetryState, Router};
use crate::transport::Connector;

pub(crate) struct Executor<'a> {
    pub router: Router<'a>,
    pub connector: &'a dyn Connector,
    pub policy: &'a PolicyConfig,
    pub connect_timeout: Duration,
}

impl Executor<'_> {
    pub fn execute(&self, cmd: &mut dyn Command) -> Result<(), ClientError> {
        let mut retry = RetryState::new(self.policy, cmd.is_read(), Instant::now())
            .starting_at(self.router.start_index(&*cmd));
        let mut request = Request::new(&*cmd, self.policy.compress_threshold)?;
        let mut previous: Option<Arc<Node>> = None;

        loop {
            retry.begin_attempt(Instant::now())?;

            let (node, result) = match self.router.select(&*cmd, &retry, previous.as_ref()) {
                Ok(node) => {
                    let result = self.attempt(&node, cmd, &mut request, &mut retry);
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
                        thread::sleep(sleep);
                    }
                    if node.is_some() {
                        previous = node;
                    }
                }
                Decision::Fail(err) => return Err(err),
            }
        }
    }

    fn attempt(
        &self,
        node: &Arc<Node>,
        cmd: &mut dyn Command,
        request: &mut Request,
        retry: &mut RetryState,
    ) -> Result<(), ClientError> {
        let now = Instant::now();
        let timeout = retry.socket_timeout(now)?;
        let mut conn = self.checkout(node, now + timeout, timeout)?;

        let result = exchange(conn.as_mut(), cmd, request, retry);
        let healthy = match &result {
            Ok(()) => true,
            Err(e) => !e.poisons_connection(),
        };
        node.pool().checkin(conn, healthy);
        result
    }

    fn checkout(
        &self,
        node: &Node,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Box<dyn PooledConnection>, ClientError> {
        match node.pool().checkout(Some(deadline))? {
            Checkout::Pooled(conn) => Ok(conn),
            Checkout::Reserved => {
                let opened = open(self.connector, node, timeout.min(self.connect_timeout));
                if opened.is_err() {
                    node.pool().cancel_reservation();
                }
                opened
            }
        }
    }
}

/// Connects to the first reachable address of `node`.
pub(crate) fn open(
    connector: &dyn Connector,
    node: &Node,
    timeout: Duration,
) -> Result<Box<dyn PooledConnection>, ClientError> {
    let mut last = None;
    for addr in node.addresses() {
        match connector.connect(addr, node.tls_name(), timeout) {
            Ok(conn) => return Ok(conn),
            Err(e @ ClientError::Auth(_)) => return Err(e),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| no_address(node)))
}

pub(crate) fn no_address(node: &Node) -> ClientError {
    ClientError::connection(io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("node {} has no address", node.name()),
    ))
}

/// One request/response exchange on a borrowed connection.
fn exchange(
    conn: &mut dyn PooledConnection,
    cmd: &mut dyn Command,
    request: &mut Request,
    retry: &mut RetryState,
) -> Result<(), ClientError> {
    conn.set_timeout(Some(retry.socket_timeout(Instant::now())?))?;
    let ttl = retry.ttl_ms(Instant::now());
    conn.write_all(request.for_attempt(ttl)?)?;
    conn.flush()?;
    retry.mark_sent();

    let mut header_parsed = false;
    let mut body = BytesMut::new();
    loop {
        conn.set_timeout(Some(retry.socket_timeout(Instant::now())?))?;
        let result = read_response(conn, &mut body, &mut header_parsed);
        let header = match result {
            Ok(header) => header,
            Err(ClientError::Timeout { .. }) => return Err(retry.timeout(!header_parsed)),
            Err(e) => return Err(e),
        };
        if handle_response(cmd, header, &body)? == Flow::Done {
            return Ok(());
        }
    }
}

fn read_response(
    conn: &mut dyn PooledConnection,
    body: &mut BytesMut,
    header_parsed: &mut bool,
) -> Result<ProtoHeader, ClientError> {
    let mut raw = [0u8; PROTO_HEADER_SIZE];
    conn.read_exact(&mut raw)?;
    let header = ProtoHeader::decode(&raw)?;
    *header_parsed = true;
    let size = header.check_size(MAX_RESPONSE_SIZE)?;
    body.clear();
    body.resize(size, 0);
    conn.read_exact(&mut body[..])?;
    Ok(header)
}
