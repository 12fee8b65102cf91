//! Error types for client operations.

use std::io;

use spire_cluster::{ClusterError, PoolError, ShmError};
use spire_protocol::{ProtocolError, ResultCode};

use crate::config::ConfigError;

/// Errors returned by commands and by cluster setup.
///
/// Inside the retry loop every attempt produces one of these; only the
/// final, classified error is returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server answered with a non-success result code.
    #[error("server error: {code}")]
    Server { code: ResultCode, in_doubt: bool },

    /// The deadline passed. `client` is true when no response header was
    /// parsed in the failing attempt, false when the server reported the
    /// timeout or timed out mid-response.
    #[error("{} timeout after {iterations} attempt(s)", timeout_side(.client))]
    Timeout {
        client: bool,
        iterations: u32,
        in_doubt: bool,
    },

    /// Connect, read or write failed, or the peer closed the socket.
    #[error("connection error: {source}")]
    Connection { source: io::Error, in_doubt: bool },

    /// TLS setup or handshake failed.
    #[error("tls error: {0}")]
    Tls(String),

    /// Malformed or oversized response. The connection is discarded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Routing failed (no usable replica, bad partition).
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The node's pool is exhausted or closed.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The node's async connection limit for this event loop is reached.
    #[error("no more connections to node {node}")]
    NoMoreConnections { node: String },

    /// The node exceeded its error budget for this tend interval.
    #[error("node {node} exceeded its error rate limit")]
    MaxErrorRate { node: String },

    /// Authentication was rejected.
    #[error("authentication failed: {0}")]
    Auth(ResultCode),

    /// The caller or a cluster shutdown cancelled the command.
    #[error("command aborted")]
    Aborted,

    /// A bad key, namespace or argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Shm(#[from] ShmError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No seed answered during cluster setup.
    #[error("unable to reach any seed node")]
    NoSeeds,

    /// The cluster was closed.
    #[error("cluster closed")]
    Closed,
}

impl ClientError {
    pub fn connection(source: io::Error) -> Self {
        ClientError::Connection {
            source,
            in_doubt: false,
        }
    }

    pub fn server(code: ResultCode) -> Self {
        ClientError::Server {
            code,
            in_doubt: false,
        }
    }

    /// Returns true when another attempt, possibly on another replica,
    /// may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Server { code, .. } => code.is_retryable(),
            ClientError::Cluster(e) => e.is_retryable(),
            ClientError::Timeout { .. }
            | ClientError::Connection { .. }
            | ClientError::Tls(_)
            | ClientError::Pool(_)
            | ClientError::NoMoreConnections { .. }
            | ClientError::MaxErrorRate { .. } => true,
            _ => false,
        }
    }

    /// Errors that say nothing about the record, only about the path to
    /// it. Retries after these move to the next replica.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Connection { .. }
                | ClientError::Tls(_)
                | ClientError::Cluster(_)
                | ClientError::Pool(_)
                | ClientError::NoMoreConnections { .. }
                | ClientError::MaxErrorRate { .. }
        )
    }

    /// True when a write may have been applied even though it failed.
    pub fn in_doubt(&self) -> bool {
        match self {
            ClientError::Server { in_doubt, .. }
            | ClientError::Timeout { in_doubt, .. }
            | ClientError::Connection { in_doubt, .. } => *in_doubt,
            _ => false,
        }
    }

    /// Marks the error in doubt. Only errors that leave the outcome
    /// unknown carry the flag; definite server answers never do.
    pub(crate) fn with_in_doubt(mut self, value: bool) -> Self {
        match &mut self {
            ClientError::Server { code, in_doubt } if code.is_retryable() => *in_doubt = value,
            ClientError::Timeout { in_doubt, .. } | ClientError::Connection { in_doubt, .. } => {
                *in_doubt = value
            }
            _ => {}
        }
        self
    }

    /// The status code this error maps to.
    pub fn result_code(&self) -> ResultCode {
        match self {
            ClientError::Server { code, .. } => *code,
            ClientError::Timeout { .. } => ResultCode::Timeout,
            ClientError::Connection { .. } => ResultCode::ConnectionError,
            ClientError::Tls(_) => ResultCode::TlsError,
            ClientError::Protocol(_) => ResultCode::ClientError,
            ClientError::Cluster(_) => ResultCode::InvalidNode,
            ClientError::Pool(PoolError::Exhausted { .. })
            | ClientError::NoMoreConnections { .. } => ResultCode::NoMoreConnections,
            ClientError::Pool(PoolError::Closed) => ResultCode::InvalidNode,
            ClientError::MaxErrorRate { .. } => ResultCode::MaxErrorRate,
            ClientError::Auth(code) => *code,
            ClientError::Aborted => ResultCode::ClientAbort,
            ClientError::InvalidArgument(_) => ResultCode::ParameterError,
            ClientError::NoSeeds => ResultCode::InvalidNode,
            ClientError::Shm(_) | ClientError::Config(_) | ClientError::Closed => {
                ResultCode::ClientError
            }
        }
    }

    /// True when the connection that produced this error must be closed
    /// rather than pooled: its stream position is no longer known.
    pub(crate) fn poisons_connection(&self) -> bool {
        matches!(
            self,
            ClientError::Connection { .. }
                | ClientError::Timeout { .. }
                | ClientError::Tls(_)
                | ClientError::Protocol(_)
                | ClientError::Aborted
        )
    }
}

fn timeout_side(client: &bool) -> &'static str {
    if *client {
        "client"
    } else {
        "server"
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ClientError::Timeout {
                client: true,
                iterations: 0,
                in_doubt: false,
            },
            _ => ClientError::connection(e),
        }
    }
}
