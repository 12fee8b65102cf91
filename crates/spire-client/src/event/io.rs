//! Non-blocking connections for the event loops.
//!
//! rustls is driven by hand over the raw socket so a TLS read or write can
//! report that it needs the *other* readiness event. The state machine
//! sees only [`IoStatus`] and never blocks.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use spire_cluster::Node;
use tokio::net::TcpStream;

use crate::error::ClientError;

/// Outcome of one non-blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoStatus {
    Ready(usize),
    WantRead,
    WantWrite,
}

/// The readiness a suspended command waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Read,
    Write,
}

/// Socket operations the command state machine is written against.
pub(crate) trait CommandIo {
    /// True once a non-blocking connect has completed.
    fn connected(&mut self) -> Result<bool, ClientError>;

    /// Advances the TLS handshake. `Ready` when it is complete or there
    /// is no TLS layer.
    fn handshake(&mut self) -> Result<IoStatus, ClientError>;

    fn write(&mut self, buf: &[u8]) -> Result<IoStatus, ClientError>;

    /// Pushes buffered ciphertext to the socket.
    fn flush(&mut self) -> Result<IoStatus, ClientError>;

    /// `Ready(0)` means the peer closed the connection.
    fn read(&mut self, buf: &mut [u8]) -> Result<IoStatus, ClientError>;

    /// Decrypted bytes are buffered and can be read without waiting for
    /// the socket to become readable again.
    fn pending(&mut self) -> bool;

    /// Suspends until the socket is ready for `interest`.
    async fn wait(&self, interest: Interest) -> Result<(), ClientError>;
}

/// Releases a node's async connection slot when the connection goes away.
pub(crate) struct AsyncSlot {
    node: Arc<Node>,
    event_loop: usize,
}

impl AsyncSlot {
    /// Claims a slot, or `None` when the node is at `max` on this loop.
    pub fn claim(node: &Arc<Node>, event_loop: usize, max: usize) -> Option<Self> {
        node.try_open_async(event_loop, max).then(|| Self {
            node: Arc::clone(node),
            event_loop,
        })
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Drop for AsyncSlot {
    fn drop(&mut self) {
        self.node.close_async(self.event_loop);
    }
}

/// An async connection owned by one event loop.
pub(crate) struct AsyncConn {
    tcp: TcpStream,
    tls: Option<Box<rustls::ClientConnection>>,
    slot: AsyncSlot,
}

impl std::fmt::Debug for AsyncConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncConn")
            .field("node", &self.slot.node.name())
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

impl AsyncConn {
    /// Opens a TCP connection. The TLS session, if any, is created but the
    /// handshake is left to the state machine.
    pub async fn connect(
        addr: SocketAddr,
        tls: Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>,
        slot: AsyncSlot,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let tcp = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(tcp) => tcp.map_err(ClientError::connection)?,
            Err(_) => return Err(io::Error::from(io::ErrorKind::TimedOut).into()),
        };
        tcp.set_nodelay(true).map_err(ClientError::connection)?;
        Self::from_stream(tcp, tls, slot)
    }

    pub fn from_stream(
        tcp: TcpStream,
        tls: Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>,
        slot: AsyncSlot,
    ) -> Result<Self, ClientError> {
        let tls = match tls {
            Some((config, name)) => Some(Box::new(
                rustls::ClientConnection::new(config, name)
                    .map_err(|e| ClientError::Tls(e.to_string()))?,
            )),
            None => None,
        };
        Ok(Self { tcp, tls, slot })
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn node(&self) -> &Arc<Node> {
        self.slot.node()
    }

    /// An idle connection is reusable while the peer has sent nothing,
    /// not even a close.
    pub fn is_reusable(&mut self) -> bool {
        let mut probe = [0u8; 1];
        matches!(
            self.tcp.try_read(&mut probe),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock
        )
    }

    pub async fn wait_any(&self, read: bool, write: bool) -> Result<(), ClientError> {
        let interest = match (read, write) {
            (true, true) => tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
            (false, true) => tokio::io::Interest::WRITABLE,
            _ => tokio::io::Interest::READABLE,
        };
        self.tcp
            .ready(interest)
            .await
            .map(|_| ())
            .map_err(ClientError::connection)
    }
}

/// Adapts the tokio socket to rustls' blocking-style traits. Every call
/// is a single non-blocking syscall.
struct TryIo<'a>(&'a TcpStream);

impl Read for TryIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for TryIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

fn tls_error(e: rustls::Error) -> ClientError {
    ClientError::Tls(e.to_string())
}

impl CommandIo for AsyncConn {
    fn connected(&mut self) -> Result<bool, ClientError> {
        if let Some(e) = self.tcp.take_error().map_err(ClientError::connection)? {
            return Err(ClientError::connection(e));
        }
        Ok(self.tcp.peer_addr().is_ok())
    }

    fn handshake(&mut self) -> Result<IoStatus, ClientError> {
        let Some(tls) = self.tls.as_mut() else {
            return Ok(IoStatus::Ready(0));
        };
        loop {
            if tls.wants_write() {
                match tls.write_tls(&mut TryIo(&self.tcp)) {
                    Ok(_) => continue,
                    Err(e) if would_block(&e) => return Ok(IoStatus::WantWrite),
                    Err(e) => return Err(ClientError::connection(e)),
                }
            }
            if !tls.is_handshaking() {
                return Ok(IoStatus::Ready(0));
            }
            match tls.read_tls(&mut TryIo(&self.tcp)) {
                Ok(0) => return Err(ClientError::connection(io::ErrorKind::UnexpectedEof.into())),
                Ok(_) => {
                    tls.process_new_packets().map_err(tls_error)?;
                }
                Err(e) if would_block(&e) => return Ok(IoStatus::WantRead),
                Err(e) => return Err(ClientError::connection(e)),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<IoStatus, ClientError> {
        match self.tls.as_mut() {
            None => match self.tcp.try_write(buf) {
                Ok(n) => Ok(IoStatus::Ready(n)),
                Err(e) if would_block(&e) => Ok(IoStatus::WantWrite),
                Err(e) => Err(ClientError::connection(e)),
            },
            // plaintext is buffered and encrypted; flush moves it out
            Some(tls) => tls
                .writer()
                .write(buf)
                .map(IoStatus::Ready)
                .map_err(ClientError::connection),
        }
    }

    fn flush(&mut self) -> Result<IoStatus, ClientError> {
        let Some(tls) = self.tls.as_mut() else {
            return Ok(IoStatus::Ready(0));
        };
        while tls.wants_write() {
            match tls.write_tls(&mut TryIo(&self.tcp)) {
                Ok(_) => {}
                Err(e) if would_block(&e) => return Ok(IoStatus::WantWrite),
                Err(e) => return Err(ClientError::connection(e)),
            }
        }
        Ok(IoStatus::Ready(0))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<IoStatus, ClientError> {
        let Some(tls) = self.tls.as_mut() else {
            return match self.tcp.try_read(buf) {
                Ok(n) => Ok(IoStatus::Ready(n)),
                Err(e) if would_block(&e) => Ok(IoStatus::WantRead),
                Err(e) => Err(ClientError::connection(e)),
            };
        };
        loop {
            match tls.reader().read(buf) {
                Ok(n) => return Ok(IoStatus::Ready(n)),
                Err(e) if would_block(&e) => {}
                Err(e) => return Err(ClientError::connection(e)),
            }
            match tls.read_tls(&mut TryIo(&self.tcp)) {
                Ok(0) => return Ok(IoStatus::Ready(0)),
                Ok(_) => {
                    tls.process_new_packets().map_err(tls_error)?;
                }
                Err(e) if would_block(&e) => {
                    // a key update may need an answer before more arrives
                    while tls.wants_write() {
                        match tls.write_tls(&mut TryIo(&self.tcp)) {
                            Ok(_) => {}
                            Err(e) if would_block(&e) => return Ok(IoStatus::WantWrite),
                            Err(e) => return Err(ClientError::connection(e)),
                        }
                    }
                    return Ok(IoStatus::WantRead);
                }
                Err(e) => return Err(ClientError::connection(e)),
            }
        }
    }

    fn pending(&mut self) -> bool {
        match self.tls.as_mut() {
            Some(tls) => tls
                .process_new_packets()
                .map(|state| state.plaintext_bytes_to_read() > 0)
                .unwrap_or(false),
            None => false,
        }
    }

    async fn wait(&self, interest: Interest) -> Result<(), ClientError> {
        self.wait_any(interest == Interest::Read, interest == Interest::Write)
            .await
    }
}
