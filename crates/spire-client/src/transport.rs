//! Blocking transports.
//!
//! A [`Connection`] is a TCP stream, optionally wrapped in rustls, that
//! plugs into a node's pool. [`Connector`] is the seam the executor and
//! the tender open connections through; tests swap in scripted ones.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rustls::{ClientConnection, StreamOwned};
use spire_cluster::PooledConnection;
use spire_protocol::{admin, info, ProtoHeader, ProtoType, ResultCode, PROTO_HEADER_SIZE};
use tracing::debug;

use crate::error::ClientError;
use crate::tls;

/// Largest info response accepted. `replicas` for many namespaces is the
/// biggest value the tender asks for.
const MAX_INFO_SIZE: u64 = 16 * 1024 * 1024;

/// Opens authenticated connections to node addresses.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        addr: SocketAddr,
        tls_name: Option<&str>,
        timeout: Duration,
    ) -> Result<Box<dyn PooledConnection>, ClientError>;
}

/// Connects over the network, with TLS and authentication as configured.
pub struct NetConnector {
    tls: Option<Arc<rustls::ClientConfig>>,
    tls_name: Option<String>,
    credentials: Option<(String, Vec<u8>)>,
}

impl std::fmt::Debug for NetConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetConnector")
            .field("tls", &self.tls.is_some())
            .field("auth", &self.credentials.is_some())
            .finish()
    }
}

impl NetConnector {
    pub fn new(
        tls: Option<Arc<rustls::ClientConfig>>,
        tls_name: Option<String>,
        credentials: Option<(String, Vec<u8>)>,
    ) -> Self {
        Self {
            tls,
            tls_name,
            credentials,
        }
    }
}

impl Connector for NetConnector {
    fn connect(
        &self,
        addr: SocketAddr,
        tls_name: Option<&str>,
        timeout: Duration,
    ) -> Result<Box<dyn PooledConnection>, ClientError> {
        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(ClientError::connection)?;
        tcp.set_nodelay(true).map_err(ClientError::connection)?;
        tcp.set_read_timeout(Some(timeout))
            .map_err(ClientError::connection)?;
        tcp.set_write_timeout(Some(timeout))
            .map_err(ClientError::connection)?;

        let mut conn = match &self.tls {
            None => Connection::Plain(tcp),
            Some(config) => {
                let name = tls::server_name(tls_name, self.tls_name.as_deref(), addr)?;
                let tls = ClientConnection::new(Arc::clone(config), name)
                    .map_err(|e| ClientError::Tls(e.to_string()))?;
                let mut stream = StreamOwned::new(tls, tcp);
                while stream.conn.is_handshaking() {
                    stream
                        .conn
                        .complete_io(&mut stream.sock)
                        .map_err(|e| ClientError::Tls(e.to_string()))?;
                }
                Connection::Tls(Box::new(stream))
            }
        };

        if let Some((user, credential)) = &self.credentials {
            authenticate(&mut conn, user, credential)?;
        }
        debug!(%addr, tls = self.tls.is_some(), "opened connection");
        Ok(Box::new(conn))
    }
}

/// A blocking connection to one node.
pub enum Connection {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Connection {
    fn tcp(&self) -> &TcpStream {
        match self {
            Connection::Plain(s) => s,
            Connection::Tls(s) => &s.sock,
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Plain(s) => s.read(buf),
            Connection::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Plain(s) => s.write(buf),
            Connection::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Plain(s) => s.flush(),
            Connection::Tls(s) => s.flush(),
        }
    }
}

impl PooledConnection for Connection {
    fn is_reusable(&mut self) -> bool {
        if let Connection::Tls(s) = self {
            if s.conn.wants_write() {
                return false;
            }
        }
        let tcp = self.tcp();
        if tcp.set_nonblocking(true).is_err() {
            return false;
        }
        let mut probe = [0u8; 1];
        // any readable byte (or EOF) means the stream position is unknown
        let idle = matches!(tcp.peek(&mut probe), Err(e) if e.kind() == io::ErrorKind::WouldBlock);
        tcp.set_nonblocking(false).is_ok() && idle
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        // a zero timeout means "no timeout" to the OS
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        let tcp = self.tcp();
        tcp.set_read_timeout(timeout)?;
        tcp.set_write_timeout(timeout)
    }
}

/// Reads one proto message into `body`, returning its header.
pub fn read_message(
    conn: &mut dyn PooledConnection,
    body: &mut BytesMut,
    limit: u64,
) -> Result<ProtoHeader, ClientError> {
    let mut raw = [0u8; PROTO_HEADER_SIZE];
    conn.read_exact(&mut raw)?;
    let header = ProtoHeader::decode(&raw)?;
    let size = header.check_size(limit)?;
    body.clear();
    body.resize(size, 0);
    conn.read_exact(&mut body[..])?;
    Ok(header)
}

/// Sends AUTHENTICATE and checks the answer.
pub fn authenticate<C: Read + Write + ?Sized>(
    conn: &mut C,
    user: &str,
    credential: &[u8],
) -> Result<(), ClientError> {
    let mut request = BytesMut::new();
    admin::encode_authenticate(user, credential, &mut request)?;
    conn.write_all(&request)?;

    let mut raw = [0u8; PROTO_HEADER_SIZE];
    conn.read_exact(&mut raw)?;
    let header = ProtoHeader::decode(&raw)?;
    if header.kind != ProtoType::Admin {
        return Err(spire_protocol::ProtocolError::UnknownType(header.kind as u8).into());
    }
    let mut body = vec![0u8; header.check_size(MAX_INFO_SIZE)?];
    conn.read_exact(&mut body)?;
    match admin::parse_response(&body)? {
        ResultCode::Ok => Ok(()),
        code => Err(ClientError::Auth(code)),
    }
}

/// Asks a node for info values.
pub fn request_info(
    conn: &mut dyn PooledConnection,
    names: &[&str],
) -> Result<HashMap<String, String>, ClientError> {
    let mut request = BytesMut::new();
    info::encode_request(names, &mut request)?;
    conn.write_all(&request)?;

    let mut body = BytesMut::new();
    let header = read_message(conn, &mut body, MAX_INFO_SIZE)?;
    if header.kind != ProtoType::Info {
        return Err(spire_protocol::ProtocolError::UnknownType(header.kind as u8).into());
    }
    Ok(info::parse_response(&body)?)
}
