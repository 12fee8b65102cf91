//! A fake cluster for integration tests.
//!
//! Each [`FakeNode`] listens on an ephemeral port and speaks enough of the
//! wire protocol to be tended and to serve record commands: info requests,
//! authentication, get/put/delete/exists/touch, batch reads and partition
//! scans. All
//! nodes of one [`FakeCluster`] share a record store, as if every write
//! were replicated instantly.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use spire_client::{partition_id, ClientConfig, ResultCode, Value, DIGEST_SIZE};
use spire_cluster::{format_replicas, NamespaceReplicas, PartitionBitmap};
use spire_protocol::batch::decode_rows;
use spire_protocol::compress::{compress_message, decompress_body};
use spire_protocol::header::{
    INFO1_COMPRESS_RESPONSE, INFO1_GET_ALL, INFO1_NOBINDATA, INFO1_READ, INFO2_CREATE_ONLY,
    INFO2_DELETE, INFO2_GENERATION, INFO2_WRITE, INFO3_LAST, INFO3_PARTITION_DONE,
};
use spire_protocol::message::{
    FIELD_BATCH_INDEX, FIELD_BATCH_INDEX_WITH_SET, FIELD_DIGEST, FIELD_PID_ARRAY, OP_TOUCH,
};
use spire_protocol::{
    admin, info, Field, Message, MsgHeader, Op, ProtoHeader, ProtoType, PROTO_HEADER_SIZE,
};

pub const N_PARTITIONS: u32 = 4096;
pub const NAMESPACE: &str = "test";

#[derive(Debug, Clone, Default)]
pub struct Stored {
    pub bins: BTreeMap<String, Value>,
    pub generation: u32,
    pub ttl: u32,
}

pub type Store = Arc<Mutex<HashMap<[u8; DIGEST_SIZE], Stored>>>;

/// How a node misbehaves.
#[derive(Debug, Default)]
pub struct Faults {
    /// Close this many newly accepted connections without reading.
    pub drop_connections: usize,
    /// Answer every record command with this code.
    pub force_code: Option<ResultCode>,
    /// Sleep before answering record commands.
    pub delay: Duration,
}

#[derive(Debug, Default)]
struct NodeState {
    info: HashMap<String, String>,
    faults: Faults,
    credentials: Option<(String, Vec<u8>)>,
    connections: usize,
    requests: usize,
}

/// One fake server node.
pub struct FakeNode {
    pub name: String,
    pub addr: SocketAddr,
    state: Arc<Mutex<NodeState>>,
    store: Store,
    stopped: Arc<AtomicBool>,
}

impl FakeNode {
    pub fn start(name: &str, store: Store) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut state = NodeState::default();
        state.info.insert("node".into(), name.into());
        state.info.insert("partition-generation".into(), "1".into());
        state.info.insert("features".into(), "pscans".into());

        let node = Self {
            name: name.to_string(),
            addr,
            state: Arc::new(Mutex::new(state)),
            store,
            stopped: Arc::new(AtomicBool::new(false)),
        };

        let state = Arc::clone(&node.state);
        let store = Arc::clone(&node.store);
        let stopped = Arc::clone(&node.stopped);
        thread::spawn(move || {
            for stream in listener.incoming() {
                if stopped.load(Ordering::SeqCst) {
                    return;
                }
                let Ok(stream) = stream else { continue };
                {
                    let mut s = state.lock();
                    s.connections += 1;
                    if s.faults.drop_connections > 0 {
                        s.faults.drop_connections -= 1;
                        continue;
                    }
                }
                let state = Arc::clone(&state);
                let store = Arc::clone(&store);
                let stopped = Arc::clone(&stopped);
                thread::spawn(move || serve(stream, &state, &store, &stopped));
            }
        });
        node
    }

    pub fn set_info(&self, name: &str, value: &str) {
        self.state.lock().info.insert(name.into(), value.into());
    }

    pub fn set_faults(&self, faults: Faults) {
        self.state.lock().faults = faults;
    }

    pub fn require_auth(&self, user: &str, credential: &str) {
        self.state.lock().credentials = Some((user.into(), credential.as_bytes().to_vec()));
    }

    /// Connections accepted so far, dropped ones included.
    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    /// Record commands served so far.
    pub fn requests(&self) -> usize {
        self.state.lock().requests
    }

    /// Stops accepting and closes every connection at its next request.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            // wake the accept loop
            let _ = TcpStream::connect(self.addr);
        }
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Nodes splitting the partitions of namespace "test", each the master of
/// its share and replica of the next node's share.
pub struct FakeCluster {
    pub nodes: Vec<FakeNode>,
    pub store: Store,
}

impl FakeCluster {
    pub fn start(count: usize) -> Self {
        let store = Store::default();
        let nodes: Vec<FakeNode> = (0..count)
            .map(|i| FakeNode::start(&format!("N{i}"), Arc::clone(&store)))
            .collect();

        let share = N_PARTITIONS / count as u32;
        let range = |i: usize| {
            let start = share * i as u32;
            let end = if i + 1 == count { N_PARTITIONS } else { start + share };
            start..end
        };
        for (i, node) in nodes.iter().enumerate() {
            let mut bitmaps = vec![PartitionBitmap::from_owned(N_PARTITIONS, range(i))];
            if count > 1 {
                bitmaps.push(PartitionBitmap::from_owned(
                    N_PARTITIONS,
                    range((i + 1) % count),
                ));
            }
            let replicas = format_replicas(&[NamespaceReplicas {
                namespace: NAMESPACE.into(),
                regime: 1,
                bitmaps,
            }]);
            node.set_info("replicas", &replicas);

            let peers: Vec<String> = nodes
                .iter()
                .filter(|n| n.addr != node.addr)
                .map(|n| n.addr.to_string())
                .collect();
            node.set_info("services", &peers.join(";"));
        }
        Self { nodes, store }
    }

    /// Client config seeded with the first node, with short timeouts.
    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig {
            seeds: vec![self.nodes[0].addr.to_string()],
            ..ClientConfig::default()
        };
        config.tend.interval = Duration::from_millis(50);
        config.policy.socket_timeout = Duration::from_millis(200);
        config.policy.total_timeout = Duration::from_millis(500);
        config
    }

    /// The node that masters `digest`'s partition.
    pub fn master_of(&self, digest: &[u8; DIGEST_SIZE]) -> &FakeNode {
        let pid = partition_id(digest, N_PARTITIONS);
        let share = N_PARTITIONS / self.nodes.len() as u32;
        let index = ((pid / share) as usize).min(self.nodes.len() - 1);
        &self.nodes[index]
    }
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn serve(mut stream: TcpStream, state: &Mutex<NodeState>, store: &Store, stopped: &AtomicBool) {
    let _ = stream.set_nodelay(true);
    loop {
        let mut raw = [0u8; PROTO_HEADER_SIZE];
        if stream.read_exact(&mut raw).is_err() || stopped.load(Ordering::SeqCst) {
            return;
        }
        let Ok(header) = ProtoHeader::decode(&raw) else { return };
        let mut body = vec![0u8; header.size as usize];
        if stream.read_exact(&mut body).is_err() {
            return;
        }

        let mut out = BytesMut::new();
        let answered = match header.kind {
            ProtoType::Info => answer_info(&body, state, &mut out),
            ProtoType::Admin => answer_auth(&body, state, &mut out),
            ProtoType::Message => answer_record(&body, state, store, &mut out),
            ProtoType::Compressed => match decompress_body(&body, 1 << 24) {
                Ok(inner) if inner.len() >= PROTO_HEADER_SIZE => {
                    answer_record(&inner[PROTO_HEADER_SIZE..], state, store, &mut out)
                }
                _ => false,
            },
        };
        if !answered || stream.write_all(&out).is_err() {
            return;
        }
    }
}

fn answer_info(body: &[u8], state: &Mutex<NodeState>, out: &mut BytesMut) -> bool {
    let Ok(names) = info::parse_request(body) else {
        return false;
    };
    let state = state.lock();
    let pairs: Vec<(&str, &str)> = names
        .iter()
        .filter_map(|n| state.info.get(n).map(|v| (n.as_str(), v.as_str())))
        .collect();
    info::encode_response(&pairs, out).is_ok()
}

/// Checks the user and credential fields after the 16-byte admin header.
fn answer_auth(body: &[u8], state: &Mutex<NodeState>, out: &mut BytesMut) -> bool {
    let mut fields = HashMap::new();
    let mut pos = admin::ADMIN_HEADER_SIZE;
    while pos + 5 <= body.len() {
        let len = u32::from_be_bytes([body[pos], body[pos + 1], body[pos + 2], body[pos + 3]])
            as usize;
        let end = pos + 4 + len;
        if len == 0 || end > body.len() {
            return false;
        }
        fields.insert(body[pos + 4], body[pos + 5..end].to_vec());
        pos = end;
    }
    let accepted = match &state.lock().credentials {
        Some((user, credential)) => {
            fields.get(&0) == Some(&user.as_bytes().to_vec()) && fields.get(&3) == Some(credential)
        }
        None => true,
    };
    let code = if accepted {
        ResultCode::Ok
    } else {
        ResultCode::InvalidCredential
    };
    admin::encode_response(code.code() as u8, out).is_ok()
}

fn answer_record(body: &[u8], state: &Mutex<NodeState>, store: &Store, out: &mut BytesMut) -> bool {
    let Ok((request, _)) = Message::decode(body) else {
        return false;
    };
    let (delay, forced) = {
        let mut s = state.lock();
        s.requests += 1;
        (s.faults.delay, s.faults.force_code)
    };
    if !delay.is_zero() {
        thread::sleep(delay);
    }

    let replies = match forced {
        Some(code) => vec![reply(code, None)],
        None if request.field(FIELD_PID_ARRAY).is_some() => scan(&request, store),
        None if is_batch(&request) => batch(&request, store),
        None => vec![single(&request, store)],
    };

    let compress = request.header.info1 & INFO1_COMPRESS_RESPONSE != 0;
    for msg in replies {
        let mut plain = BytesMut::new();
        if msg.encode(&mut plain).is_err() {
            return false;
        }
        if compress {
            if compress_message(&plain, out).is_err() {
                return false;
            }
        } else {
            out.extend_from_slice(&plain);
        }
    }
    true
}

fn reply(code: ResultCode, record: Option<&Stored>) -> Message {
    let mut msg = Message {
        header: MsgHeader {
            result_code: code.code() as u8,
            ..Default::default()
        },
        ..Default::default()
    };
    if let Some(record) = record {
        msg.header.generation = record.generation;
        msg.header.record_ttl = record.ttl;
    }
    msg
}

fn single(request: &Message, store: &Store) -> Message {
    let Some(digest) = request
        .field(FIELD_DIGEST)
        .and_then(|f| <[u8; DIGEST_SIZE]>::try_from(&f.data[..]).ok())
    else {
        return reply(ResultCode::ParameterError, None);
    };
    let h = &request.header;
    let mut store = store.lock();

    if h.info2 & INFO2_WRITE != 0 {
        if h.info2 & INFO2_DELETE != 0 {
            return match store.remove(&digest) {
                Some(_) => reply(ResultCode::Ok, None),
                None => reply(ResultCode::KeyNotFound, None),
            };
        }
        let existing = store.get(&digest);
        if h.info2 & INFO2_CREATE_ONLY != 0 && existing.is_some() {
            return reply(ResultCode::KeyExists, None);
        }
        if h.info2 & INFO2_GENERATION != 0
            && existing.map_or(0, |r| r.generation) != h.generation
        {
            return reply(ResultCode::GenerationMismatch, None);
        }
        let touch = request.ops.iter().any(|op| op.op == OP_TOUCH);
        if touch && existing.is_none() {
            return reply(ResultCode::KeyNotFound, None);
        }
        let record = store.entry(digest).or_default();
        record.generation += 1;
        record.ttl = h.record_ttl;
        if !touch {
            for op in &request.ops {
                record.bins.insert(op.name.clone(), op.value.clone());
            }
        }
        return reply(ResultCode::Ok, Some(record));
    }

    if h.info1 & INFO1_READ == 0 {
        return reply(ResultCode::ParameterError, None);
    }
    let Some(record) = store.get(&digest) else {
        return reply(ResultCode::KeyNotFound, None);
    };
    let mut msg = reply(ResultCode::Ok, Some(record));
    if h.info1 & INFO1_NOBINDATA == 0 {
        let all = h.info1 & INFO1_GET_ALL != 0;
        msg.ops = record
            .bins
            .iter()
            .filter(|(name, _)| all || request.ops.iter().any(|op| &op.name == *name))
            .map(|(name, value)| Op::write(name, value.clone()))
            .collect();
    }
    msg
}

/// One message per record, a partition-done marker per partition, then
/// the last-message marker.
fn scan(request: &Message, store: &Store) -> Vec<Message> {
    let partitions: Vec<u32> = request
        .field(FIELD_PID_ARRAY)
        .map(|f| {
            f.data
                .chunks_exact(2)
                .map(|c| u32::from(u16::from_le_bytes([c[0], c[1]])))
                .collect()
        })
        .unwrap_or_default();
    let store = store.lock();
    let mut out = Vec::new();
    for &pid in &partitions {
        for (digest, record) in store.iter() {
            if partition_id(digest, N_PARTITIONS) != pid {
                continue;
            }
            let mut msg = reply(ResultCode::Ok, Some(record));
            msg.fields = vec![Field::new(FIELD_DIGEST, digest.to_vec())];
            msg.ops = record
                .bins
                .iter()
                .map(|(name, value)| Op::write(name, value.clone()))
                .collect();
            out.push(msg);
        }
        let mut done = reply(ResultCode::Ok, None);
        done.header.info3 = INFO3_PARTITION_DONE;
        out.push(done);
    }
    let mut last = reply(ResultCode::Ok, None);
    last.header.info3 = INFO3_LAST;
    out.push(last);
    out
}

fn is_batch(request: &Message) -> bool {
    request.field(FIELD_BATCH_INDEX).is_some()
        || request.field(FIELD_BATCH_INDEX_WITH_SET).is_some()
}

/// One message per row, echoing the row's index and digest, then the
/// last-message marker.
fn batch(request: &Message, store: &Store) -> Vec<Message> {
    let Some(Ok(rows)) = request
        .field(FIELD_BATCH_INDEX)
        .or_else(|| request.field(FIELD_BATCH_INDEX_WITH_SET))
        .map(decode_rows)
    else {
        return vec![reply(ResultCode::ParameterError, None)];
    };
    let store = store.lock();
    let mut out = Vec::with_capacity(rows.len() + 1);
    for row in rows {
        let mut msg = match store.get(&row.digest) {
            Some(record) => {
                let mut msg = reply(ResultCode::Ok, Some(record));
                msg.ops = record
                    .bins
                    .iter()
                    .filter(|(name, _)| row.bins.is_empty() || row.bins.contains(*name))
                    .map(|(name, value)| Op::write(name, value.clone()))
                    .collect();
                msg
            }
            None => reply(ResultCode::KeyNotFound, None),
        };
        msg.header.transaction_ttl = row.index;
        msg.fields = vec![Field::new(FIELD_DIGEST, row.digest.to_vec())];
        out.push(msg);
    }
    let mut last = reply(ResultCode::Ok, None);
    last.header.info3 = INFO3_LAST;
    out.push(last);
    out
}
