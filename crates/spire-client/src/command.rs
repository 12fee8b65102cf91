//! Record commands and response handling.
//!
//! A [`Command`] knows how to build its request and how to consume the
//! messages that come back. It knows nothing about connections or
//! retries: the sync executor and the async state machine both drive the
//! same command through the same [`handle_response`] path, so a command
//! behaves identically under either execution model.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use spire_cluster::Node;
use spire_protocol::compress::{compress_message, decompress_body};
use spire_protocol::header::{
    set_transaction_ttl, INFO1_COMPRESS_RESPONSE, INFO1_GET_ALL, INFO1_NOBINDATA, INFO1_READ,
    INFO2_CREATE_ONLY, INFO2_DELETE, INFO2_GENERATION, INFO2_WRITE, INFO3_PARTITION_DONE,
};
use spire_protocol::message::{
    FIELD_DIGEST, FIELD_KEY, FIELD_NAMESPACE, FIELD_PID_ARRAY, FIELD_SET, FIELD_SOCKET_TIMEOUT,
};
use spire_protocol::{
    Field, Message, MsgHeader, Op, ProtoHeader, ProtoType, ProtocolError, ResultCode, Value,
    PROTO_HEADER_SIZE,
};

use crate::error::ClientError;
use crate::key::{Key, DIGEST_SIZE};

/// Largest response body accepted, compressed or not.
pub const MAX_RESPONSE_SIZE: u64 = 128 * 1024 * 1024;

/// Whether a command expects more response messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    More,
    Done,
}

/// One request's protocol logic.
pub trait Command: Send {
    fn namespace(&self) -> &str;

    /// Partition used to pick the target node.
    fn partition(&self) -> u32;

    /// Reads may be served by any replica and move to the next one on
    /// every retry.
    fn is_read(&self) -> bool;

    /// Appends the complete request, proto header included.
    fn write_request(&self, buf: &mut BytesMut, compress_response: bool)
        -> Result<(), ClientError>;

    /// Consumes one response message.
    fn on_message(&mut self, msg: Message) -> Result<Flow, ClientError>;

    /// Responses span several proto messages, ended by a last-message flag.
    fn is_streaming(&self) -> bool {
        false
    }

    /// False once a retry would repeat work the caller already observed.
    fn can_retry(&self) -> bool {
        true
    }

    /// Node the command was grouped onto. Such a command skips partition
    /// routing and every attempt goes to this node.
    fn target(&self) -> Option<&Arc<Node>> {
        None
    }
}

/// Dispatches one proto message to the command.
///
/// Compressed bodies are inflated first; the inflated bytes carry their
/// own proto header, which is validated and stripped.
pub fn handle_response(
    cmd: &mut dyn Command,
    header: ProtoHeader,
    body: &[u8],
) -> Result<Flow, ClientError> {
    let inflated;
    let body = match header.kind {
        ProtoType::Message => body,
        ProtoType::Compressed => {
            inflated = decompress_body(body, MAX_RESPONSE_SIZE)?;
            let inner = ProtoHeader::decode(&inflated)?;
            if inner.kind != ProtoType::Message {
                return Err(ProtocolError::UnknownType(inner.kind as u8).into());
            }
            let size = inner.check_size(MAX_RESPONSE_SIZE)?;
            if inflated.len() - PROTO_HEADER_SIZE != size {
                return Err(ProtocolError::Truncated {
                    what: "compressed message",
                    offset: PROTO_HEADER_SIZE,
                }
                .into());
            }
            &inflated[PROTO_HEADER_SIZE..]
        }
        other => return Err(ProtocolError::UnknownType(other as u8).into()),
    };

    let mut pos = 0;
    while pos < body.len() {
        let (msg, used) = Message::decode(&body[pos..])?;
        pos += used;
        if cmd.on_message(msg)? == Flow::Done {
            return Ok(Flow::Done);
        }
    }
    Ok(Flow::More)
}

/// A built request, reused across attempts.
///
/// The uncompressed form is kept so every attempt can rewrite the
/// transaction TTL before compressing.
#[derive(Debug)]
pub struct Request {
    raw: BytesMut,
    wire: BytesMut,
    compress_threshold: usize,
}

impl Request {
    pub fn new(cmd: &dyn Command, compress_threshold: usize) -> Result<Self, ClientError> {
        let mut raw = BytesMut::new();
        cmd.write_request(&mut raw, compress_threshold > 0)?;
        Ok(Self {
            raw,
            wire: BytesMut::new(),
            compress_threshold,
        })
    }

    /// Bytes to send for one attempt, carrying `ttl_ms` as the server-side
    /// deadline.
    pub fn for_attempt(&mut self, ttl_ms: u32) -> Result<&[u8], ClientError> {
        set_transaction_ttl(&mut self.raw, ttl_ms);
        if self.compress_threshold > 0 && self.raw.len() > self.compress_threshold {
            self.wire.clear();
            compress_message(&self.raw, &mut self.wire)?;
            return Ok(&self.wire);
        }
        Ok(&self.raw)
    }
}

// ---------------------------------------------------------------------------
// records
// ---------------------------------------------------------------------------

/// A record as returned by the server.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub bins: HashMap<String, Value>,
    pub generation: u32,
    /// Seconds until expiry, as reported by the server.
    pub ttl: u32,
}

impl Record {
    pub(crate) fn from_message(msg: Message) -> Self {
        Self {
            generation: msg.header.generation,
            ttl: msg.header.record_ttl,
            bins: msg.ops.into_iter().map(|op| (op.name, op.value)).collect(),
        }
    }

    pub fn get(&self, bin: &str) -> Option<&Value> {
        self.bins.get(bin)
    }
}

/// Options for write commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Record TTL in seconds; zero keeps the namespace default.
    pub ttl: u32,
    /// Fail with `GenerationMismatch` unless the record is at this
    /// generation.
    pub expected_generation: Option<u32>,
    /// Fail with `KeyExists` if the record already exists.
    pub create_only: bool,
    /// Store the user key with the record.
    pub send_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operation {
    Get { bins: Vec<String> },
    Exists,
    Put { bins: Vec<(String, Value)>, options: WriteOptions },
    Delete { options: WriteOptions },
    Touch { options: WriteOptions },
}

/// A single-record command, routed by key.
#[derive(Debug)]
pub struct SingleCommand {
    key: Key,
    partition: u32,
    op: Operation,
    found: bool,
    record: Option<Record>,
}

impl SingleCommand {
    pub(crate) fn new(key: Key, n_partitions: u32, op: Operation) -> Self {
        Self {
            partition: key.partition_id(n_partitions),
            key,
            op,
            found: false,
            record: None,
        }
    }

    /// True when the record existed.
    pub fn found(&self) -> bool {
        self.found
    }

    pub fn into_record(self) -> Option<Record> {
        self.record
    }

    fn key_fields(&self, fields: &mut Vec<Field>, send_key: bool) {
        fields.push(Field::new(
            FIELD_NAMESPACE,
            Bytes::copy_from_slice(self.key.namespace.as_bytes()),
        ));
        if !self.key.set.is_empty() {
            fields.push(Field::new(
                FIELD_SET,
                Bytes::copy_from_slice(self.key.set.as_bytes()),
            ));
        }
        if let (true, Some(user_key)) = (send_key, &self.key.user_key) {
            let mut data = BytesMut::with_capacity(1 + user_key.encoded_len());
            data.put_u8(user_key.particle_type());
            user_key.encode(&mut data);
            fields.push(Field::new(FIELD_KEY, data.freeze()));
        }
        fields.push(Field::new(
            FIELD_DIGEST,
            Bytes::copy_from_slice(&self.key.digest),
        ));
    }
}

fn write_header(options: &WriteOptions, info2: u8) -> MsgHeader {
    let mut header = MsgHeader {
        info2: INFO2_WRITE | info2,
        record_ttl: options.ttl,
        ..Default::default()
    };
    if options.create_only {
        header.info2 |= INFO2_CREATE_ONLY;
    }
    if let Some(generation) = options.expected_generation {
        header.info2 |= INFO2_GENERATION;
        header.generation = generation;
    }
    header
}

impl Command for SingleCommand {
    fn namespace(&self) -> &str {
        &self.key.namespace
    }

    fn partition(&self) -> u32 {
        self.partition
    }

    fn is_read(&self) -> bool {
        matches!(self.op, Operation::Get { .. } | Operation::Exists)
    }

    fn write_request(
        &self,
        buf: &mut BytesMut,
        compress_response: bool,
    ) -> Result<(), ClientError> {
        let mut msg = Message::default();
        match &self.op {
            Operation::Get { bins } => {
                msg.header.info1 = INFO1_READ;
                if bins.is_empty() {
                    msg.header.info1 |= INFO1_GET_ALL;
                }
                msg.ops = bins.iter().map(|b| Op::read(b)).collect();
                self.key_fields(&mut msg.fields, false);
            }
            Operation::Exists => {
                msg.header.info1 = INFO1_READ | INFO1_NOBINDATA;
                self.key_fields(&mut msg.fields, false);
            }
            Operation::Put { bins, options } => {
                if bins.is_empty() {
                    return Err(ClientError::InvalidArgument("put without bins".into()));
                }
                msg.header = write_header(options, 0);
                msg.ops = bins
                    .iter()
                    .map(|(name, value)| Op::write(name, value.clone()))
                    .collect();
                self.key_fields(&mut msg.fields, options.send_key);
            }
            Operation::Delete { options } => {
                msg.header = write_header(options, INFO2_DELETE);
                self.key_fields(&mut msg.fields, false);
            }
            Operation::Touch { options } => {
                msg.header = write_header(options, 0);
                msg.ops = vec![Op::touch()];
                self.key_fields(&mut msg.fields, false);
            }
        }
        if compress_response {
            msg.header.info1 |= INFO1_COMPRESS_RESPONSE;
        }
        msg.encode(buf)?;
        Ok(())
    }

    fn on_message(&mut self, msg: Message) -> Result<Flow, ClientError> {
        match ResultCode::from_wire(msg.header.result_code) {
            ResultCode::Ok => {
                self.found = true;
                if let Operation::Get { .. } = self.op {
                    self.record = Some(Record::from_message(msg));
                }
            }
            ResultCode::KeyNotFound
                if matches!(
                    self.op,
                    Operation::Get { .. } | Operation::Exists | Operation::Delete { .. }
                ) =>
            {
                self.found = false;
            }
            code => return Err(ClientError::server(code)),
        }
        Ok(Flow::Done)
    }
}

// ---------------------------------------------------------------------------
// partition scan
// ---------------------------------------------------------------------------

/// A record delivered by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedRecord {
    pub digest: [u8; DIGEST_SIZE],
    pub record: Record,
}

/// Streams every record of one or more partitions from one node.
#[derive(Debug)]
pub struct ScanCommand {
    namespace: String,
    set: Option<String>,
    partitions: Vec<u32>,
    bins: Vec<String>,
    socket_timeout_ms: u32,
    records: Vec<ScannedRecord>,
    partitions_done: usize,
}

impl ScanCommand {
    pub(crate) fn new(
        namespace: &str,
        set: Option<&str>,
        partitions: Vec<u32>,
        bins: Vec<String>,
        socket_timeout_ms: u32,
    ) -> Result<Self, ClientError> {
        if partitions.is_empty() {
            return Err(ClientError::InvalidArgument("scan without partitions".into()));
        }
        if let Some(&p) = partitions.iter().find(|&&p| p > u32::from(u16::MAX)) {
            return Err(ClientError::InvalidArgument(format!(
                "partition {p} out of range"
            )));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            set: set.map(str::to_string),
            partitions,
            bins,
            socket_timeout_ms,
            records: Vec::new(),
            partitions_done: 0,
        })
    }

    pub fn into_records(self) -> Vec<ScannedRecord> {
        self.records
    }

    /// Partitions the server reported as fully scanned.
    pub fn partitions_done(&self) -> usize {
        self.partitions_done
    }
}

impl Command for ScanCommand {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn partition(&self) -> u32 {
        self.partitions[0]
    }

    fn is_read(&self) -> bool {
        true
    }

    fn is_streaming(&self) -> bool {
        true
    }

    fn can_retry(&self) -> bool {
        self.records.is_empty()
    }

    fn write_request(
        &self,
        buf: &mut BytesMut,
        compress_response: bool,
    ) -> Result<(), ClientError> {
        let mut fields = vec![Field::new(
            FIELD_NAMESPACE,
            Bytes::copy_from_slice(self.namespace.as_bytes()),
        )];
        if let Some(set) = &self.set {
            fields.push(Field::new(FIELD_SET, Bytes::copy_from_slice(set.as_bytes())));
        }
        let mut pids = BytesMut::with_capacity(self.partitions.len() * 2);
        for &p in &self.partitions {
            pids.put_u16_le(p as u16);
        }
        fields.push(Field::new(FIELD_PID_ARRAY, pids.freeze()));
        fields.push(Field::new(
            FIELD_SOCKET_TIMEOUT,
            Bytes::copy_from_slice(&self.socket_timeout_ms.to_be_bytes()),
        ));

        let mut header = MsgHeader {
            info1: INFO1_READ,
            ..Default::default()
        };
        if self.bins.is_empty() {
            header.info1 |= INFO1_GET_ALL;
        }
        if compress_response {
            header.info1 |= INFO1_COMPRESS_RESPONSE;
        }
        let msg = Message {
            header,
            fields,
            ops: self.bins.iter().map(|b| Op::read(b)).collect(),
        };
        msg.encode(buf)?;
        Ok(())
    }

    fn on_message(&mut self, msg: Message) -> Result<Flow, ClientError> {
        let code = ResultCode::from_wire(msg.header.result_code);
        let last = msg.header.is_last();
        match code {
            ResultCode::Ok => {}
            // an empty partition ends with not-found
            ResultCode::KeyNotFound if last => return Ok(Flow::Done),
            code => return Err(ClientError::server(code)),
        }
        if last {
            return Ok(Flow::Done);
        }
        if msg.header.info3 & INFO3_PARTITION_DONE != 0 {
            self.partitions_done += 1;
            return Ok(Flow::More);
        }

        let digest = msg
            .field(FIELD_DIGEST)
            .and_then(|f| <[u8; DIGEST_SIZE]>::try_from(&f.data[..]).ok())
            .ok_or(ProtocolError::Truncated {
                what: "scan digest",
                offset: 0,
            })?;
        self.records.push(ScannedRecord {
            digest,
            record: Record::from_message(msg),
        });
        Ok(Flow::More)
    }
}
