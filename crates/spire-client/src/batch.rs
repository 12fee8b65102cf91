//! Batch reads.
//!
//! The keys of one batch are grouped by the node that serves them and
//! each node gets a single streaming request listing its keys. Every
//! per-node command is bound to that node and runs through the normal
//! executor, so it gets the same deadline, retry budget and error-rate
//! accounting as a single-record command. Answers name the key they
//! belong to by its position in the batch, which is how results land back
//! in key order.

use std::sync::Arc;

use bytes::BytesMut;
use spire_cluster::Node;
use spire_protocol::batch::{encode_rows, BatchRow};
use spire_protocol::header::{INFO1_BATCH_INDEX, INFO1_COMPRESS_RESPONSE, INFO1_READ};
use spire_protocol::message::FIELD_DIGEST;
use spire_protocol::{Message, MsgHeader, ProtocolError, ResultCode};

use crate::command::{Command, Flow, Record};
use crate::error::ClientError;
use crate::key::Key;
use crate::retry::Router;

/// The keys of one batch that a single node serves.
#[derive(Debug)]
pub struct BatchCommand {
    node: Arc<Node>,
    partition: u32,
    /// Sorted by index.
    rows: Vec<BatchRow>,
    records: Vec<Option<Record>>,
}

impl BatchCommand {
    fn new(node: Arc<Node>, partition: u32) -> Self {
        Self {
            node,
            partition,
            rows: Vec::new(),
            records: Vec::new(),
        }
    }

    fn push(&mut self, row: BatchRow) {
        self.rows.push(row);
        self.records.push(None);
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Batch positions with their records, `None` where the record
    /// doesn't exist.
    pub fn into_results(self) -> impl Iterator<Item = (usize, Option<Record>)> {
        self.rows
            .into_iter()
            .map(|row| row.index as usize)
            .zip(self.records)
    }
}

/// Splits `keys` into one command per serving node, keeping key order
/// within each command.
pub(crate) fn group_by_node(
    keys: &[Key],
    bins: &[String],
    router: &Router<'_>,
    n_partitions: u32,
) -> Result<Vec<BatchCommand>, ClientError> {
    if u32::try_from(keys.len()).is_err() {
        return Err(ClientError::InvalidArgument(format!(
            "batch of {} keys is too large",
            keys.len()
        )));
    }

    let mut groups: Vec<BatchCommand> = Vec::new();
    for (index, key) in keys.iter().enumerate() {
        let partition = key.partition_id(n_partitions);
        let node = router.locate(&key.namespace, partition, 0, None)?;
        let row = BatchRow {
            index: index as u32,
            digest: key.digest,
            namespace: key.namespace.clone(),
            set: key.set.clone(),
            bins: bins.to_vec(),
        };
        match groups.iter_mut().find(|g| Arc::ptr_eq(&g.node, &node)) {
            Some(group) => group.push(row),
            None => {
                let mut group = BatchCommand::new(node, partition);
                group.push(row);
                groups.push(group);
            }
        }
    }
    Ok(groups)
}

impl Command for BatchCommand {
    fn namespace(&self) -> &str {
        self.rows.first().map_or("", |r| r.namespace.as_str())
    }

    fn partition(&self) -> u32 {
        self.partition
    }

    fn is_read(&self) -> bool {
        true
    }

    fn is_streaming(&self) -> bool {
        true
    }

    fn target(&self) -> Option<&Arc<Node>> {
        Some(&self.node)
    }

    fn write_request(
        &self,
        buf: &mut BytesMut,
        compress_response: bool,
    ) -> Result<(), ClientError> {
        if self.rows.is_empty() {
            return Err(ClientError::InvalidArgument("batch without keys".into()));
        }
        let mut header = MsgHeader {
            info1: INFO1_READ | INFO1_BATCH_INDEX,
            ..Default::default()
        };
        if compress_response {
            header.info1 |= INFO1_COMPRESS_RESPONSE;
        }
        let msg = Message {
            header,
            fields: vec![encode_rows(&self.rows)?],
            ops: Vec::new(),
        };
        msg.encode(buf)?;
        Ok(())
    }

    fn on_message(&mut self, msg: Message) -> Result<Flow, ClientError> {
        let code = ResultCode::from_wire(msg.header.result_code);
        if msg.header.is_last() {
            return match code {
                ResultCode::Ok | ResultCode::KeyNotFound => Ok(Flow::Done),
                code => Err(ClientError::server(code)),
            };
        }
        let found = match code {
            ResultCode::Ok => true,
            ResultCode::KeyNotFound => false,
            code => return Err(ClientError::server(code)),
        };

        // the row's batch position comes back in the transaction ttl slot
        let index = msg.header.transaction_ttl;
        let slot = self
            .rows
            .binary_search_by_key(&index, |r| r.index)
            .map_err(|_| ProtocolError::UnexpectedBatchRow(index))?;
        if let Some(digest) = msg.field(FIELD_DIGEST) {
            if digest.data[..] != self.rows[slot].digest[..] {
                return Err(ProtocolError::UnexpectedBatchRow(index).into());
            }
        }
        self.records[slot] = found.then(|| Record::from_message(msg));
        Ok(Flow::More)
    }
}
