//! Record messages: message header, fields and operations.
//!
//! Requests and responses share one layout. After the message header come
//! `n_fields` fields (`u32 size`, `u8 type`, data; the size counts the type
//! byte) and `n_ops` operations (`u32 size`, `u8 op`, `u8 particle type`,
//! `u8 version`, `u8 name length`, name, value; the size counts everything
//! after itself). A streamed response packs several such messages into one
//! proto body.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::header::{
    read_u32, MsgHeader, ProtoHeader, ProtoType, MSG_HEADER_SIZE, PROTO_HEADER_SIZE,
};
use crate::value::Value;

pub const FIELD_NAMESPACE: u8 = 0;
pub const FIELD_SET: u8 = 1;
pub const FIELD_KEY: u8 = 2;
pub const FIELD_DIGEST: u8 = 4;
pub const FIELD_SOCKET_TIMEOUT: u8 = 9;
pub const FIELD_PID_ARRAY: u8 = 11;
pub const FIELD_BATCH_INDEX: u8 = 41;
pub const FIELD_BATCH_INDEX_WITH_SET: u8 = 42;

pub const OP_READ: u8 = 1;
pub const OP_WRITE: u8 = 2;
pub const OP_TOUCH: u8 = 11;
pub const OP_DELETE: u8 = 14;

const FIELD_HEADER_SIZE: usize = 5;
const OP_HEADER_SIZE: usize = 8;

/// A message field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub kind: u8,
    pub data: Bytes,
}

impl Field {
    pub fn new(kind: u8, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    fn encoded_len(&self) -> usize {
        FIELD_HEADER_SIZE + self.data.len()
    }
}

/// A bin operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub op: u8,
    pub name: String,
    pub value: Value,
}

impl Op {
    /// Reads one bin, or all bins when `name` is empty.
    pub fn read(name: &str) -> Self {
        Self {
            op: OP_READ,
            name: name.to_string(),
            value: Value::Nil,
        }
    }

    pub fn write(name: &str, value: Value) -> Self {
        Self {
            op: OP_WRITE,
            name: name.to_string(),
            value,
        }
    }

    pub fn touch() -> Self {
        Self {
            op: OP_TOUCH,
            name: String::new(),
            value: Value::Nil,
        }
    }

    fn encoded_len(&self) -> usize {
        OP_HEADER_SIZE + self.name.len() + self.value.encoded_len()
    }
}

/// A record message: header plus fields and operations.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub header: MsgHeader,
    pub fields: Vec<Field>,
    pub ops: Vec<Op>,
}

impl Message {
    /// Size of this message without the proto header.
    pub fn encoded_len(&self) -> usize {
        MSG_HEADER_SIZE
            + self.fields.iter().map(Field::encoded_len).sum::<usize>()
            + self.ops.iter().map(Op::encoded_len).sum::<usize>()
    }

    /// Appends the message, without a proto header, to `out`.
    ///
    /// Field and op counts in the header are taken from the vectors.
    pub fn encode_body(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let n_fields = u16::try_from(self.fields.len()).map_err(|_| too_many("fields"))?;
        let n_ops = u16::try_from(self.ops.len()).map_err(|_| too_many("ops"))?;

        let header = MsgHeader {
            n_fields,
            n_ops,
            ..self.header
        };
        header.write_to(out);

        for field in &self.fields {
            out.put_u32(field.data.len() as u32 + 1);
            out.put_u8(field.kind);
            out.extend_from_slice(&field.data);
        }
        for op in &self.ops {
            let name_len = u8::try_from(op.name.len()).map_err(|_| {
                ProtocolError::InvalidParticle(format!("bin name too long: {}", op.name))
            })?;
            out.put_u32((op.encoded_len() - 4) as u32);
            out.put_u8(op.op);
            out.put_u8(op.value.particle_type());
            out.put_u8(0);
            out.put_u8(name_len);
            out.extend_from_slice(op.name.as_bytes());
            op.value.encode(out);
        }
        Ok(())
    }

    /// Appends a complete wire message: proto header, then the body.
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = self.encoded_len();
        out.reserve(PROTO_HEADER_SIZE + body);
        out.extend_from_slice(&ProtoHeader::new(ProtoType::Message, body as u64).encode()?);
        self.encode_body(out)
    }

    /// Decodes one message from the front of `buf`, returning it and the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let header = MsgHeader::decode(buf)?;
        let mut pos = MSG_HEADER_SIZE;

        let mut fields = Vec::with_capacity(header.n_fields as usize);
        for _ in 0..header.n_fields {
            let size = read_len(buf, pos, "field")?;
            if size == 0 || pos + 4 + size > buf.len() {
                return Err(ProtocolError::Truncated {
                    what: "field",
                    offset: pos,
                });
            }
            let kind = buf[pos + 4];
            let data = Bytes::copy_from_slice(&buf[pos + FIELD_HEADER_SIZE..pos + 4 + size]);
            fields.push(Field { kind, data });
            pos += 4 + size;
        }

        let mut ops = Vec::with_capacity(header.n_ops as usize);
        for _ in 0..header.n_ops {
            let size = read_len(buf, pos, "op")?;
            if size < 4 || pos + 4 + size > buf.len() {
                return Err(ProtocolError::Truncated {
                    what: "op",
                    offset: pos,
                });
            }
            let op = buf[pos + 4];
            let particle_type = buf[pos + 5];
            let name_len = buf[pos + 7] as usize;
            let name_start = pos + OP_HEADER_SIZE;
            let value_start = name_start + name_len;
            let end = pos + 4 + size;
            if value_start > end {
                return Err(ProtocolError::Truncated {
                    what: "bin name",
                    offset: name_start,
                });
            }
            let name = std::str::from_utf8(&buf[name_start..value_start])
                .map_err(|e| ProtocolError::InvalidParticle(format!("bin name: {e}")))?
                .to_string();
            let value = Value::decode(particle_type, &buf[value_start..end])?;
            ops.push(Op { op, name, value });
            pos = end;
        }

        Ok((
            Self {
                header,
                fields,
                ops,
            },
            pos,
        ))
    }

    /// Decodes every message packed into one proto body.
    pub fn decode_all(body: &[u8]) -> Result<Vec<Self>, ProtocolError> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < body.len() {
            let (msg, used) = Self::decode(&body[pos..])?;
            out.push(msg);
            pos += used;
        }
        Ok(out)
    }

    /// Looks up a field by type.
    pub fn field(&self, kind: u8) -> Option<&Field> {
        self.fields.iter().find(|f| f.kind == kind)
    }

    /// Bin name/value pairs carried by the ops.
    pub fn bins(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.ops.iter().map(|op| (op.name.as_str(), &op.value))
    }
}

fn read_len(buf: &[u8], pos: usize, what: &'static str) -> Result<usize, ProtocolError> {
    if pos + 4 > buf.len() {
        return Err(ProtocolError::Truncated { what, offset: pos });
    }
    Ok(read_u32(&buf[pos..]) as usize)
}

fn too_many(what: &str) -> ProtocolError {
    ProtocolError::InvalidParticle(format!("too many {what} for one message"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{INFO1_READ, INFO3_LAST};

    fn sample() -> Message {
        Message {
            header: MsgHeader {
                info1: INFO1_READ,
                generation: 3,
                record_ttl: 60,
                ..Default::default()
            },
            fields: vec![
                Field::new(FIELD_NAMESPACE, Bytes::from_static(b"test")),
                Field::new(FIELD_DIGEST, Bytes::from(vec![1u8; 20])),
            ],
            ops: vec![
                Op::write("a", Value::Int(7)),
                Op::write("name", Value::from("spire")),
            ],
        }
    }

    #[test]
    fn encode_sets_counts_and_size() {
        let msg = sample();
        let mut buf = BytesMut::new();
        msg.encode(&mut buf).unwrap();

        let proto = ProtoHeader::decode(&buf).unwrap();
        assert_eq!(proto.size as usize, buf.len() - PROTO_HEADER_SIZE);

        let header = MsgHeader::decode(&buf[PROTO_HEADER_SIZE..]).unwrap();
        assert_eq!(header.n_fields, 2);
        assert_eq!(header.n_ops, 2);
    }

    #[test]
    fn decode_recovers_fields_and_bins() {
        let msg = sample();
        let mut buf = BytesMut::new();
        msg.encode_body(&mut buf).unwrap();

        let (back, used) = Message::decode(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(back.field(FIELD_NAMESPACE).unwrap().data, &b"test"[..]);
        let bins: Vec<_> = back.bins().collect();
        assert_eq!(bins[0], ("a", &Value::Int(7)));
        assert_eq!(bins[1], ("name", &Value::String("spire".into())));
    }

    #[test]
    fn decode_all_walks_stream() {
        let mut body = BytesMut::new();
        sample().encode_body(&mut body).unwrap();
        sample().encode_body(&mut body).unwrap();
        Message {
            header: MsgHeader {
                info3: INFO3_LAST,
                ..Default::default()
            },
            ..Default::default()
        }
        .encode_body(&mut body)
        .unwrap();

        let msgs = Message::decode_all(&body).unwrap();
        assert_eq!(msgs.len(), 3);
        assert!(!msgs[0].header.is_last());
        assert!(msgs[2].header.is_last());
    }

    #[test]
    fn truncated_field_rejected() {
        let mut buf = BytesMut::new();
        sample().encode_body(&mut buf).unwrap();
        let cut = &buf[..MSG_HEADER_SIZE + 6];
        assert!(matches!(
            Message::decode(cut),
            Err(ProtocolError::Truncated { what: "field", .. })
        ));
    }

    #[test]
    fn op_with_overlong_name_rejected() {
        let mut buf = BytesMut::new();
        Message {
            ops: vec![Op::write("ab", Value::Nil)],
            ..Default::default()
        }
        .encode_body(&mut buf)
        .unwrap();
        // claim a 200-byte name inside a 6-byte op
        buf[MSG_HEADER_SIZE + 7] = 200;
        assert!(Message::decode(&buf).is_err());
    }
}
