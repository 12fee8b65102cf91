//! Fixed-size headers that frame every message on the wire.
//!
//! Every message starts with an 8-byte proto header: one version byte,
//! one type byte, and a 48-bit body size, packed big-endian into a u64.
//! Record messages (type 3) follow it with a 22-byte message header that
//! carries flags, the result code, generation, TTLs and field/op counts.
//! All multi-byte integers are big-endian.

use bytes::{BufMut, BytesMut};

use crate::error::ProtocolError;

/// Protocol version carried by info and record messages.
pub const PROTO_VERSION: u8 = 2;

/// Protocol version carried by admin (security) messages.
pub const ADMIN_VERSION: u8 = 0;

/// Size of the proto header that prefixes every message.
pub const PROTO_HEADER_SIZE: usize = 8;

/// Size of the record message header, which follows the proto header.
pub const MSG_HEADER_SIZE: usize = 22;

/// Proto header plus message header.
pub const MSG_TOTAL_HEADER_SIZE: usize = PROTO_HEADER_SIZE + MSG_HEADER_SIZE;

/// Largest body size the 48-bit size field can express.
pub const MAX_PROTO_SIZE: u64 = (1 << 48) - 1;

/// Offset of the transaction TTL within a full request buffer. Retries
/// rewrite it in place with the remaining deadline.
pub const TIMEOUT_OFFSET: usize = PROTO_HEADER_SIZE + 14;

pub const INFO1_READ: u8 = 1;
pub const INFO1_GET_ALL: u8 = 1 << 1;
pub const INFO1_BATCH_INDEX: u8 = 1 << 3;
pub const INFO1_NOBINDATA: u8 = 1 << 5;
pub const INFO1_COMPRESS_RESPONSE: u8 = 1 << 7;

pub const INFO2_WRITE: u8 = 1;
pub const INFO2_DELETE: u8 = 1 << 1;
pub const INFO2_GENERATION: u8 = 1 << 2;
pub const INFO2_CREATE_ONLY: u8 = 1 << 5;
pub const INFO2_RESPOND_ALL_OPS: u8 = 1 << 7;

/// Marks the final message of a multi-message (streaming) response.
pub const INFO3_LAST: u8 = 1;
pub const INFO3_PARTITION_DONE: u8 = 1 << 2;

/// Message type byte of the proto header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtoType {
    Info = 1,
    Admin = 2,
    Message = 3,
    Compressed = 4,
}

impl ProtoType {
    /// Maps a wire byte to a message type.
    pub fn from_u8(b: u8) -> Result<Self, ProtocolError> {
        match b {
            1 => Ok(ProtoType::Info),
            2 => Ok(ProtoType::Admin),
            3 => Ok(ProtoType::Message),
            4 => Ok(ProtoType::Compressed),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// The 8-byte header in front of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoHeader {
    pub version: u8,
    pub kind: ProtoType,
    /// Body size, excluding this header.
    pub size: u64,
}

impl ProtoHeader {
    /// Creates a header for `kind` with the version that type uses.
    pub fn new(kind: ProtoType, size: u64) -> Self {
        let version = match kind {
            ProtoType::Admin => ADMIN_VERSION,
            _ => PROTO_VERSION,
        };
        Self {
            version,
            kind,
            size,
        }
    }

    /// Packs the header into its 8-byte wire form.
    pub fn encode(&self) -> Result<[u8; PROTO_HEADER_SIZE], ProtocolError> {
        if self.size > MAX_PROTO_SIZE {
            return Err(ProtocolError::SizeTooLarge {
                size: self.size,
                limit: MAX_PROTO_SIZE,
            });
        }
        let word = (u64::from(self.version) << 56) | ((self.kind as u64) << 48) | self.size;
        Ok(word.to_be_bytes())
    }

    /// Unpacks a header from the first 8 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < PROTO_HEADER_SIZE {
            return Err(ProtocolError::incomplete(PROTO_HEADER_SIZE, buf.len()));
        }
        let mut raw = [0u8; PROTO_HEADER_SIZE];
        raw.copy_from_slice(&buf[..PROTO_HEADER_SIZE]);
        let word = u64::from_be_bytes(raw);

        let version = (word >> 56) as u8;
        let kind = ProtoType::from_u8((word >> 48) as u8)?;
        let size = word & MAX_PROTO_SIZE;

        let expected = match kind {
            ProtoType::Admin => ADMIN_VERSION,
            _ => PROTO_VERSION,
        };
        if version != expected {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            kind,
            size,
        })
    }

    /// Rejects bodies larger than `limit` before anything is allocated.
    pub fn check_size(&self, limit: u64) -> Result<usize, ProtocolError> {
        if self.size > limit {
            return Err(ProtocolError::SizeTooLarge {
                size: self.size,
                limit,
            });
        }
        usize::try_from(self.size).map_err(|_| ProtocolError::SizeTooLarge {
            size: self.size,
            limit,
        })
    }
}

/// The 22-byte record message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgHeader {
    pub info1: u8,
    pub info2: u8,
    pub info3: u8,
    pub info4: u8,
    pub result_code: u8,
    pub generation: u32,
    pub record_ttl: u32,
    pub transaction_ttl: u32,
    pub n_fields: u16,
    pub n_ops: u16,
}

impl MsgHeader {
    /// Appends the header to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(MSG_HEADER_SIZE as u8);
        buf.put_u8(self.info1);
        buf.put_u8(self.info2);
        buf.put_u8(self.info3);
        buf.put_u8(self.info4);
        buf.put_u8(self.result_code);
        buf.put_u32(self.generation);
        buf.put_u32(self.record_ttl);
        buf.put_u32(self.transaction_ttl);
        buf.put_u16(self.n_fields);
        buf.put_u16(self.n_ops);
    }

    /// Reads a header from the first 22 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < MSG_HEADER_SIZE {
            return Err(ProtocolError::incomplete(MSG_HEADER_SIZE, buf.len()));
        }
        if buf[0] as usize != MSG_HEADER_SIZE {
            return Err(ProtocolError::InvalidHeaderSize(buf[0]));
        }
        Ok(Self {
            info1: buf[1],
            info2: buf[2],
            info3: buf[3],
            info4: buf[4],
            result_code: buf[5],
            generation: read_u32(&buf[6..]),
            record_ttl: read_u32(&buf[10..]),
            transaction_ttl: read_u32(&buf[14..]),
            n_fields: read_u16(&buf[18..]),
            n_ops: read_u16(&buf[20..]),
        })
    }

    /// True when this is the final message of a streamed response.
    pub fn is_last(&self) -> bool {
        self.info3 & INFO3_LAST != 0
    }
}

/// Rewrites the transaction TTL of a fully built request in place.
///
/// Used before every retry so the server sees the time actually left.
pub fn set_transaction_ttl(request: &mut [u8], ttl_ms: u32) {
    if request.len() >= TIMEOUT_OFFSET + 4 {
        request[TIMEOUT_OFFSET..TIMEOUT_OFFSET + 4].copy_from_slice(&ttl_ms.to_be_bytes());
    }
}

// ---------------------------------------------------------------------------
// read helpers
// ---------------------------------------------------------------------------

pub(crate) fn read_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

pub(crate) fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

pub(crate) fn read_u64(buf: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[..8]);
    u64::from_be_bytes(raw)
}
