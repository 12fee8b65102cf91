//! Bin values and their particle encoding.
//!
//! Scalars are encoded here. Composite particles (lists, maps, geo) are
//! carried as opaque bytes tagged with their particle type; encoding them
//! is the job of a higher layer.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

pub const PARTICLE_NULL: u8 = 0;
pub const PARTICLE_INTEGER: u8 = 1;
pub const PARTICLE_FLOAT: u8 = 2;
pub const PARTICLE_STRING: u8 = 3;
pub const PARTICLE_BLOB: u8 = 4;

/// A bin value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Int(i64),
    Float(f64),
    String(String),
    Blob(Bytes),
    /// A particle this crate doesn't interpret.
    Raw { particle_type: u8, data: Bytes },
}

impl Value {
    /// The particle type byte written in front of the value.
    pub fn particle_type(&self) -> u8 {
        match self {
            Value::Nil => PARTICLE_NULL,
            Value::Int(_) => PARTICLE_INTEGER,
            Value::Float(_) => PARTICLE_FLOAT,
            Value::String(_) => PARTICLE_STRING,
            Value::Blob(_) => PARTICLE_BLOB,
            Value::Raw { particle_type, .. } => *particle_type,
        }
    }

    /// Number of bytes `encode` appends.
    pub fn encoded_len(&self) -> usize {
        match self {
            Value::Nil => 0,
            Value::Int(_) | Value::Float(_) => 8,
            Value::String(s) => s.len(),
            Value::Blob(b) => b.len(),
            Value::Raw { data, .. } => data.len(),
        }
    }

    /// Appends the particle bytes (without the type) to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Value::Nil => {}
            Value::Int(v) => out.put_i64(*v),
            Value::Float(v) => out.put_u64(v.to_bits()),
            Value::String(s) => out.extend_from_slice(s.as_bytes()),
            Value::Blob(b) => out.extend_from_slice(b),
            Value::Raw { data, .. } => out.extend_from_slice(data),
        }
    }

    /// Decodes particle bytes of the given type.
    pub fn decode(particle_type: u8, data: &[u8]) -> Result<Self, ProtocolError> {
        match particle_type {
            PARTICLE_NULL => Ok(Value::Nil),
            PARTICLE_INTEGER => fixed8(data, "integer").map(|b| Value::Int(i64::from_be_bytes(b))),
            PARTICLE_FLOAT => {
                fixed8(data, "float").map(|b| Value::Float(f64::from_bits(u64::from_be_bytes(b))))
            }
            PARTICLE_STRING => std::str::from_utf8(data)
                .map(|s| Value::String(s.to_string()))
                .map_err(|e| ProtocolError::InvalidParticle(format!("string: {e}"))),
            PARTICLE_BLOB => Ok(Value::Blob(Bytes::copy_from_slice(data))),
            other => Ok(Value::Raw {
                particle_type: other,
                data: Bytes::copy_from_slice(data),
            }),
        }
    }
}

fn fixed8(data: &[u8], what: &str) -> Result<[u8; 8], ProtocolError> {
    data.try_into()
        .map_err(|_| ProtocolError::InvalidParticle(format!("{what} of {} bytes", data.len())))
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(Bytes::from(v))
    }
}
