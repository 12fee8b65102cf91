//! spire-protocol: wire codec for the spire cluster client.
//!
//! Covers message framing (proto and message headers), record fields and
//! operations, the compressed envelope, the info protocol the tender
//! speaks, and the admin authentication exchange. Nothing here performs
//! I/O; transports hand byte slices in and get byte buffers out.
//!
//! # quick start
//!
//! ```
//! use bytes::BytesMut;
//! use spire_protocol::{Message, Op, ProtoHeader, Value, PROTO_HEADER_SIZE};
//!
//! let msg = Message {
//!     ops: vec![Op::write("count", Value::Int(1))],
//!     ..Default::default()
//! };
//! let mut buf = BytesMut::new();
//! msg.encode(&mut buf).unwrap();
//!
//! let header = ProtoHeader::decode(&buf).unwrap();
//! assert_eq!(header.size as usize, buf.len() - PROTO_HEADER_SIZE);
//! ```

pub mod admin;
pub mod batch;
pub mod compress;
mod error;
pub mod header;
pub mod info;
pub mod message;
mod result_code;
pub mod value;

pub use error::ProtocolError;
pub use header::{
    MsgHeader, ProtoHeader, ProtoType, MAX_PROTO_SIZE, MSG_HEADER_SIZE, MSG_TOTAL_HEADER_SIZE,
    PROTO_HEADER_SIZE,
};
pub use message::{Field, Message, Op};
pub use result_code::ResultCode;
pub use value::Value;
