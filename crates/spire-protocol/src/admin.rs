//! Admin (security) messages.
//!
//! Only the authentication exchange is needed by the client core: every
//! new connection to a secured cluster sends AUTHENTICATE with the user
//! name and credential before carrying any other traffic.

use bytes::{BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::header::{ProtoHeader, ProtoType, PROTO_HEADER_SIZE};
use crate::result_code::ResultCode;

/// Size of the admin header that follows the proto header.
pub const ADMIN_HEADER_SIZE: usize = 16;

/// Proto header plus admin header. A response of this size carries the
/// result code.
pub const ADMIN_TOTAL_HEADER_SIZE: usize = PROTO_HEADER_SIZE + ADMIN_HEADER_SIZE;

const AUTHENTICATE: u8 = 0;

const FIELD_USER: u8 = 0;
const FIELD_CREDENTIAL: u8 = 3;

// position of the result code inside the admin header
const RESULT_OFFSET: usize = 1;

/// Builds an AUTHENTICATE request.
pub fn encode_authenticate(
    user: &str,
    credential: &[u8],
    out: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let body = ADMIN_HEADER_SIZE + field_len(user.len()) + field_len(credential.len());
    out.reserve(PROTO_HEADER_SIZE + body);
    out.extend_from_slice(&ProtoHeader::new(ProtoType::Admin, body as u64).encode()?);

    let mut header = [0u8; ADMIN_HEADER_SIZE];
    header[2] = AUTHENTICATE;
    header[3] = 2;
    out.extend_from_slice(&header);

    write_field(out, FIELD_USER, user.as_bytes());
    write_field(out, FIELD_CREDENTIAL, credential);
    Ok(())
}

/// Extracts the result code from an admin response body (the bytes after
/// the proto header).
pub fn parse_response(body: &[u8]) -> Result<ResultCode, ProtocolError> {
    if body.len() < ADMIN_HEADER_SIZE {
        return Err(ProtocolError::incomplete(ADMIN_HEADER_SIZE, body.len()));
    }
    Ok(ResultCode::from_wire(body[RESULT_OFFSET]))
}

/// Builds the response a server sends back. Used by test servers.
pub fn encode_response(code: u8, out: &mut BytesMut) -> Result<(), ProtocolError> {
    out.extend_from_slice(&ProtoHeader::new(ProtoType::Admin, ADMIN_HEADER_SIZE as u64).encode()?);
    let mut header = [0u8; ADMIN_HEADER_SIZE];
    header[RESULT_OFFSET] = code;
    out.extend_from_slice(&header);
    Ok(())
}

fn field_len(data_len: usize) -> usize {
    4 + 1 + data_len
}

fn write_field(out: &mut BytesMut, id: u8, data: &[u8]) {
    out.put_u32(data.len() as u32 + 1);
    out.put_u8(id);
    out.extend_from_slice(data);
}
