//! Info protocol: newline-separated name requests, tab-separated answers.
//!
//! The tender uses it to learn a node's name, features, peers, racks and
//! partition ownership. A request is a proto header of type `Info` followed
//! by `name\n` for every name asked. The response body holds one
//! `name\tvalue\n` line per name.

use std::collections::HashMap;

use bytes::BytesMut;

use crate::error::ProtocolError;
use crate::header::{ProtoHeader, ProtoType};

/// Builds an info request for the given names.
pub fn encode_request(names: &[&str], out: &mut BytesMut) -> Result<(), ProtocolError> {
    let body: usize = names.iter().map(|n| n.len() + 1).sum();
    out.reserve(8 + body);
    out.extend_from_slice(&ProtoHeader::new(ProtoType::Info, body as u64).encode()?);
    for name in names {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b"\n");
    }
    Ok(())
}

/// Parses an info response body into a name → value map.
///
/// A line without a tab maps its whole content to an empty value, which is
/// what the server sends for names it doesn't recognize.
pub fn parse_response(body: &[u8]) -> Result<HashMap<String, String>, ProtocolError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| ProtocolError::MalformedInfo(format!("not utf-8: {e}")))?;

    let mut out = HashMap::new();
    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        match line.split_once('\t') {
            Some((name, value)) => out.insert(name.to_string(), value.to_string()),
            None => out.insert(line.to_string(), String::new()),
        };
    }
    Ok(out)
}

/// Builds the response body the server would send. Used by test servers.
pub fn encode_response(pairs: &[(&str, &str)], out: &mut BytesMut) -> Result<(), ProtocolError> {
    let body: usize = pairs.iter().map(|(n, v)| n.len() + v.len() + 2).sum();
    out.reserve(8 + body);
    out.extend_from_slice(&ProtoHeader::new(ProtoType::Info, body as u64).encode()?);
    for (name, value) in pairs {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b"\t");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\n");
    }
    Ok(())
}

/// Splits a request body back into the names asked.
pub fn parse_request(body: &[u8]) -> Result<Vec<String>, ProtocolError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| ProtocolError::MalformedInfo(format!("not utf-8: {e}")))?;
    Ok(text
        .split('\n')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}
