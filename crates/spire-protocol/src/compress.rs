//! Compressed message envelope.
//!
//! A compressed message is a proto header of type `Compressed`, followed
//! by the big-endian u64 size of the original message and the zlib stream
//! of that original message (which carries its own proto header).

use std::io::{Read, Write};

use bytes::{BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::ProtocolError;
use crate::header::{read_u64, ProtoHeader, ProtoType, PROTO_HEADER_SIZE};

/// Size of the uncompressed-length prefix inside the envelope body.
pub const ENVELOPE_PREFIX_SIZE: usize = 8;

/// Wraps a complete message (proto header included) in a compressed envelope.
pub fn compress_message(message: &[u8], out: &mut BytesMut) -> Result<(), ProtocolError> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(message.len() / 2),
        Compression::default(),
    );
    encoder
        .write_all(message)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;

    let body = (ENVELOPE_PREFIX_SIZE + compressed.len()) as u64;
    out.reserve(PROTO_HEADER_SIZE + body as usize);
    out.extend_from_slice(&ProtoHeader::new(ProtoType::Compressed, body).encode()?);
    out.put_u64(message.len() as u64);
    out.extend_from_slice(&compressed);
    Ok(())
}

/// Inflates the body of a compressed envelope (everything after its proto
/// header) back into the original message.
///
/// The declared size is checked against `max_size` before any buffer is
/// allocated, and the inflated length must match it exactly.
pub fn decompress_body(body: &[u8], max_size: u64) -> Result<Vec<u8>, ProtocolError> {
    if body.len() < ENVELOPE_PREFIX_SIZE {
        return Err(ProtocolError::Truncated {
            what: "compressed envelope",
            offset: 0,
        });
    }
    let declared = read_u64(body);
    if declared > max_size {
        return Err(ProtocolError::SizeTooLarge {
            size: declared,
            limit: max_size,
        });
    }
    let declared = usize::try_from(declared).map_err(|_| ProtocolError::SizeTooLarge {
        size: declared,
        limit: max_size,
    })?;

    let mut out = Vec::with_capacity(declared);
    // read one byte past the declared size so an oversized stream is caught
    let mut decoder = ZlibDecoder::new(&body[ENVELOPE_PREFIX_SIZE..]).take(declared as u64 + 1);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;

    if out.len() != declared {
        return Err(ProtocolError::Compression(format!(
            "declared {declared} bytes, inflated {}",
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Vec<u8> {
        let body = vec![7u8; 4000];
        let mut msg = ProtoHeader::new(ProtoType::Message, body.len() as u64)
            .encode()
            .unwrap()
            .to_vec();
        msg.extend_from_slice(&body);
        msg
    }

    #[test]
    fn envelope_round_trip() {
        let msg = sample_message();
        let mut out = BytesMut::new();
        compress_message(&msg, &mut out).unwrap();

        let header = ProtoHeader::decode(&out).unwrap();
        assert_eq!(header.kind, ProtoType::Compressed);
        assert_eq!(header.size as usize, out.len() - PROTO_HEADER_SIZE);
        assert!(out.len() < msg.len());

        let inflated = decompress_body(&out[PROTO_HEADER_SIZE..], 1 << 20).unwrap();
        assert_eq!(inflated, msg);
    }

    #[test]
    fn declared_size_checked_before_allocating() {
        let mut body = Vec::new();
        body.extend_from_slice(&u64::MAX.to_be_bytes());
        body.extend_from_slice(&[0x78, 0x9c]);
        let err = decompress_body(&body, 1 << 20).unwrap_err();
        assert!(matches!(err, ProtocolError::SizeTooLarge { .. }));
    }

    #[test]
    fn size_mismatch_rejected() {
        let msg = sample_message();
        let mut out = BytesMut::new();
        compress_message(&msg, &mut out).unwrap();

        // lie about the original size
        let lie = (msg.len() as u64 - 10).to_be_bytes();
        out[PROTO_HEADER_SIZE..PROTO_HEADER_SIZE + 8].copy_from_slice(&lie);
        let err = decompress_body(&out[PROTO_HEADER_SIZE..], 1 << 20).unwrap_err();
        assert!(matches!(err, ProtocolError::Compression(_)));
    }

    #[test]
    fn garbage_stream_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&100u64.to_be_bytes());
        body.extend_from_slice(b"definitely not zlib");
        assert!(decompress_body(&body, 1 << 20).is_err());
    }

    #[test]
    fn truncated_envelope() {
        assert!(matches!(
            decompress_body(&[0, 0, 1], 1 << 20),
            Err(ProtocolError::Truncated { .. })
        ));
    }
}
