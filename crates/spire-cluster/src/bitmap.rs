//! Partition ownership bitmaps and the `replicas` info value.
//!
//! A node reports, per namespace and replica index, which partitions it
//! owns as a base64 bitmap of `n_partitions` bits, most significant bit
//! first. The `replicas` value concatenates one entry per namespace:
//!
//! ```text
//! ns1:regime,count,bitmap0,bitmap1;ns2:regime,count,bitmap0,bitmap1
//! ```
//!
//! Older servers omit the regime (`ns:count,bitmap...`), which is read as
//! regime zero.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::ClusterError;

/// Decoded ownership bitmap for one namespace and replica index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionBitmap {
    bytes: Vec<u8>,
    n_partitions: u32,
}

impl PartitionBitmap {
    /// Bytes needed to hold one bit per partition.
    pub fn byte_len(n_partitions: u32) -> usize {
        (n_partitions as usize + 7) / 8
    }

    /// An empty bitmap.
    pub fn empty(n_partitions: u32) -> Self {
        Self {
            bytes: vec![0; Self::byte_len(n_partitions)],
            n_partitions,
        }
    }

    /// Builds a bitmap with the given partitions set.
    pub fn from_owned(n_partitions: u32, owned: impl IntoIterator<Item = u32>) -> Self {
        let mut bitmap = Self::empty(n_partitions);
        for partition in owned {
            bitmap.set(partition);
        }
        bitmap
    }

    /// Decodes a base64 bitmap, rejecting any with the wrong length.
    pub fn decode(encoded: &str, n_partitions: u32) -> Result<Self, ClusterError> {
        let expected = Self::byte_len(n_partitions);
        // cheap length check before decoding: base64 of `expected` bytes
        let encoded_len = expected.div_ceil(3) * 4;
        if encoded.len() != encoded_len {
            return Err(ClusterError::Bitmap(format!(
                "expected {encoded_len} base64 chars, got {}",
                encoded.len()
            )));
        }
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| ClusterError::Bitmap(e.to_string()))?;
        if bytes.len() != expected {
            return Err(ClusterError::Bitmap(format!(
                "expected {expected} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            bytes,
            n_partitions,
        })
    }

    pub fn encode(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    pub fn owns(&self, partition: u32) -> bool {
        if partition >= self.n_partitions {
            return false;
        }
        let i = partition as usize;
        self.bytes[i >> 3] & (0x80 >> (i & 7)) != 0
    }

    pub fn set(&mut self, partition: u32) {
        if partition < self.n_partitions {
            let i = partition as usize;
            self.bytes[i >> 3] |= 0x80 >> (i & 7);
        }
    }

    /// Partition ids whose bit is set, ascending.
    pub fn owned(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.n_partitions).filter(move |&p| self.owns(p))
    }
}

/// One namespace entry of a `replicas` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceReplicas {
    pub namespace: String,
    pub regime: u32,
    /// One bitmap per replica index; index 0 is the master.
    pub bitmaps: Vec<PartitionBitmap>,
}

/// Parses a full `replicas` info value.
pub fn parse_replicas(value: &str, n_partitions: u32) -> Result<Vec<NamespaceReplicas>, ClusterError> {
    let mut out = Vec::new();
    for entry in value.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        out.push(parse_entry(entry, n_partitions)?);
    }
    Ok(out)
}

fn parse_entry(entry: &str, n_partitions: u32) -> Result<NamespaceReplicas, ClusterError> {
    let malformed = |why: &str| ClusterError::MalformedReplicas(format!("{why}: '{entry}'"));

    let (namespace, rest) = entry
        .split_once(':')
        .ok_or_else(|| malformed("missing ':'"))?;
    if namespace.is_empty() {
        return Err(malformed("empty namespace"));
    }
    let tokens: Vec<&str> = rest.split(',').collect();

    let number = |s: &str| s.parse::<u32>().map_err(|_| malformed("bad number"));

    // with regime: regime, count, then `count` bitmaps
    let (regime, count, bitmaps) = match tokens.as_slice() {
        [first, second, tail @ ..]
            if second.parse::<usize>().is_ok_and(|c| c == tail.len()) =>
        {
            (number(first)?, number(second)? as usize, tail)
        }
        [first, tail @ ..] if first.parse::<usize>().is_ok_and(|c| c == tail.len()) => {
            (0, number(first)? as usize, tail)
        }
        _ => return Err(malformed("bitmap count mismatch")),
    };
    if count == 0 {
        return Err(malformed("zero replicas"));
    }

    let bitmaps = bitmaps
        .iter()
        .map(|b| PartitionBitmap::decode(b, n_partitions))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(NamespaceReplicas {
        namespace: namespace.to_string(),
        regime,
        bitmaps,
    })
}

/// Renders a `replicas` value. Used by test servers and shared-memory tests.
pub fn format_replicas(entries: &[NamespaceReplicas]) -> String {
    entries
        .iter()
        .map(|e| {
            let bitmaps: Vec<String> = e.bitmaps.iter().map(PartitionBitmap::encode).collect();
            format!(
                "{}:{},{},{}",
                e.namespace,
                e.regime,
                e.bitmaps.len(),
                bitmaps.join(",")
            )
        })
        .collect::<Vec<_>>()
        .join(";")
}
