//! Record keys and their digests.
//!
//! A record is addressed by namespace plus a 20-byte RIPEMD-160 digest of
//! its set name and typed user key. The digest, not the user key, decides
//! the partition, so any process computing it the same way routes the
//! record to the same node.

use ripemd::{Digest, Ripemd160};
use spire_protocol::value::{PARTICLE_BLOB, PARTICLE_INTEGER, PARTICLE_STRING};
use spire_protocol::Value;

use crate::error::ClientError;

pub const DIGEST_SIZE: usize = 20;

/// A record key.
#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    pub namespace: String,
    pub set: String,
    /// The user key, sent along with write commands.
    pub user_key: Option<Value>,
    pub digest: [u8; DIGEST_SIZE],
}

impl Key {
    /// Builds a key from an integer, string or blob user key.
    pub fn new(
        namespace: impl Into<String>,
        set: impl Into<String>,
        user_key: impl Into<Value>,
    ) -> Result<Self, ClientError> {
        let namespace = namespace.into();
        if namespace.is_empty() {
            return Err(ClientError::InvalidArgument("empty namespace".into()));
        }
        let set = set.into();
        let user_key = user_key.into();
        let digest = compute_digest(&set, &user_key)?;
        Ok(Self {
            namespace,
            set,
            user_key: Some(user_key),
            digest,
        })
    }

    /// Builds a key from a digest computed elsewhere.
    pub fn from_digest(
        namespace: impl Into<String>,
        set: impl Into<String>,
        digest: [u8; DIGEST_SIZE],
    ) -> Self {
        Self {
            namespace: namespace.into(),
            set: set.into(),
            user_key: None,
            digest,
        }
    }

    /// The partition this key lives in. `n_partitions` must be a power of
    /// two.
    pub fn partition_id(&self, n_partitions: u32) -> u32 {
        partition_id(&self.digest, n_partitions)
    }
}

/// Partition of a digest: its first four bytes, little-endian, masked.
pub fn partition_id(digest: &[u8; DIGEST_SIZE], n_partitions: u32) -> u32 {
    let word = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    word & n_partitions.wrapping_sub(1)
}

fn compute_digest(set: &str, key: &Value) -> Result<[u8; DIGEST_SIZE], ClientError> {
    let mut hasher = Ripemd160::new();
    hasher.update(set.as_bytes());
    match key {
        Value::Int(v) => {
            hasher.update([PARTICLE_INTEGER]);
            hasher.update(v.to_be_bytes());
        }
        Value::String(s) => {
            hasher.update([PARTICLE_STRING]);
            hasher.update(s.as_bytes());
        }
        Value::Blob(b) => {
            hasher.update([PARTICLE_BLOB]);
            hasher.update(b);
        }
        other => {
            return Err(ClientError::InvalidArgument(format!(
                "unsupported key type (particle {})",
                other.particle_type()
            )))
        }
    }
    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        let a = Key::new("test", "users", "alice").unwrap();
        let b = Key::new("test", "users", "alice").unwrap();
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn set_and_type_change_the_digest() {
        let a = Key::new("test", "users", "1").unwrap();
        let b = Key::new("test", "other", "1").unwrap();
        let c = Key::new("test", "users", 1i64).unwrap();
        assert_ne!(a.digest, b.digest);
        assert_ne!(a.digest, c.digest);
    }

    #[test]
    fn namespace_does_not_change_the_digest() {
        let a = Key::new("ns1", "s", 7i64).unwrap();
        let b = Key::new("ns2", "s", 7i64).unwrap();
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn partition_from_little_endian_prefix() {
        let mut digest = [0u8; DIGEST_SIZE];
        digest[0] = 0x34;
        digest[1] = 0x12;
        digest[2] = 0xff;
        assert_eq!(partition_id(&digest, 4096), 0x234);
        assert_eq!(partition_id(&digest, 16), 0x4);
    }

    #[test]
    fn partition_stays_in_range() {
        for i in 0..200i64 {
            let key = Key::new("test", "s", i).unwrap();
            assert!(key.partition_id(4096) < 4096);
        }
    }

    #[test]
    fn rejects_unsupported_keys() {
        assert!(Key::new("test", "s", 1.5f64).is_err());
        assert!(Key::new("", "s", "k").is_err());
    }
}
