//! Identity and hashing primitives for cached documents

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Size of a cached blob in bytes.
pub type ByteSize = u64;

/// SHA-256 digest of an encoded cache key.
pub type KeyDigest = [u8; 32];

/// Compute the SHA-256 digest of an encoded cache key.
///
/// The digest names the blob on disk, so the same logical document always
/// lands at the same location no matter how often it is re-fetched.
pub fn compute_key_digest(encoded_key: &[u8]) -> KeyDigest {
    let mut hasher = Sha256::new();
    hasher.update(encoded_key);
    let result = hasher.finalize();
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&result);
    digest
}
