//! Cache keys and the content pointers derived from them.
//!
//! A `CacheKey` can only be built through [`CacheKey::new`], which validates
//! every component. Anything holding a key therefore holds a well-formed one,
//! and the index never sees malformed input.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::identity::compute_key_digest;

/// Separator byte between key components in the encoded form.
const SEPARATOR: u8 = 0x00;

/// Composite key identifying one cached document: `(source, branch, path)`.
///
/// # Binary Format
///
/// `encode()` produces `source 0x00 branch 0x00 path`. Components may not
/// contain the separator, so:
/// - all keys of one source share the prefix `source 0x00`
/// - all keys of one branch share the prefix `source 0x00 branch 0x00`
/// - LMDB prefix scans can walk a source or a branch without a secondary index
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "KeyParts", into = "KeyParts")]
pub struct CacheKey {
    inner: KeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct KeyInner {
    source_id: String,
    branch: String,
    path: String,
}

/// Wire form used for serde so that deserialization goes through validation.
#[derive(Serialize, Deserialize)]
struct KeyParts {
    source_id: String,
    branch: String,
    path: String,
}

impl TryFrom<KeyParts> for CacheKey {
    type Error = ValidationError;

    fn try_from(parts: KeyParts) -> Result<Self, Self::Error> {
        CacheKey::new(parts.source_id, parts.branch, parts.path)
    }
}

impl From<CacheKey> for KeyParts {
    fn from(key: CacheKey) -> Self {
        KeyParts {
            source_id: key.inner.source_id,
            branch: key.inner.branch,
            path: key.inner.path,
        }
    }
}

impl CacheKey {
    /// Create a validated cache key.
    ///
    /// Every component must be non-empty and free of NUL bytes.
    pub fn new(
        source_id: impl Into<String>,
        branch: impl Into<String>,
        path: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let source_id = source_id.into();
        let branch = branch.into();
        let path = path.into();

        validate_component("source_id", &source_id)?;
        validate_component("branch", &branch)?;
        validate_component("path", &path)?;

        Ok(Self {
            inner: KeyInner {
                source_id,
                branch,
                path,
            },
        })
    }

    pub fn source_id(&self) -> &str {
        &self.inner.source_id
    }

    pub fn branch(&self) -> &str {
        &self.inner.branch
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Encode this key for index storage.
    pub fn encode(&self) -> Vec<u8> {
        let inner = &self.inner;
        let mut bytes =
            Vec::with_capacity(inner.source_id.len() + inner.branch.len() + inner.path.len() + 2);
        bytes.extend_from_slice(inner.source_id.as_bytes());
        bytes.push(SEPARATOR);
        bytes.extend_from_slice(inner.branch.as_bytes());
        bytes.push(SEPARATOR);
        bytes.extend_from_slice(inner.path.as_bytes());
        bytes
    }

    /// Decode a key from its encoded form.
    ///
    /// Returns `None` if the bytes do not hold exactly three valid UTF-8
    /// components or any component is empty.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut parts = bytes.splitn(3, |b| *b == SEPARATOR);
        let source_id = std::str::from_utf8(parts.next()?).ok()?;
        let branch = std::str::from_utf8(parts.next()?).ok()?;
        let path = std::str::from_utf8(parts.next()?).ok()?;
        Self::new(source_id, branch, path).ok()
    }

    /// Prefix shared by every encoded key of `source_id`.
    pub fn source_prefix(source_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(source_id.len() + 1);
        prefix.extend_from_slice(source_id.as_bytes());
        prefix.push(SEPARATOR);
        prefix
    }

    /// Prefix shared by every encoded key of `branch` within `source_id`.
    pub fn branch_prefix(source_id: &str, branch: &str) -> Vec<u8> {
        let mut prefix = Self::source_prefix(source_id);
        prefix.extend_from_slice(branch.as_bytes());
        prefix.push(SEPARATOR);
        prefix
    }

    /// Deterministic content location for this key.
    pub fn content_pointer(&self) -> ContentPointer {
        ContentPointer::for_key(self)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}",
            self.inner.source_id, self.inner.branch, self.inner.path
        )
    }
}

/// Validate a single key component (also used for bare source ids and branches).
pub fn validate_component(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::EmptyField { field });
    }
    if value.as_bytes().contains(&SEPARATOR) {
        return Err(ValidationError::ForbiddenByte { field });
    }
    Ok(())
}

/// Location of a blob inside the content tree.
///
/// The pointer is `hh/<digest>` where `<digest>` is the lowercase hex SHA-256
/// of the encoded key and `hh` its first two characters. It is derived from
/// the key alone, never from the content. Deserialization goes through
/// [`ContentPointer::parse`], so a stored pointer is always well-formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentPointer(String);

impl ContentPointer {
    const DIGEST_HEX_LEN: usize = 64;

    /// Compute the pointer for a key.
    pub fn for_key(key: &CacheKey) -> Self {
        let digest = hex::encode(compute_key_digest(&key.encode()));
        Self(format!("{}/{}", &digest[..2], digest))
    }

    /// Parse a relative pointer path, rejecting anything that is not a
    /// well-formed `hh/<digest>`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (fan_out, digest) = raw.split_once('/')?;
        let well_formed = digest.len() == Self::DIGEST_HEX_LEN
            && digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
            && digest.starts_with(fan_out)
            && fan_out.len() == 2;
        well_formed.then(|| Self(raw.to_string()))
    }

    /// Fan-out directory name.
    pub fn fan_out(&self) -> &str {
        &self.0[..2]
    }

    /// Blob file name inside the fan-out directory.
    pub fn file_name(&self) -> &str {
        &self.0[3..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ContentPointer {
    type Error = ValidationError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw).ok_or_else(|| ValidationError::InvalidValue {
            field: "pointer".to_string(),
            reason: format!("not a content pointer: {raw:?}"),
        })
    }
}

impl From<ContentPointer> for String {
    fn from(pointer: ContentPointer) -> Self {
        pointer.0
    }
}

impl fmt::Display for ContentPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
