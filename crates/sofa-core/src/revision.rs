//! Revision identifiers
//!
//! A revision is written `<generation>-<hash>`. The generation counts accepted
//! writes to a document; the hash is a CRC-64 of the document body with
//! reserved (`_`-prefixed) fields left out. Identical bodies at the same
//! generation therefore produce identical revisions.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Parsed revision identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision {
    generation: u64,
    hash: String,
}

impl Revision {
    /// Build a revision from its parts
    pub fn new(generation: u64, hash: impl Into<String>) -> Result<Self> {
        let hash = hash.into();
        if generation == 0 || hash.is_empty() {
            return Err(Error::MalformedRevision(format!("{}-{}", generation, hash)));
        }
        Ok(Self { generation, hash })
    }

    /// Parse `<generation>-<hash>`
    pub fn parse(rev: &str) -> Result<Self> {
        let malformed = || Error::MalformedRevision(rev.to_string());

        let (generation, hash) = rev.split_once('-').ok_or_else(malformed)?;
        let generation: u64 = generation.parse().map_err(|_| malformed())?;
        if generation == 0 || hash.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            generation,
            hash: hash.to_string(),
        })
    }

    /// Revision for the next write of `body` on top of `previous`
    pub fn derive(body: &Map<String, Value>, previous: Option<&Revision>) -> Self {
        Self {
            generation: previous.map_or(1, |p| p.generation + 1),
            hash: content_hash(body),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for Revision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Revision {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Revision> for String {
    fn from(rev: Revision) -> Self {
        rev.to_string()
    }
}

/// Whether a top-level field name is reserved for metadata
pub fn is_reserved(field: &str) -> bool {
    field.starts_with('_')
}

/// Deterministic, non-cryptographic digest of a body's non-reserved fields
pub fn content_hash(body: &Map<String, Value>) -> String {
    let content: Map<String, Value> = body
        .iter()
        .filter(|(k, _)| !is_reserved(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    // Maps are key-ordered, so equal bodies serialize to equal bytes.
    // Serializing a JSON map with string keys cannot fail.
    let bytes = serde_json::to_vec(&content).unwrap_or_default();

    let mut digest = crc64fast::Digest::new();
    digest.write(&bytes);
    format!("{:016x}", digest.sum64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_parse_valid() {
        let rev = Revision::parse("3-abc123").unwrap();
        assert_eq!(rev.generation(), 3);
        assert_eq!(rev.hash(), "abc123");
        assert_eq!(rev.to_string(), "3-abc123");
    }

    #[test]
    fn test_parse_keeps_dashes_in_hash() {
        let rev: Revision = "2-a-b".parse().unwrap();
        assert_eq!(rev.generation(), 2);
        assert_eq!(rev.hash(), "a-b");
    }

    #[test]
    fn test_parse_malformed() {
        for bad in ["", "abc", "x-abc", "-abc", "1-", "0-abc", "-1-abc"] {
            assert!(
                matches!(Revision::parse(bad), Err(Error::MalformedRevision(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_derive_increments_generation() {
        let b = body(json!({"x": 1}));
        let first = Revision::derive(&b, None);
        assert_eq!(first.generation(), 1);

        let second = Revision::derive(&body(json!({"x": 2})), Some(&first));
        assert_eq!(second.generation(), 2);
        assert_ne!(first.hash(), second.hash());
    }

    #[test]
    fn test_hash_ignores_reserved_fields() {
        let plain = body(json!({"x": 1, "y": "two"}));
        let with_meta = body(json!({"_id": "a", "_rev": "1-zzz", "x": 1, "y": "two"}));
        assert_eq!(content_hash(&plain), content_hash(&with_meta));
        assert_eq!(content_hash(&plain).len(), 16);
    }

    #[test]
    fn test_same_body_same_generation_collides() {
        let b = body(json!({"x": 1}));
        let prev = Revision::parse("1-old").unwrap();
        assert_eq!(Revision::derive(&b, Some(&prev)), Revision::derive(&b, Some(&prev)));
    }

    #[test]
    fn test_serde_as_string() {
        let rev = Revision::parse("7-deadbeef").unwrap();
        assert_eq!(serde_json::to_value(&rev).unwrap(), json!("7-deadbeef"));

        let back: Revision = serde_json::from_value(json!("7-deadbeef")).unwrap();
        assert_eq!(back, rev);
        assert!(serde_json::from_value::<Revision>(json!("bogus")).is_err());
    }
}
