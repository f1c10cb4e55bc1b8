//! Document types

use crate::error::{Error, Result};
use crate::revision::Revision;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum serialized document size in bytes (16MB default)
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Maximum document ID length in bytes
pub const MAX_ID_LENGTH: usize = 512;

/// A JSON document with CouchDB-style metadata.
///
/// Serializes flat: `{"_id": .., "_rev": .., "_deleted": true?, ...body}`.
/// A deleted document is a tombstone; it keeps its id and revision chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,

    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,

    #[serde(flatten)]
    pub body: Map<String, Value>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Document {
    /// Create a document with the given ID and body
    pub fn new(id: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            deleted: false,
            body,
        }
    }

    /// Parse a document from its flat JSON form
    pub fn from_json(value: Value) -> Result<Self> {
        let Some(fields) = value.as_object() else {
            return Err(Error::InvalidDocument("document must be a JSON object".into()));
        };
        match fields.get("_rev") {
            Some(Value::String(rev)) => {
                Revision::parse(rev)?;
            }
            Some(Value::Null) | None => {}
            Some(other) => return Err(Error::MalformedRevision(other.to_string())),
        }
        serde_json::from_value(value).map_err(|e| Error::InvalidDocument(e.to_string()))
    }

    /// Flat JSON form
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Set the revision the caller believes is current
    pub fn with_rev(mut self, rev: Revision) -> Self {
        self.rev = Some(rev);
        self
    }

    /// Generation of the current revision, if any
    pub fn generation(&self) -> Option<u64> {
        self.rev.as_ref().map(Revision::generation)
    }

    /// A tombstone for this document: same id and revision, empty body
    pub fn tombstone(&self) -> Self {
        Self {
            id: self.id.clone(),
            rev: self.rev.clone(),
            deleted: true,
            body: Map::new(),
        }
    }
}

/// Validate a caller-supplied document ID
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidDocument("Document ID cannot be empty".into()));
    }

    if id.len() > MAX_ID_LENGTH {
        return Err(Error::InvalidDocument(format!(
            "Document ID exceeds {} bytes",
            MAX_ID_LENGTH
        )));
    }

    if crate::revision::is_reserved(id) {
        return Err(Error::InvalidDocument(
            "Document ID cannot start with an underscore".into(),
        ));
    }

    Ok(())
}

/// Fresh random document ID
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
