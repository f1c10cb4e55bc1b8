//! Sofa Storage Backends
//!
//! The ordered key-value substrate underneath the document store:
//! - Memory (default): volatile `BTreeMap` collections
//! - SQLite: embedded persistence, one table per collection
//!
//! Keys and values are opaque byte strings. Keys order bytewise, so callers
//! that need numeric order store integers big-endian (see [`encode_u64`]).

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use std::ops::Bound;

/// A key together with its stored value
pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Scan direction for range queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Ascending key order
    #[default]
    Forward,
    /// Descending key order
    Reverse,
}

/// Key range with independently inclusive/exclusive bounds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Bound<Vec<u8>>,
    pub upper: Bound<Vec<u8>>,
}

impl KeyRange {
    /// Every key in the collection
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// Exactly one key
    pub fn only(key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        Self {
            lower: Bound::Included(key.clone()),
            upper: Bound::Included(key),
        }
    }

    /// Keys `>= key`
    pub fn starting_at(key: impl Into<Vec<u8>>) -> Self {
        Self {
            lower: Bound::Included(key.into()),
            upper: Bound::Unbounded,
        }
    }

    /// Keys `> key`
    pub fn after(key: impl Into<Vec<u8>>) -> Self {
        Self {
            lower: Bound::Excluded(key.into()),
            upper: Bound::Unbounded,
        }
    }

    /// Keys `<= key`
    pub fn up_to(key: impl Into<Vec<u8>>) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Included(key.into()),
        }
    }

    /// Keys `< key`
    pub fn before(key: impl Into<Vec<u8>>) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Excluded(key.into()),
        }
    }

    /// Keys in `[lower, upper]`
    pub fn between(lower: impl Into<Vec<u8>>, upper: impl Into<Vec<u8>>) -> Self {
        Self {
            lower: Bound::Included(lower.into()),
            upper: Bound::Included(upper.into()),
        }
    }

    /// Whether `key` falls inside the range
    pub fn contains(&self, key: &[u8]) -> bool {
        let above = match &self.lower {
            Bound::Included(l) => key >= l.as_slice(),
            Bound::Excluded(l) => key > l.as_slice(),
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(u) => key <= u.as_slice(),
            Bound::Excluded(u) => key < u.as_slice(),
            Bound::Unbounded => true,
        };
        above && below
    }

    /// True when no key can satisfy both bounds
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l), Bound::Excluded(u))
            | (Bound::Excluded(l), Bound::Included(u))
            | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
            _ => false,
        }
    }

    /// Borrowed bounds, suitable for `BTreeMap::range`
    pub fn as_slices(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        (borrow_bound(&self.lower), borrow_bound(&self.upper))
    }

    /// The remainder of this range once `key` has been consumed in `direction`.
    ///
    /// Cursors page through a collection by re-issuing the narrowed range.
    pub fn resume_after(&self, key: &[u8], direction: Direction) -> KeyRange {
        match direction {
            Direction::Forward => KeyRange {
                lower: Bound::Excluded(key.to_vec()),
                upper: self.upper.clone(),
            },
            Direction::Reverse => KeyRange {
                lower: self.lower.clone(),
                upper: Bound::Excluded(key.to_vec()),
            },
        }
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

fn borrow_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(k) => Bound::Included(k.as_slice()),
        Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Encode an integer key so that byte order matches numeric order
pub fn encode_u64(n: u64) -> Vec<u8> {
    n.to_be_bytes().to_vec()
}

/// Decode a key written by [`encode_u64`]
pub fn decode_u64(key: &[u8]) -> Result<u64, StorageError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| StorageError::Serialization(format!("expected 8-byte key, got {}", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Ordered key-value engine with named collections
#[async_trait]
pub trait Backend: Send + Sync {
    /// Create a collection if it does not exist yet
    async fn create_collection(&self, name: &str) -> Result<(), StorageError>;

    /// Drop a collection and everything in it
    async fn drop_collection(&self, name: &str) -> Result<bool, StorageError>;

    /// Check whether a collection exists
    async fn has_collection(&self, name: &str) -> Result<bool, StorageError>;

    /// Point lookup outside of any transaction
    async fn get(&self, collection: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Range scan outside of any transaction, at most `limit` entries
    async fn scan(
        &self,
        collection: &str,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<KeyValue>, StorageError>;

    /// Start a read-write transaction spanning every collection.
    ///
    /// Read-write transactions are serialized: a second `begin` waits until
    /// the first one commits or aborts.
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError>;

    /// Get storage statistics
    async fn stats(&self) -> Result<StorageStats, StorageError>;
}

/// A read-write transaction.
///
/// Reads observe the transaction's own writes. Nothing is visible to other
/// readers until [`Transaction::commit`] returns `Ok`. Dropping an open
/// transaction aborts it.
#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, collection: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    async fn put(&mut self, collection: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    async fn delete(&mut self, collection: &str, key: &[u8]) -> Result<bool, StorageError>;

    async fn scan(
        &mut self,
        collection: &str,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<KeyValue>, StorageError>;

    /// Make every write durable and visible
    async fn commit(&mut self) -> Result<(), StorageError>;

    /// Discard every write
    async fn abort(&mut self) -> Result<(), StorageError>;
}

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Collection not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transaction already finished")]
    TransactionClosed,
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub collection_count: usize,
    pub entry_count: usize,
    pub total_size_bytes: usize,
}

pub use memory::MemoryBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
