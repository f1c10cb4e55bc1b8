//! Sofa Core - revisioned documents over an ordered key-value store
//!
//! This crate provides the semantic layer of sofa:
//! - Revision identifiers derived from document content
//! - An append-only sequence log of every committed mutation
//! - A document store with optimistic-concurrency revision checks
//! - One-shot and continuous change feeds
//! - Bulk writes with optional all-or-nothing commit
//! - Pull replication from a remote change source

pub mod bulk;
pub mod changes;
pub mod document;
pub mod error;
pub mod options;
pub mod replicate;
pub mod revision;
pub mod sequence;
pub mod store;

pub use changes::{ChangeFeed, ChangeListeners, ChangeRecord, Subscription};
pub use document::{generate_id, validate_id, Document};
pub use error::{Error, Result};
pub use options::{AllDocsOptions, Options};
pub use replicate::{
    ChangeSource, RemoteChange, RemoteChanges, ReplicationFailure, ReplicationHandle,
    ReplicationOptions, ReplicationResult, ReplicationState, ReplicationSummary, Replicator,
    RevisionRef,
};
pub use revision::Revision;
pub use sequence::{HistoryItem, SequenceCursor, SequenceEntry, SequenceLog};
pub use store::{Store, StoreInfo, WriteResult};
