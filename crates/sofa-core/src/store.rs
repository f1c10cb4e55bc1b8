//! Document store
//!
//! A [`Store`] layers revisioned documents over two backend collections:
//! `<name>/documents` holds the current snapshot of each document and
//! `<name>/sequence` holds the [`SequenceLog`]. The in-memory index of
//! id -> latest sequence is rebuilt from the log at open and is the sole
//! authority on whether a write creates or updates a document.

use crate::changes::{ChangeFeed, ChangeListeners, ChangeRecord, Subscription};
use crate::document::{generate_id, validate_id, Document, MAX_DOCUMENT_SIZE};
use crate::error::{Error, Result};
use crate::options::{AllDocsOptions, Options};
use crate::revision::Revision;
use crate::sequence::{SequenceEntry, SequenceLog, DEFAULT_PAGE_SIZE};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sofa_storage::{Backend, Direction, KeyRange, StorageStats, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Outcome of an accepted write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub id: String,
    pub rev: Revision,
    pub seq: u64,
}

/// Summary of a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub name: String,
    pub doc_count: usize,
    pub deleted_count: usize,
    pub update_seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    seq: u64,
    deleted: bool,
}

#[derive(Debug, Default)]
struct StoreIndex {
    docs: HashMap<String, IndexEntry>,
    seq: u64,
}

struct StoreInner {
    name: String,
    backend: Arc<dyn Backend>,
    documents: String,
    log: SequenceLog,
    index: RwLock<StoreIndex>,
    listeners: Arc<ChangeListeners>,
    /// Held from transaction begin until the index reflects the commit
    write_gate: Mutex<()>,
}

/// Handle on one named store. Clones share the same index and listeners.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

fn collection_names(name: &str) -> (String, String) {
    (format!("{}/documents", name), format!("{}/sequence", name))
}

impl Store {
    /// Open (creating if needed) the store `name` and rebuild its index
    pub async fn open(backend: Arc<dyn Backend>, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidDocument("store name cannot be empty".into()));
        }

        let (documents, sequence) = collection_names(&name);
        backend.create_collection(&documents).await?;
        backend.create_collection(&sequence).await?;

        let log = SequenceLog::new(backend.clone(), sequence);
        let mut index = StoreIndex::default();
        let mut cursor = log.scan_from(0, false);
        while let Some(entry) = cursor.next().await? {
            index.docs.insert(
                entry.id,
                IndexEntry {
                    seq: entry.seq,
                    deleted: entry.deleted,
                },
            );
            index.seq = entry.seq;
        }

        info!(
            store = %name,
            docs = index.docs.len(),
            update_seq = index.seq,
            "Opened store"
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                name,
                backend,
                documents,
                log,
                index: RwLock::new(index),
                listeners: Arc::new(ChangeListeners::new()),
                write_gate: Mutex::new(()),
            }),
        })
    }

    /// Drop both collections of the store `name`
    pub async fn remove_store(backend: &dyn Backend, name: &str) -> Result<bool> {
        let (documents, sequence) = collection_names(name);
        let dropped_docs = backend.drop_collection(&documents).await?;
        let dropped_seq = backend.drop_collection(&sequence).await?;
        info!(store = %name, "Removed store");
        Ok(dropped_docs || dropped_seq)
    }

    /// Remove this store's data; other clones of the handle become unusable
    pub async fn destroy(self) -> Result<()> {
        let _gate = self.inner.write_gate.lock().await;
        Self::remove_store(self.inner.backend.as_ref(), &self.inner.name).await?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn sequence_log(&self) -> &SequenceLog {
        &self.inner.log
    }

    /// Live document by id
    pub async fn get(&self, id: &str) -> Result<Document> {
        match self.lookup(id).await? {
            Some(doc) if !doc.deleted => Ok(doc),
            _ => Err(Error::NotFound(id.to_string())),
        }
    }

    /// Current snapshot by id, tombstones included
    pub async fn lookup(&self, id: &str) -> Result<Option<Document>> {
        match self
            .inner
            .backend
            .get(&self.inner.documents, id.as_bytes())
            .await?
        {
            Some(bytes) => decode_document(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Create or update one document
    pub async fn put(&self, doc: Document, options: Options) -> Result<WriteResult> {
        let mut batch = self.begin_write().await?;
        match batch.stage(doc, options).await {
            Ok(result) => {
                batch.commit().await?;
                Ok(result)
            }
            Err(e) => {
                batch.abort().await;
                Err(e)
            }
        }
    }

    /// Write a tombstone for `doc`; the same revision rules as `put` apply
    pub async fn remove(&self, doc: Document, options: Options) -> Result<WriteResult> {
        if doc.id.is_empty() {
            return Err(Error::InvalidDocument("cannot remove a document without an id".into()));
        }
        self.put(doc.tombstone(), options).await
    }

    /// Counts and the current sequence
    pub fn info(&self) -> StoreInfo {
        let index = self.inner.index.read();
        let deleted_count = index.docs.values().filter(|e| e.deleted).count();
        StoreInfo {
            name: self.inner.name.clone(),
            doc_count: index.docs.len() - deleted_count,
            deleted_count,
            update_seq: index.seq,
        }
    }

    /// Backend-wide statistics; covers every collection, not only this store's
    pub async fn storage_stats(&self) -> Result<StorageStats> {
        Ok(self.inner.backend.stats().await?)
    }

    /// Highest committed sequence number
    pub fn update_seq(&self) -> u64 {
        self.inner.index.read().seq
    }

    /// Sequence of the latest committed mutation of `id`
    pub fn latest_seq(&self, id: &str) -> Option<u64> {
        self.inner.index.read().docs.get(id).map(|e| e.seq)
    }

    /// Documents by primary key.
    ///
    /// `start_key`/`end_key` are given in iteration order, so a descending
    /// query starts at the higher key.
    pub async fn all_docs(&self, options: &AllDocsOptions) -> Result<Vec<Document>> {
        let start = options.start_key.as_ref().map(|k| k.as_bytes().to_vec());
        let end = options.end_key.as_ref().map(|k| k.as_bytes().to_vec());
        let (low, high, direction) = if options.descending {
            (end, start, Direction::Reverse)
        } else {
            (start, end, Direction::Forward)
        };

        let mut range = match (low, high) {
            (Some(l), Some(h)) => KeyRange::between(l, h),
            (Some(l), None) => KeyRange::starting_at(l),
            (None, Some(h)) => KeyRange::up_to(h),
            (None, None) => KeyRange::all(),
        };

        let limit = options.limit.unwrap_or(usize::MAX);
        let mut docs = Vec::new();
        while docs.len() < limit {
            let page = self
                .inner
                .backend
                .scan(&self.inner.documents, &range, direction, DEFAULT_PAGE_SIZE)
                .await?;
            let exhausted = page.len() < DEFAULT_PAGE_SIZE;
            if let Some((last, _)) = page.last() {
                range = range.resume_after(last, direction);
            }

            for (_, value) in page {
                let doc = decode_document(&value)?;
                if (options.include_deleted || !doc.deleted) && docs.len() < limit {
                    docs.push(doc);
                }
            }
            if exhausted || range.is_empty() {
                break;
            }
        }
        Ok(docs)
    }

    /// Feed of changes after `options.since`; continuous when `options.continuous`
    pub fn changes(&self, options: Options) -> ChangeFeed {
        // Subscribe first so nothing committed during the replay is missed
        let live = options.continuous.then(|| self.inner.listeners.subscribe());
        let replay = self.inner.log.scan_from(options.since, false);
        ChangeFeed::new(self.clone(), replay, live, options.since)
    }

    /// Raw listener for changes committed from now on
    pub fn subscribe(&self) -> Subscription {
        self.inner.listeners.subscribe()
    }

    /// Start a write batch. Holds the store's write gate until dropped.
    pub(crate) async fn begin_write(&self) -> Result<WriteBatch<'_>> {
        let gate = self.inner.write_gate.lock().await;
        let mut txn = self.inner.backend.begin().await?;
        let known = self.inner.index.read().seq;
        let next = self.inner.log.next_sequence(txn.as_mut(), known).await?;
        if next != known + 1 {
            warn!(
                store = %self.inner.name,
                known,
                next,
                "Sequence log is ahead of the index"
            );
        }

        Ok(WriteBatch {
            store: self,
            txn,
            _gate: gate,
            staged: HashMap::new(),
            last_seq: next - 1,
            changes: Vec::new(),
        })
    }
}

fn decode_document(bytes: &[u8]) -> Result<Document> {
    serde_json::from_slice(bytes).map_err(|e| Error::Serialization(format!("corrupt document: {}", e)))
}

/// Writes staged in one backend transaction.
///
/// Every read goes through the transaction; the backend may hold an exclusive
/// connection for the transaction's lifetime.
pub(crate) struct WriteBatch<'a> {
    store: &'a Store,
    txn: Box<dyn Transaction>,
    _gate: MutexGuard<'a, ()>,
    staged: HashMap<String, IndexEntry>,
    last_seq: u64,
    changes: Vec<ChangeRecord>,
}

impl<'a> WriteBatch<'a> {
    fn recorded(&self, id: &str) -> Option<IndexEntry> {
        self.staged
            .get(id)
            .copied()
            .or_else(|| self.store.inner.index.read().docs.get(id).copied())
    }

    /// Snapshot of `id` as seen by this batch, tombstones included
    pub(crate) async fn current(&mut self, id: &str) -> Result<Option<Document>> {
        if self.recorded(id).is_none() {
            return Ok(None);
        }
        match self.txn.get(&self.store.inner.documents, id.as_bytes()).await? {
            Some(bytes) => decode_document(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Validate and stage one write. On error nothing has been written.
    pub(crate) async fn stage(&mut self, mut doc: Document, options: Options) -> Result<WriteResult> {
        if doc.id.is_empty() {
            doc.id = generate_id();
        } else {
            validate_id(&doc.id)?;
        }

        let previous = match self.recorded(&doc.id) {
            Some(recorded) => self.previous(&doc.id, recorded.seq).await?,
            None => None,
        };

        let rev = match (&previous, options.new_edits) {
            (None, true) => Revision::derive(&doc.body, None),
            (Some((_, current)), true) => {
                if !current.deleted && doc.rev != current.rev {
                    let reason = match &doc.rev {
                        Some(rev) => format!("revision {} is not current", rev),
                        None => "document exists and no revision was given".to_string(),
                    };
                    return Err(Error::conflict(&doc.id, reason));
                }
                Revision::derive(&doc.body, current.rev.as_ref())
            }
            (_, false) => doc.rev.clone().ok_or_else(|| {
                Error::MalformedRevision(format!("{}: foreign write without a revision", doc.id))
            })?,
        };

        let stored = Document {
            id: doc.id,
            rev: Some(rev.clone()),
            deleted: doc.deleted,
            body: doc.body,
        };
        let value = serde_json::to_vec(&stored)?;
        if value.len() > MAX_DOCUMENT_SIZE {
            return Err(Error::InvalidDocument(format!(
                "{}: document exceeds {} bytes",
                stored.id, MAX_DOCUMENT_SIZE
            )));
        }

        let seq = self
            .store
            .inner
            .log
            .next_sequence(self.txn.as_mut(), self.last_seq)
            .await?;
        let entry = SequenceEntry::succeeding(seq, &stored, rev.clone(), previous);
        self.store.inner.log.append(self.txn.as_mut(), &entry).await?;
        self.txn
            .put(&self.store.inner.documents, stored.id.as_bytes(), &value)
            .await?;

        debug!(
            store = %self.store.inner.name,
            id = %stored.id,
            rev = %rev,
            seq,
            foreign = !options.new_edits,
            "Staged write"
        );

        self.last_seq = seq;
        self.staged.insert(
            stored.id.clone(),
            IndexEntry {
                seq,
                deleted: stored.deleted,
            },
        );
        let result = WriteResult {
            id: stored.id.clone(),
            rev,
            seq,
        };
        self.changes.push(ChangeRecord {
            id: entry.id,
            seq,
            rev: entry.rev,
            deleted: entry.deleted,
            history: entry.history,
            doc: Some(stored),
        });
        Ok(result)
    }

    async fn previous(&mut self, id: &str, seq: u64) -> Result<Option<(SequenceEntry, Document)>> {
        let entry = self.store.inner.log.read_in(self.txn.as_mut(), seq).await?;
        let doc = match self.txn.get(&self.store.inner.documents, id.as_bytes()).await? {
            Some(bytes) => Some(decode_document(&bytes)?),
            None => None,
        };

        match (entry, doc) {
            (Some(entry), Some(doc)) => Ok(Some((entry, doc))),
            _ => {
                warn!(
                    store = %self.store.inner.name,
                    id = %id,
                    seq,
                    "Index points at a missing entry; treating write as a creation"
                );
                Ok(None)
            }
        }
    }

    /// Number of staged writes
    pub(crate) fn len(&self) -> usize {
        self.changes.len()
    }

    /// Commit, then update the index, then notify listeners
    pub(crate) async fn commit(mut self) -> Result<()> {
        self.txn.commit().await?;

        {
            let mut index = self.store.inner.index.write();
            for (id, entry) in self.staged.drain() {
                index.docs.insert(id, entry);
            }
            index.seq = index.seq.max(self.last_seq);
        }

        for record in &self.changes {
            self.store.inner.listeners.publish(record);
        }
        Ok(())
    }

    pub(crate) async fn abort(mut self) {
        if let Err(e) = self.txn.abort().await {
            warn!(store = %self.store.inner.name, error = %e, "Failed to abort write batch");
        }
    }
}
