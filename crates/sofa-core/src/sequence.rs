//! Sequence log
//!
//! Every committed mutation appends exactly one [`SequenceEntry`], keyed by its
//! big-endian sequence number so that key order is commit order. Entries are
//! never rewritten. An entry carries only the snapshot it directly superseded;
//! [`SequenceLog::trail`] follows those links back to the first write.

use crate::document::Document;
use crate::error::{Error, Result};
use crate::revision::Revision;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use sofa_storage::{decode_u64, encode_u64, Backend, Direction, KeyRange, Transaction};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// Entries fetched per storage round trip while scanning
pub const DEFAULT_PAGE_SIZE: usize = 128;

/// One committed mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceEntry {
    pub seq: u64,
    pub id: String,
    pub rev: Revision,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// The snapshot this entry superseded; empty for a creation
    #[serde(default)]
    pub history: Vec<HistoryItem>,
}

/// A superseded document snapshot and the sequence that wrote it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub seq: u64,
    pub doc: Document,
}

impl SequenceEntry {
    /// Entry for a write that supersedes `previous` (the entry at the id's
    /// latest sequence and the document it produced).
    pub fn succeeding(
        seq: u64,
        doc: &Document,
        rev: Revision,
        previous: Option<(SequenceEntry, Document)>,
    ) -> Self {
        let history = previous
            .map(|(prev, prev_doc)| {
                vec![HistoryItem {
                    seq: prev.seq,
                    doc: prev_doc,
                }]
            })
            .unwrap_or_default();

        Self {
            seq,
            id: doc.id.clone(),
            rev,
            deleted: doc.deleted,
            history,
        }
    }

    /// Sequence of the entry this one superseded
    pub fn superseded_seq(&self) -> Option<u64> {
        self.history.last().map(|item| item.seq)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Serialization(format!("corrupt sequence entry: {}", e)))
    }
}

/// Handle on a store's sequence collection
#[derive(Clone)]
pub struct SequenceLog {
    backend: Arc<dyn Backend>,
    collection: String,
}

impl SequenceLog {
    pub fn new(backend: Arc<dyn Backend>, collection: impl Into<String>) -> Self {
        Self {
            backend,
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Append `entry` inside the transaction that performs the document write
    pub async fn append(&self, txn: &mut dyn Transaction, entry: &SequenceEntry) -> Result<()> {
        let value = serde_json::to_vec(entry)?;
        txn.put(&self.collection, &encode_u64(entry.seq), &value).await?;
        trace!(seq = entry.seq, id = %entry.id, "Appended sequence entry");
        Ok(())
    }

    /// Read one entry as seen by `txn`
    pub async fn read_in(&self, txn: &mut dyn Transaction, seq: u64) -> Result<Option<SequenceEntry>> {
        match txn.get(&self.collection, &encode_u64(seq)).await? {
            Some(bytes) => SequenceEntry::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Read one committed entry
    pub async fn read(&self, seq: u64) -> Result<Option<SequenceEntry>> {
        match self.backend.get(&self.collection, &encode_u64(seq)).await? {
            Some(bytes) => SequenceEntry::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Every snapshot superseded up to and including `seq`, oldest first
    pub async fn trail(&self, seq: u64) -> Result<Vec<HistoryItem>> {
        let mut trail = Vec::new();
        let mut next = self.read(seq).await?;
        while let Some(entry) = next {
            let Some(item) = entry.history.into_iter().last() else {
                break;
            };
            next = self.read(item.seq).await?;
            trail.push(item);
        }
        trail.reverse();
        Ok(trail)
    }

    /// First free sequence number visible to `txn`.
    ///
    /// `known` is the highest sequence the caller already accounts for; only
    /// the tail beyond it is scanned.
    pub async fn next_sequence(&self, txn: &mut dyn Transaction, known: u64) -> Result<u64> {
        let tail = txn
            .scan(
                &self.collection,
                &KeyRange::after(encode_u64(known)),
                Direction::Reverse,
                1,
            )
            .await?;

        match tail.first() {
            Some((key, _)) => Ok(decode_u64(key)? + 1),
            None => Ok(known + 1),
        }
    }

    /// Lazy scan starting at `from`.
    ///
    /// Ascending yields `seq >= from`; descending yields `seq <= from`, newest
    /// first.
    pub fn scan_from(&self, from: u64, descending: bool) -> SequenceCursor {
        let (range, direction) = if descending {
            (KeyRange::up_to(encode_u64(from)), Direction::Reverse)
        } else {
            (KeyRange::starting_at(encode_u64(from)), Direction::Forward)
        };
        SequenceCursor::new(self.backend.clone(), self.collection.clone(), range, direction)
    }
}

/// Paged, restartable cursor over committed sequence entries.
///
/// Each page is a fresh range scan resumed after the last key seen, so a
/// cursor never pins a storage transaction and observes entries committed
/// after it was created.
pub struct SequenceCursor {
    backend: Arc<dyn Backend>,
    collection: String,
    range: KeyRange,
    direction: Direction,
    page_size: usize,
    buffer: VecDeque<SequenceEntry>,
    exhausted: bool,
}

impl SequenceCursor {
    fn new(
        backend: Arc<dyn Backend>,
        collection: String,
        range: KeyRange,
        direction: Direction,
    ) -> Self {
        Self {
            backend,
            collection,
            range,
            direction,
            page_size: DEFAULT_PAGE_SIZE,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Next entry, or `None` once the range is exhausted
    pub async fn next(&mut self) -> Result<Option<SequenceEntry>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }
        Ok(self.buffer.pop_front())
    }

    async fn fill(&mut self) -> Result<()> {
        if self.range.is_empty() {
            self.exhausted = true;
            return Ok(());
        }

        let page = match self
            .backend
            .scan(&self.collection, &self.range, self.direction, self.page_size)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.exhausted = true;
                return Err(e.into());
            }
        };

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some((last, _)) = page.last() {
            self.range = self.range.resume_after(last, self.direction);
        }

        for (_, value) in page {
            self.buffer.push_back(SequenceEntry::decode(&value)?);
        }
        Ok(())
    }

    /// Drain the cursor
    pub async fn collect(mut self) -> Result<Vec<SequenceEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next().await? {
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<SequenceEntry>> + Send {
        stream::unfold(self, |mut cursor| async move {
            match cursor.next().await {
                Ok(Some(entry)) => Some((Ok(entry), cursor)),
                Ok(None) => None,
                Err(e) => Some((Err(e), cursor)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use sofa_storage::MemoryBackend;

    fn doc(id: &str) -> Document {
        Document::new(id, Default::default())
    }

    async fn log_with(n: u64) -> SequenceLog {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        backend.create_collection("s/sequence").await.unwrap();
        let log = SequenceLog::new(backend.clone(), "s/sequence");

        let mut txn = backend.begin().await.unwrap();
        for seq in 1..=n {
            let rev = Revision::new(1, format!("h{}", seq)).unwrap();
            let entry = SequenceEntry::succeeding(seq, &doc(&format!("d{}", seq)), rev, None);
            log.append(txn.as_mut(), &entry).await.unwrap();
        }
        txn.commit().await.unwrap();
        log
    }

    #[tokio::test]
    async fn test_next_sequence() {
        let log = log_with(0).await;
        let backend = log.backend.clone();

        let mut txn = backend.begin().await.unwrap();
        assert_eq!(log.next_sequence(txn.as_mut(), 0).await.unwrap(), 1);

        let rev = Revision::new(1, "x").unwrap();
        log.append(txn.as_mut(), &SequenceEntry::succeeding(1, &doc("a"), rev.clone(), None))
            .await
            .unwrap();
        log.append(txn.as_mut(), &SequenceEntry::succeeding(2, &doc("b"), rev, None))
            .await
            .unwrap();

        // Staged entries beyond the caller's knowledge are still seen
        assert_eq!(log.next_sequence(txn.as_mut(), 0).await.unwrap(), 3);
        assert_eq!(log.next_sequence(txn.as_mut(), 2).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_scan_ascending_across_pages() {
        let log = log_with(10).await;

        let entries = log.scan_from(4, false).with_page_size(3).collect().await.unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (4..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_scan_descending() {
        let log = log_with(5).await;

        let entries = log.scan_from(3, true).with_page_size(2).collect().await.unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_scan_out_of_range_is_empty() {
        let log = log_with(3).await;
        assert!(log.scan_from(99, false).collect().await.unwrap().is_empty());
        assert!(log.scan_from(0, true).collect().await.unwrap().is_empty());

        let empty = log_with(0).await;
        assert!(empty.scan_from(0, false).collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream() {
        let log = log_with(4).await;
        let ids: Vec<String> = log
            .scan_from(0, false)
            .into_stream()
            .map(|e| e.unwrap().id)
            .collect()
            .await;
        assert_eq!(ids, vec!["d1", "d2", "d3", "d4"]);
    }

    #[test]
    fn test_entry_links_only_its_predecessor() {
        let r1 = Revision::new(1, "a").unwrap();
        let r2 = Revision::new(2, "b").unwrap();
        let r3 = Revision::new(3, "c").unwrap();

        let first = SequenceEntry::succeeding(1, &doc("x"), r1.clone(), None);
        let snap1 = doc("x").with_rev(r1);
        let second = SequenceEntry::succeeding(4, &doc("x"), r2.clone(), Some((first, snap1)));
        assert_eq!(second.history.len(), 1);
        assert_eq!(second.history[0].seq, 1);

        let snap2 = doc("x").with_rev(r2);
        let third = SequenceEntry::succeeding(7, &doc("x"), r3, Some((second, snap2)));
        assert_eq!(third.history.len(), 1);
        assert_eq!(third.superseded_seq(), Some(4));
    }
}
