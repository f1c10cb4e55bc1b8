//! In-memory storage backend

use crate::{Backend, Direction, KeyRange, KeyValue, StorageError, StorageStats, Transaction};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Collection = BTreeMap<Vec<u8>, Vec<u8>>;
type Collections = Arc<RwLock<HashMap<String, Collection>>>;

/// In-memory storage backend
///
/// Fast, volatile storage suitable for development, tests and caching.
/// Data is lost when the process exits.
pub struct MemoryBackend {
    collections: Collections,
    /// Held by the open read-write transaction, if any
    writer: Arc<Mutex<()>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            collections: Arc::new(RwLock::new(HashMap::new())),
            writer: Arc::new(Mutex::new(())),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn scan_collection(
    collection: &Collection,
    range: &KeyRange,
    direction: Direction,
    limit: usize,
) -> Vec<KeyValue> {
    if range.is_empty() || limit == 0 {
        return Vec::new();
    }

    let iter = collection
        .range::<[u8], _>(range.as_slices())
        .map(|(k, v)| (k.clone(), v.clone()));

    match direction {
        Direction::Forward => iter.take(limit).collect(),
        Direction::Reverse => iter.rev().take(limit).collect(),
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create_collection(&self, name: &str) -> Result<(), StorageError> {
        self.collections
            .write()
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.collections.write().remove(name).is_some())
    }

    async fn has_collection(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.collections.read().contains_key(name))
    }

    async fn get(&self, collection: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let collections = self.collections.read();
        let coll = collections
            .get(collection)
            .ok_or_else(|| StorageError::NotFound(collection.to_string()))?;
        Ok(coll.get(key).cloned())
    }

    async fn scan(
        &self,
        collection: &str,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<KeyValue>, StorageError> {
        let collections = self.collections.read();
        let coll = collections
            .get(collection)
            .ok_or_else(|| StorageError::NotFound(collection.to_string()))?;
        Ok(scan_collection(coll, range, direction, limit))
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        let guard = self.writer.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            collections: self.collections.clone(),
            writes: HashMap::new(),
            guard: Some(guard),
        }))
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let collections = self.collections.read();
        let mut stats = StorageStats {
            collection_count: collections.len(),
            ..Default::default()
        };
        for coll in collections.values() {
            stats.entry_count += coll.len();
            stats.total_size_bytes += coll.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>();
        }
        Ok(stats)
    }
}

/// Buffered read-write transaction over [`MemoryBackend`].
///
/// Writes are staged per collection (`None` marks a delete) and applied
/// under a single write lock on commit.
pub struct MemoryTransaction {
    collections: Collections,
    writes: HashMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> Result<(), StorageError> {
        match self.guard {
            Some(_) => Ok(()),
            None => Err(StorageError::TransactionClosed),
        }
    }

    fn ensure_collection(&self, name: &str) -> Result<(), StorageError> {
        if self.collections.read().contains_key(name) {
            Ok(())
        } else {
            Err(StorageError::NotFound(name.to_string()))
        }
    }

    fn read(&self, collection: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(staged) = self.writes.get(collection).and_then(|w| w.get(key)) {
            return Ok(staged.clone());
        }
        let collections = self.collections.read();
        let coll = collections
            .get(collection)
            .ok_or_else(|| StorageError::NotFound(collection.to_string()))?;
        Ok(coll.get(key).cloned())
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, collection: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.ensure_open()?;
        self.read(collection, key)
    }

    async fn put(&mut self, collection: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.ensure_collection(collection)?;
        self.writes
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    async fn delete(&mut self, collection: &str, key: &[u8]) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let existed = self.read(collection, key)?.is_some();
        self.writes
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_vec(), None);
        Ok(existed)
    }

    async fn scan(
        &mut self,
        collection: &str,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<KeyValue>, StorageError> {
        self.ensure_open()?;
        if range.is_empty() || limit == 0 {
            self.ensure_collection(collection)?;
            return Ok(Vec::new());
        }

        let staged = self.writes.get(collection);
        // Each staged key can hide at most one committed key, so over-fetch by that much.
        let extra = staged
            .map(|w| w.range::<[u8], _>(range.as_slices()).count())
            .unwrap_or(0);

        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = {
            let collections = self.collections.read();
            let coll = collections
                .get(collection)
                .ok_or_else(|| StorageError::NotFound(collection.to_string()))?;
            scan_collection(coll, range, direction, limit.saturating_add(extra))
                .into_iter()
                .collect()
        };

        if let Some(staged) = staged {
            for (key, value) in staged.range::<[u8], _>(range.as_slices()) {
                match value {
                    Some(v) => {
                        merged.insert(key.clone(), v.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }

        Ok(match direction {
            Direction::Forward => merged.into_iter().take(limit).collect(),
            Direction::Reverse => merged.into_iter().rev().take(limit).collect(),
        })
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        self.ensure_open()?;
        let writes = std::mem::take(&mut self.writes);

        {
            let mut collections = self.collections.write();
            if let Some(missing) = writes.keys().find(|name| !collections.contains_key(*name)) {
                let missing = missing.clone();
                self.guard = None;
                return Err(StorageError::NotFound(missing));
            }

            for (name, staged) in writes {
                if let Some(coll) = collections.get_mut(&name) {
                    for (key, value) in staged {
                        match value {
                            Some(v) => {
                                coll.insert(key, v);
                            }
                            None => {
                                coll.remove(&key);
                            }
                        }
                    }
                }
            }
        }

        self.guard = None;
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.writes.clear();
        self.guard = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn backend_with(name: &str) -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.create_collection(name).await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let backend = backend_with("docs").await;

        let mut txn = backend.begin().await.unwrap();
        txn.put("docs", b"a", b"1").await.unwrap();
        assert_eq!(txn.get("docs", b"a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.get("docs", b"a").await.unwrap(), None);

        txn.commit().await.unwrap();
        assert_eq!(backend.get("docs", b"a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_abort_discards_writes() {
        let backend = backend_with("docs").await;

        let mut txn = backend.begin().await.unwrap();
        txn.put("docs", b"a", b"1").await.unwrap();
        txn.abort().await.unwrap();

        assert_eq!(backend.get("docs", b"a").await.unwrap(), None);
        assert!(matches!(
            txn.put("docs", b"b", b"2").await,
            Err(StorageError::TransactionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dropped_transaction_releases_writer() {
        let backend = backend_with("docs").await;

        {
            let mut txn = backend.begin().await.unwrap();
            txn.put("docs", b"a", b"1").await.unwrap();
        }

        let next = tokio::time::timeout(Duration::from_secs(1), backend.begin()).await;
        assert!(next.is_ok());
        assert_eq!(backend.get("docs", b"a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_writers_are_serialized() {
        let backend = backend_with("docs").await;

        let _first = backend.begin().await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(50), backend.begin()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_scan_ranges_and_direction() {
        let backend = backend_with("seq").await;
        let mut txn = backend.begin().await.unwrap();
        for i in 1u64..=5 {
            txn.put("seq", &crate::encode_u64(i), b"x").await.unwrap();
        }
        txn.commit().await.unwrap();

        let forward = backend
            .scan("seq", &KeyRange::starting_at(crate::encode_u64(3)), Direction::Forward, 10)
            .await
            .unwrap();
        let keys: Vec<u64> = forward.iter().map(|(k, _)| crate::decode_u64(k).unwrap()).collect();
        assert_eq!(keys, vec![3, 4, 5]);

        let reverse = backend
            .scan("seq", &KeyRange::up_to(crate::encode_u64(3)), Direction::Reverse, 2)
            .await
            .unwrap();
        let keys: Vec<u64> = reverse.iter().map(|(k, _)| crate::decode_u64(k).unwrap()).collect();
        assert_eq!(keys, vec![3, 2]);

        let only = backend
            .scan("seq", &KeyRange::only(crate::encode_u64(4)), Direction::Forward, 10)
            .await
            .unwrap();
        assert_eq!(only.len(), 1);

        let past_end = backend
            .scan("seq", &KeyRange::after(crate::encode_u64(5)), Direction::Forward, 10)
            .await
            .unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn test_transaction_scan_sees_own_writes() {
        let backend = backend_with("docs").await;
        let mut txn = backend.begin().await.unwrap();
        txn.put("docs", b"a", b"1").await.unwrap();
        txn.put("docs", b"b", b"2").await.unwrap();
        txn.put("docs", b"c", b"3").await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = backend.begin().await.unwrap();
        txn.delete("docs", b"a").await.unwrap();
        txn.put("docs", b"d", b"4").await.unwrap();

        let rows = txn
            .scan("docs", &KeyRange::all(), Direction::Forward, 2)
            .await
            .unwrap();
        let keys: Vec<&[u8]> = rows.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"b".as_slice(), b"c".as_slice()]);

        let rows = txn
            .scan("docs", &KeyRange::all(), Direction::Reverse, 1)
            .await
            .unwrap();
        assert_eq!(rows[0].0, b"d".to_vec());
    }

    #[tokio::test]
    async fn test_missing_collection() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.get("nope", b"a").await,
            Err(StorageError::NotFound(_))
        ));

        let mut txn = backend.begin().await.unwrap();
        assert!(txn.put("nope", b"a", b"1").await.is_err());
    }

    #[tokio::test]
    async fn test_drop_collection_and_stats() {
        let backend = backend_with("docs").await;
        backend.create_collection("seq").await.unwrap();

        let mut txn = backend.begin().await.unwrap();
        txn.put("docs", b"a", b"hello").await.unwrap();
        txn.commit().await.unwrap();

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.collection_count, 2);
        assert_eq!(stats.entry_count, 1);
        assert!(stats.total_size_bytes > 0);

        assert!(backend.drop_collection("docs").await.unwrap());
        assert!(!backend.has_collection("docs").await.unwrap());
        assert!(!backend.drop_collection("docs").await.unwrap());
    }
}
