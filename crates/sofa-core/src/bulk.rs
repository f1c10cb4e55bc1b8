//! Bulk writes
//!
//! All documents of a batch are staged in one transaction, in input order, so
//! later documents see the effect of earlier ones.

use crate::document::Document;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::store::{Store, WriteResult};
use tracing::{debug, warn};

impl Store {
    /// Write `docs` in one transaction.
    ///
    /// Returns one result per input document, in order. A per-document failure
    /// is recorded in place unless `options.ensure_full_commit` is set, in
    /// which case nothing is committed and the call fails with a conflict
    /// naming the offending document. Storage failures always abort the call.
    pub async fn bulk(&self, docs: Vec<Document>, options: Options) -> Result<Vec<Result<WriteResult>>> {
        let total = docs.len();
        let mut batch = self.begin_write().await?;
        let mut results = Vec::with_capacity(total);

        for doc in docs {
            let id = doc.id.clone();
            match batch.stage(doc, options).await {
                Ok(result) => results.push(Ok(result)),
                Err(e) if e.is_document_error() && !options.ensure_full_commit => {
                    debug!(store = %self.name(), id = %id, error = %e, "Bulk item rejected");
                    results.push(Err(e));
                }
                Err(e) if e.is_document_error() => {
                    warn!(store = %self.name(), id = %id, error = %e, "Aborting bulk write");
                    batch.abort().await;
                    return Err(match e {
                        conflict @ Error::Conflict { .. } => conflict,
                        other => Error::conflict(id, format!("batch aborted: {}", other)),
                    });
                }
                Err(e) => {
                    batch.abort().await;
                    return Err(e);
                }
            }
        }

        let written = batch.len();
        batch.commit().await?;
        debug!(store = %self.name(), total, written, "Bulk write committed");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sofa_storage::MemoryBackend;
    use std::sync::Arc;

    fn doc(value: serde_json::Value) -> Document {
        Document::from_json(value).unwrap()
    }

    async fn open() -> Store {
        Store::open(Arc::new(MemoryBackend::new()), "bulk").await.unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_id_without_full_commit() {
        let store = open().await;
        let results = store
            .bulk(vec![doc(json!({"_id": "a"})), doc(json!({"_id": "a"}))], Options::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        let first = results[0].as_ref().unwrap();
        assert_eq!(first.seq, 1);
        assert!(matches!(results[1], Err(Error::Conflict { .. })));

        assert_eq!(store.get("a").await.unwrap().rev, Some(first.rev.clone()));
        assert_eq!(store.update_seq(), 1);
    }

    #[tokio::test]
    async fn test_full_commit_aborts_everything() {
        let store = open().await;
        let err = store
            .bulk(
                vec![doc(json!({"_id": "a"})), doc(json!({"_id": "b"})), doc(json!({"_id": "a"}))],
                Options::default().full_commit(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Conflict { ref id, .. } if id == "a"));
        assert_eq!(store.update_seq(), 0);
        assert!(store.lookup("a").await.unwrap().is_none());
        assert!(store.lookup("b").await.unwrap().is_none());

        // The store is still writable afterwards
        store.put(doc(json!({"_id": "a"})), Options::default()).await.unwrap();
        assert_eq!(store.update_seq(), 1);
    }

    #[tokio::test]
    async fn test_full_commit_names_malformed_document() {
        let store = open().await;
        let err = store
            .bulk(vec![doc(json!({"_id": "x"}))], Options::foreign().full_commit())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { ref id, .. } if id == "x"));
    }

    #[tokio::test]
    async fn test_later_documents_see_earlier_ones() {
        let store = open().await;
        let first = store.put(doc(json!({"_id": "a", "v": 1})), Options::default()).await.unwrap();

        let results = store
            .bulk(
                vec![
                    doc(json!({"_id": "a", "v": 2})).with_rev(first.rev.clone()),
                    doc(json!({"_id": "a", "v": 3})).with_rev(first.rev),
                    doc(json!({"_id": "c"})),
                ],
                Options::default(),
            )
            .await
            .unwrap();

        assert_eq!(results[0].as_ref().unwrap().rev.generation(), 2);
        assert!(matches!(results[1], Err(Error::Conflict { .. })));
        assert_eq!(results[2].as_ref().unwrap().seq, 3);
        assert_eq!(store.get("a").await.unwrap().body["v"], json!(2));
    }

    #[tokio::test]
    async fn test_bulk_notifies_after_commit() {
        let store = open().await;
        let mut sub = store.subscribe();

        store
            .bulk(vec![doc(json!({"_id": "a"})), doc(json!({"_id": "b"}))], Options::default())
            .await
            .unwrap();

        assert_eq!(sub.recv().await.unwrap().id, "a");
        assert_eq!(sub.recv().await.unwrap().id, "b");
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let store = open().await;
        assert!(store.bulk(Vec::new(), Options::default()).await.unwrap().is_empty());
        assert_eq!(store.update_seq(), 0);
    }
}
