//! End-to-end behaviour of a store: revisions, the sequence log, change
//! feeds, bulk writes and replication working together.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use sofa_core::{
    ChangeSource, Document, Error, Options, RemoteChange, RemoteChanges, Replicator, Result,
    RevisionRef, Store,
};
use sofa_storage::{Backend, MemoryBackend, SqliteBackend};
use std::sync::Arc;
use std::time::Duration;

fn doc(value: Value) -> Document {
    Document::from_json(value).unwrap()
}

async fn memory_store(name: &str) -> Store {
    Store::open(Arc::new(MemoryBackend::new()), name).await.unwrap()
}

/// Serves another store's changes the way a remote `_changes` endpoint would
struct StoreSource(Store);

#[async_trait]
impl ChangeSource for StoreSource {
    async fn changes_since(&self, since: u64) -> Result<RemoteChanges> {
        let records = self.0.changes(Options::default().since(since)).collect().await?;
        let mut results = Vec::new();
        for record in records {
            // Only the latest entry of each document carries its current revision
            if self.0.latest_seq(&record.id) != Some(record.seq) {
                continue;
            }
            results.push(RemoteChange {
                seq: record.seq,
                id: record.id,
                changes: vec![RevisionRef {
                    rev: record.rev.to_string(),
                }],
                deleted: record.deleted,
                doc: record.doc.map(|d| d.to_json()),
            });
        }
        Ok(RemoteChanges {
            results,
            last_seq: self.0.update_seq(),
        })
    }
}

#[tokio::test]
async fn test_revision_scenario() {
    let store = memory_store("scenario").await;

    let first = store.put(doc(json!({"_id": "a", "x": 1})), Options::default()).await.unwrap();
    assert_eq!(first.rev.generation(), 1);
    assert!(first.rev.to_string().starts_with("1-"));

    let second = store
        .put(doc(json!({"_id": "a", "x": 2})).with_rev(first.rev.clone()), Options::default())
        .await
        .unwrap();
    assert_eq!(second.rev.generation(), 2);
    assert_ne!(second.rev.hash(), first.rev.hash());

    let stale = store
        .put(doc(json!({"_id": "a", "x": 3})).with_rev(first.rev), Options::default())
        .await;
    assert!(matches!(stale, Err(Error::Conflict { .. })));
    assert_eq!(store.update_seq(), 2);
}

#[tokio::test]
async fn test_generation_increases_by_one_per_write() {
    let store = memory_store("gen").await;
    let mut rev = store.put(doc(json!({"_id": "a", "n": 0})), Options::default()).await.unwrap().rev;

    for n in 1..10u64 {
        let next = store
            .put(doc(json!({"_id": "a", "n": n})).with_rev(rev.clone()), Options::default())
            .await
            .unwrap()
            .rev;
        assert_eq!(next.generation(), rev.generation() + 1);
        rev = next;
    }
}

#[tokio::test]
async fn test_sequence_log_is_gap_free() {
    let store = memory_store("log").await;
    let a = store.put(doc(json!({"_id": "a"})), Options::default()).await.unwrap();
    store.put(doc(json!({"_id": "b"})), Options::default()).await.unwrap();
    let _ = store.put(doc(json!({"_id": "b"})), Options::default()).await; // conflict, no entry
    store.put(doc(json!({"_id": "a"})).with_rev(a.rev), Options::default()).await.unwrap();
    store.bulk(vec![doc(json!({"_id": "c"})), doc(json!({"_id": "d"}))], Options::default()).await.unwrap();

    let seqs: Vec<u64> = store
        .sequence_log()
        .scan_from(0, false)
        .collect()
        .await
        .unwrap()
        .iter()
        .map(|e| e.seq)
        .collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_change_feed_replay() {
    let store = memory_store("feed").await;
    let a = store.put(doc(json!({"_id": "a", "v": 1})), Options::default()).await.unwrap();
    store.put(doc(json!({"_id": "b"})), Options::default()).await.unwrap();
    store
        .put(doc(json!({"_id": "a", "v": 2})).with_rev(a.rev), Options::default())
        .await
        .unwrap();

    let all = store.changes(Options::default()).collect().await.unwrap();
    let seen: Vec<(u64, &str)> = all.iter().map(|r| (r.seq, r.id.as_str())).collect();
    assert_eq!(seen, vec![(1, "a"), (2, "b"), (3, "a")]);

    // Bodies are joined at read time, not at the time of the entry
    assert_eq!(all[0].doc.as_ref().unwrap().body["v"], json!(2));
    assert_eq!(all[2].history.len(), 1);

    let since = store.update_seq();
    store.put(doc(json!({"_id": "c"})), Options::default()).await.unwrap();
    let later = store.changes(Options::default().since(since)).collect().await.unwrap();
    assert_eq!(later.len(), 1);
    assert_eq!(later[0].id, "c");
    assert!(later[0].seq > since);
}

#[tokio::test]
async fn test_continuous_feed_replays_then_follows() {
    let store = memory_store("live").await;
    store.put(doc(json!({"_id": "before"})), Options::default()).await.unwrap();

    let mut feed = store.changes(Options::default().continuous());
    assert!(feed.is_continuous());
    assert_eq!(feed.next().await.unwrap().unwrap().id, "before");

    let writer = store.clone();
    tokio::spawn(async move {
        for id in ["one", "two", "three"] {
            writer.put(doc(json!({"_id": id})), Options::default()).await.unwrap();
        }
    });

    let mut ids = Vec::new();
    for _ in 0..3 {
        let record = tokio::time::timeout(Duration::from_secs(5), feed.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        ids.push(record.id);
    }
    assert_eq!(ids, vec!["one", "two", "three"]);
    assert_eq!(feed.last_seq(), 4);

    feed.cancel();
    assert!(feed.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_continuous_feed_delivers_writes_made_during_replay_once() {
    let store = memory_store("window").await;
    for i in 0..5 {
        store.put(doc(json!({"_id": format!("d{}", i)})), Options::default()).await.unwrap();
    }

    // Registered now; these writes land both in the replay and on the listener
    let feed = store.changes(Options::default().continuous());
    store.put(doc(json!({"_id": "late"})), Options::default()).await.unwrap();

    let seqs: Vec<u64> = feed
        .into_stream()
        .take(6)
        .map(|r| r.unwrap().seq)
        .collect()
        .await;
    assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn test_dropping_feed_unregisters_listener() {
    let store = memory_store("drop").await;
    let feed = store.changes(Options::default().continuous());
    drop(feed);

    // A write after the drop must not block or fail
    store.put(doc(json!({"_id": "a"})), Options::default()).await.unwrap();
}

#[tokio::test]
async fn test_bulk_scenario() {
    let store = memory_store("bulk").await;
    let results = store
        .bulk(vec![doc(json!({"_id": "a"})), doc(json!({"_id": "a"}))], Options::default())
        .await
        .unwrap();

    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(Error::Conflict { .. })));
    assert!(store.get("a").await.is_ok());
}

#[tokio::test]
async fn test_replication_scenario() {
    let local = memory_store("local").await;
    let remote = memory_store("remote").await;

    let mut rev = remote.put(doc(json!({"_id": "b", "k": 1})), Options::default()).await.unwrap().rev;
    for k in 2..=3 {
        rev = remote
            .put(doc(json!({"_id": "b", "k": k})).with_rev(rev), Options::default())
            .await
            .unwrap()
            .rev;
    }
    assert_eq!(rev.generation(), 3);
    assert!(matches!(local.get("b").await, Err(Error::NotFound(_))));

    let replicator = Replicator::new(local.clone(), Arc::new(StoreSource(remote.clone())));
    let result = replicator.run_once(0).await.unwrap();
    assert_eq!(result.accepted.len(), 1);
    assert_eq!(result.checkpoint, 3);

    let replicated = local.get("b").await.unwrap();
    assert_eq!(replicated.rev, Some(rev));
    assert_eq!(replicated.body["k"], json!(3));
}

#[tokio::test]
async fn test_replication_is_idempotent() {
    let local = memory_store("local").await;
    let remote = memory_store("remote").await;
    for id in ["a", "b", "c"] {
        remote.put(doc(json!({"_id": id})), Options::default()).await.unwrap();
    }

    let replicator = Replicator::new(local.clone(), Arc::new(StoreSource(remote)));
    replicator.run_once(0).await.unwrap();
    let after_first = local.update_seq();
    assert_eq!(after_first, 3);

    // Same checkpoint: every change is seen again and skipped
    let again = replicator.run_once(0).await.unwrap();
    assert!(again.accepted.is_empty());
    assert_eq!(again.skipped.len(), 3);
    assert_eq!(local.update_seq(), after_first);
}

#[tokio::test]
async fn test_sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sofa.db");

    let rev = {
        let backend: Arc<dyn Backend> = Arc::new(SqliteBackend::new(&path).unwrap());
        let store = Store::open(backend, "persist").await.unwrap();
        store.put(doc(json!({"_id": "a", "x": 1})), Options::default()).await.unwrap().rev
    };

    let backend: Arc<dyn Backend> = Arc::new(SqliteBackend::new(&path).unwrap());
    let store = Store::open(backend, "persist").await.unwrap();
    assert_eq!(store.get("a").await.unwrap().rev, Some(rev));
    assert_eq!(store.changes(Options::default()).collect().await.unwrap().len(), 1);
}
