//! Change feed
//!
//! A feed first replays committed sequence entries after `since`, then (in
//! continuous mode) forwards records published by later commits. The listener
//! is registered before the replay starts and live records already covered by
//! the replay are dropped, so every mutation is delivered exactly once.

use crate::document::Document;
use crate::error::Result;
use crate::revision::Revision;
use crate::sequence::{HistoryItem, SequenceCursor};
use crate::store::Store;
use futures_util::stream::{self, Stream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// One mutation as reported to feed consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: String,
    pub seq: u64,
    pub rev: Revision,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default)]
    pub history: Vec<HistoryItem>,
    /// Document body at read time; `None` if it could not be found
    pub doc: Option<Document>,
}

/// Listener set owned by one store
#[derive(Default)]
pub struct ChangeListeners {
    next_id: AtomicU64,
    senders: Mutex<Vec<(u64, mpsc::UnboundedSender<ChangeRecord>)>>,
}

impl ChangeListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push((id, tx));
        debug!(listener = id, "Change listener registered");

        Subscription {
            id,
            rx,
            listeners: self.clone(),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.senders.lock().retain(|(lid, _)| *lid != id);
        debug!(listener = id, "Change listener removed");
    }

    /// Deliver a committed change to every listener, pruning closed ones
    pub fn publish(&self, record: &ChangeRecord) {
        self.senders
            .lock()
            .retain(|(_, tx)| tx.send(record.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Live registration; unregisters on drop
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ChangeRecord>,
    listeners: Arc<ChangeListeners>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ChangeRecord> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.listeners.unsubscribe(self.id);
    }
}

/// Ordered stream of change records
pub struct ChangeFeed {
    store: Store,
    replay: Option<SequenceCursor>,
    live: Option<Subscription>,
    last_seq: u64,
}

impl ChangeFeed {
    pub(crate) fn new(
        store: Store,
        replay: SequenceCursor,
        live: Option<Subscription>,
        since: u64,
    ) -> Self {
        Self {
            store,
            replay: Some(replay),
            live,
            last_seq: since,
        }
    }

    /// Next record; `None` when a one-shot feed is exhausted or the feed was cancelled
    pub async fn next(&mut self) -> Result<Option<ChangeRecord>> {
        if let Some(cursor) = self.replay.as_mut() {
            loop {
                match cursor.next().await? {
                    // The cursor is inclusive of `since`
                    Some(entry) if entry.seq <= self.last_seq => continue,
                    Some(entry) => {
                        self.last_seq = entry.seq;
                        let doc = self.store.lookup(&entry.id).await?;
                        return Ok(Some(ChangeRecord {
                            id: entry.id,
                            seq: entry.seq,
                            rev: entry.rev,
                            deleted: entry.deleted,
                            history: entry.history,
                            doc,
                        }));
                    }
                    None => break,
                }
            }
            self.replay = None;
        }

        let Some(live) = self.live.as_mut() else {
            return Ok(None);
        };

        while let Some(record) = live.recv().await {
            if record.seq <= self.last_seq {
                continue;
            }
            self.last_seq = record.seq;
            return Ok(Some(record));
        }

        self.live = None;
        Ok(None)
    }

    /// Highest sequence delivered so far (or `since` if none)
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn is_continuous(&self) -> bool {
        self.live.is_some()
    }

    /// Stop the feed and unregister its listener
    pub fn cancel(&mut self) {
        self.replay = None;
        self.live = None;
    }

    /// Drain a one-shot feed
    pub async fn collect(mut self) -> Result<Vec<ChangeRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await? {
            records.push(record);
        }
        Ok(records)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<ChangeRecord>> + Send {
        stream::unfold(self, |mut feed| async move {
            match feed.next().await {
                Ok(Some(record)) => Some((Ok(record), feed)),
                Ok(None) => None,
                Err(e) => {
                    feed.cancel();
                    Some((Err(e), feed))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64) -> ChangeRecord {
        ChangeRecord {
            id: format!("d{}", seq),
            seq,
            rev: Revision::new(1, "x").unwrap(),
            deleted: false,
            history: Vec::new(),
            doc: None,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let listeners = Arc::new(ChangeListeners::new());
        let mut a = listeners.subscribe();
        let mut b = listeners.subscribe();
        assert_eq!(listeners.len(), 2);

        listeners.publish(&record(1));
        assert_eq!(a.recv().await.unwrap().seq, 1);
        assert_eq!(b.recv().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let listeners = Arc::new(ChangeListeners::new());
        let sub = listeners.subscribe();
        assert_eq!(listeners.len(), 1);
        drop(sub);
        assert!(listeners.is_empty());

        // Publishing with nobody listening is a no-op
        listeners.publish(&record(1));
    }
}
