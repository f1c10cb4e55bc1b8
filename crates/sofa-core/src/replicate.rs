//! Pull replication
//!
//! A [`Replicator`] reads a remote change feed and installs every remote
//! revision that is newer than what the local store holds. Newer means a
//! strictly higher generation; on equal generations the local revision wins.
//! Accepted revisions are written verbatim through the foreign write path.

use crate::document::Document;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::revision::Revision;
use crate::store::{Store, WriteBatch, WriteResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Source of remote changes, in CouchDB `_changes` shape
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Changes after sequence `since`, with bodies and leaf revisions
    async fn changes_since(&self, since: u64) -> Result<RemoteChanges>;

    /// Human readable name for logs
    fn describe(&self) -> String {
        "remote".to_string()
    }
}

/// A page of remote changes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteChanges {
    #[serde(default)]
    pub results: Vec<RemoteChange>,
    #[serde(default)]
    pub last_seq: u64,
}

/// One remote change; `changes[0].rev` is the winning revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub seq: u64,
    pub id: String,
    pub changes: Vec<RevisionRef>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRef {
    pub rev: String,
}

/// A remote change that could not be applied
#[derive(Debug)]
pub struct ReplicationFailure {
    pub id: String,
    pub error: Error,
}

/// Outcome of one fetch-and-reconcile pass
#[derive(Debug, Default)]
pub struct ReplicationResult {
    /// Highest remote sequence this pass accounted for
    pub checkpoint: u64,
    pub accepted: Vec<WriteResult>,
    /// Ids whose local revision was at least as new
    pub skipped: Vec<String>,
    pub failed: Vec<ReplicationFailure>,
}

/// Totals across every pass of a started replication
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSummary {
    pub checkpoint: u64,
    pub passes: u64,
    pub accepted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ReplicationSummary {
    fn record(&mut self, result: &ReplicationResult) {
        self.checkpoint = result.checkpoint;
        self.passes += 1;
        self.accepted += result.accepted.len();
        self.skipped += result.skipped.len();
        self.failed += result.failed.len();
    }
}

/// Replication state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationState {
    Idle,
    Fetching,
    Reconciling,
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicationState::Idle => "idle",
            ReplicationState::Fetching => "fetching",
            ReplicationState::Reconciling => "reconciling",
        };
        f.write_str(name)
    }
}

/// Settings for a started replication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationOptions {
    /// Initial checkpoint
    pub since: u64,
    /// Keep polling after the first pass
    pub continuous: bool,
    /// Delay between passes in continuous mode
    pub poll_interval: Duration,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            since: 0,
            continuous: false,
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl From<Options> for ReplicationOptions {
    fn from(options: Options) -> Self {
        Self {
            since: options.since,
            continuous: options.continuous,
            ..Self::default()
        }
    }
}

/// Pulls changes from one source into one store
#[derive(Clone)]
pub struct Replicator {
    store: Store,
    source: Arc<dyn ChangeSource>,
}

impl Replicator {
    pub fn new(store: Store, source: Arc<dyn ChangeSource>) -> Self {
        Self { store, source }
    }

    /// Fetch everything after `checkpoint` and reconcile it
    pub async fn run_once(&self, checkpoint: u64) -> Result<ReplicationResult> {
        let state = Mutex::new(ReplicationState::Idle);
        let changes = self.fetch(checkpoint, &state).await?;
        self.reconcile(checkpoint, changes, &state).await
    }

    async fn fetch(&self, checkpoint: u64, state: &Mutex<ReplicationState>) -> Result<RemoteChanges> {
        *state.lock() = ReplicationState::Fetching;
        let result = self.source.changes_since(checkpoint).await;
        if result.is_err() {
            *state.lock() = ReplicationState::Idle;
        }
        result
    }

    async fn reconcile(
        &self,
        checkpoint: u64,
        changes: RemoteChanges,
        state: &Mutex<ReplicationState>,
    ) -> Result<ReplicationResult> {
        *state.lock() = ReplicationState::Reconciling;
        let outcome = self.apply(checkpoint, changes).await;
        *state.lock() = ReplicationState::Idle;
        outcome
    }

    async fn apply(&self, checkpoint: u64, changes: RemoteChanges) -> Result<ReplicationResult> {
        let mut result = ReplicationResult {
            checkpoint: checkpoint.max(changes.last_seq),
            ..Default::default()
        };
        if changes.results.is_empty() {
            return Ok(result);
        }

        let mut batch = self.store.begin_write().await?;
        for change in changes.results {
            result.checkpoint = result.checkpoint.max(change.seq);
            match reconcile_one(&mut batch, &change).await {
                Ok(Some(written)) => result.accepted.push(written),
                Ok(None) => result.skipped.push(change.id),
                Err(e) if e.is_document_error() => {
                    warn!(id = %change.id, error = %e, "Remote change rejected");
                    result.failed.push(ReplicationFailure {
                        id: change.id,
                        error: e,
                    });
                }
                Err(e) => {
                    batch.abort().await;
                    return Err(e);
                }
            }
        }
        batch.commit().await?;

        info!(
            store = %self.store.name(),
            source = %self.source.describe(),
            accepted = result.accepted.len(),
            skipped = result.skipped.len(),
            failed = result.failed.len(),
            checkpoint = result.checkpoint,
            "Replication pass complete"
        );
        Ok(result)
    }

    /// Run in the background until done (one-shot) or stopped (continuous)
    pub fn start(self, options: ReplicationOptions) -> ReplicationHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(ReplicationState::Idle));
        let checkpoint = Arc::new(AtomicU64::new(options.since));

        let task = tokio::spawn(self.drive(options, stop_rx, state.clone(), checkpoint.clone()));

        ReplicationHandle {
            stop: stop_tx,
            state,
            checkpoint,
            task,
        }
    }

    async fn drive(
        self,
        options: ReplicationOptions,
        mut stop: watch::Receiver<bool>,
        state: Arc<Mutex<ReplicationState>>,
        checkpoint: Arc<AtomicU64>,
    ) -> Result<ReplicationSummary> {
        let mut summary = ReplicationSummary {
            checkpoint: options.since,
            ..Default::default()
        };

        loop {
            if *stop.borrow() {
                break;
            }

            let since = checkpoint.load(Ordering::Acquire);
            let fetched = tokio::select! {
                fetched = self.fetch(since, &state) => fetched,
                _ = stop.changed() => {
                    *state.lock() = ReplicationState::Idle;
                    break;
                }
            };

            match fetched {
                Ok(changes) => {
                    // Writes that have started are allowed to finish
                    let result = self.reconcile(since, changes, &state).await?;
                    checkpoint.store(result.checkpoint, Ordering::Release);
                    summary.record(&result);
                }
                Err(e) if options.continuous && matches!(e, Error::Transport(_)) => {
                    warn!(source = %self.source.describe(), error = %e, "Fetch failed; retrying");
                }
                Err(e) => return Err(e),
            }

            if !options.continuous {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(options.poll_interval) => {}
                _ = stop.changed() => break,
            }
        }

        *state.lock() = ReplicationState::Idle;
        debug!(source = %self.source.describe(), checkpoint = summary.checkpoint, "Replication finished");
        Ok(summary)
    }
}

async fn reconcile_one(batch: &mut WriteBatch<'_>, change: &RemoteChange) -> Result<Option<WriteResult>> {
    let winner = change.changes.first().ok_or_else(|| {
        Error::MalformedRevision(format!("{}: change lists no revisions", change.id))
    })?;
    let rev = Revision::parse(&winner.rev)?;

    if let Some(local) = batch.current(&change.id).await? {
        if let Some(local_rev) = &local.rev {
            if *local_rev == rev {
                debug!(id = %change.id, rev = %rev, "Revision already stored");
                return Ok(None);
            }
            // A tombstone never blocks a different remote revision
            if !local.deleted && local_rev.generation() >= rev.generation() {
                debug!(id = %change.id, local = %local_rev, remote = %rev, "Local revision dominates");
                return Ok(None);
            }
        }
    }

    let doc = remote_document(change, rev)?;
    batch.stage(doc, Options::foreign()).await.map(Some)
}

fn remote_document(change: &RemoteChange, rev: Revision) -> Result<Document> {
    let mut doc = match &change.doc {
        Some(value) => Document::from_json(value.clone())?,
        None if change.deleted => Document {
            deleted: true,
            body: Map::new(),
            ..Default::default()
        },
        None => {
            return Err(Error::InvalidDocument(format!(
                "{}: change carries no document",
                change.id
            )))
        }
    };
    doc.id = change.id.clone();
    doc.rev = Some(rev);
    doc.deleted |= change.deleted;
    Ok(doc)
}

/// Control handle for a started replication. Dropping it stops the
/// replication after the current pass.
pub struct ReplicationHandle {
    stop: watch::Sender<bool>,
    state: Arc<Mutex<ReplicationState>>,
    checkpoint: Arc<AtomicU64>,
    task: JoinHandle<Result<ReplicationSummary>>,
}

impl ReplicationHandle {
    /// Suppress further passes; a pass already writing completes
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn state(&self) -> ReplicationState {
        *self.state.lock()
    }

    /// Highest remote sequence reconciled so far
    pub fn checkpoint(&self) -> u64 {
        self.checkpoint.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the replication to end
    pub async fn join(self) -> Result<ReplicationSummary> {
        self.task
            .await
            .map_err(|e| Error::Transport(format!("replication task failed: {}", e)))?
    }
}
