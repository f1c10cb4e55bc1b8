//! Running replications
//!
//! One-shot replications run to completion inside the request. Continuous ones
//! are registered under an id so that a later request can stop them.

use crate::metrics::Metrics;
use crate::remote::HttpChangeSource;
use dashmap::DashMap;
use serde::Serialize;
use sofa_core::{
    Error, ReplicationHandle, ReplicationOptions, ReplicationState, ReplicationSummary, Replicator,
    Result, Store,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Result of a replication request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// A one-shot run finished
    Completed(ReplicationSummary),
    /// A continuous run was started under this id
    Started(String),
}

/// Status line for one running replication
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationStatus {
    pub id: String,
    pub source: String,
    pub state: ReplicationState,
    pub checkpoint: u64,
}

struct Running {
    source: String,
    handle: ReplicationHandle,
}

/// Registry of continuous replications
pub struct ReplicationRegistry {
    running: DashMap<String, Running>,
    counter: AtomicU64,
    poll_interval: Duration,
    timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl ReplicationRegistry {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            running: DashMap::new(),
            counter: AtomicU64::new(0),
            poll_interval,
            timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Pull from `url` into `store`
    pub async fn replicate(
        &self,
        store: &Store,
        url: &str,
        since: u64,
        continuous: bool,
    ) -> Result<ReplicationOutcome> {
        let source = HttpChangeSource::new(url, self.timeout)
            .map_err(|e| Error::Transport(e.to_string()))?;
        let options = ReplicationOptions {
            since,
            continuous,
            poll_interval: self.poll_interval,
        };
        let handle = Replicator::new(store.clone(), Arc::new(source)).start(options);

        if !continuous {
            let summary = handle.join().await?;
            if let Some(ref metrics) = self.metrics {
                metrics.record_replication(&summary);
            }
            return Ok(ReplicationOutcome::Completed(summary));
        }

        let id = self.register(url, handle);
        info!(id = %id, source = %url, since, "Started continuous replication");
        Ok(ReplicationOutcome::Started(id))
    }

    fn register(&self, source: &str, handle: ReplicationHandle) -> String {
        let id = format!("rep-{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1);
        self.running.insert(
            id.clone(),
            Running {
                source: source.to_string(),
                handle,
            },
        );
        if let Some(ref metrics) = self.metrics {
            metrics.replications_active.inc();
        }
        id
    }

    /// Stop a continuous replication and wait for its current pass
    pub async fn cancel(&self, id: &str) -> Result<Option<ReplicationSummary>> {
        let Some((_, running)) = self.running.remove(id) else {
            return Ok(None);
        };

        running.handle.stop();
        let joined = running.handle.join().await;
        if let Some(ref metrics) = self.metrics {
            metrics.replications_active.dec();
        }

        let summary = joined?;
        info!(id = %id, checkpoint = summary.checkpoint, "Stopped replication");
        if let Some(ref metrics) = self.metrics {
            metrics.record_replication(&summary);
        }
        Ok(Some(summary))
    }

    /// Status of every continuous replication; runs that ended on their own are dropped
    pub fn list(&self) -> Vec<ReplicationStatus> {
        self.running.retain(|id, running| {
            if !running.handle.is_finished() {
                return true;
            }
            warn!(id = %id, source = %running.source, "Replication ended on its own");
            if let Some(ref metrics) = self.metrics {
                metrics.replications_active.dec();
            }
            false
        });

        let mut statuses: Vec<ReplicationStatus> = self
            .running
            .iter()
            .map(|entry| ReplicationStatus {
                id: entry.key().clone(),
                source: entry.source.clone(),
                state: entry.handle.state(),
                checkpoint: entry.handle.checkpoint(),
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Stop everything
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.cancel(&id).await {
                warn!(id = %id, error = %e, "Replication ended with an error");
            }
        }
    }
}

impl Default for ReplicationRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(30))
    }
}
