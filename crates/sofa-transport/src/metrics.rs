//! Prometheus metrics for sofa
//!
//! Metrics are exposed in Prometheus text format at `/metrics` on the HTTP API.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use crate::error::TransportError;
use tracing::warn;

/// Sofa metrics collector
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Connection metrics
    pub connections_total: IntCounterVec,
    pub connections_active: IntGaugeVec,

    // Command metrics
    pub commands_total: IntCounterVec,
    pub commands_errors: IntCounterVec,
    pub command_duration_seconds: HistogramVec,

    // Document metrics
    pub documents_total: IntGauge,
    pub update_seq: IntGauge,
    pub writes_total: IntCounter,
    pub conflicts_total: IntCounter,

    // Data metrics
    pub bytes_received: IntCounter,
    pub bytes_sent: IntCounter,

    // Change feed metrics
    pub feeds_active: IntGauge,
    pub changes_delivered: IntCounter,

    // Replication metrics
    pub replications_active: IntGauge,
    pub replicated_docs: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, TransportError> {
        let registry = Registry::new();

        let connections_total = IntCounterVec::new(
            Opts::new("sofa_connections_total", "Total number of connections"),
            &["transport"],
        )?;
        let connections_active = IntGaugeVec::new(
            Opts::new("sofa_connections_active", "Number of active connections"),
            &["transport"],
        )?;

        let commands_total = IntCounterVec::new(
            Opts::new("sofa_commands_total", "Total number of commands processed"),
            &["command"],
        )?;
        let commands_errors = IntCounterVec::new(
            Opts::new("sofa_commands_errors_total", "Total number of command errors"),
            &["command", "error_type"],
        )?;
        let command_duration_seconds = HistogramVec::new(
            HistogramOpts::new("sofa_command_duration_seconds", "Command processing duration")
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["command"],
        )?;

        let documents_total = IntGauge::new("sofa_documents_total", "Live documents in the store")?;
        let update_seq = IntGauge::new("sofa_update_seq", "Highest committed sequence number")?;
        let writes_total = IntCounter::new("sofa_writes_total", "Accepted document writes")?;
        let conflicts_total = IntCounter::new("sofa_conflicts_total", "Writes rejected with a conflict")?;

        let bytes_received = IntCounter::new("sofa_bytes_received_total", "Total bytes received from clients")?;
        let bytes_sent = IntCounter::new("sofa_bytes_sent_total", "Total bytes sent to clients")?;

        let feeds_active = IntGauge::new("sofa_feeds_active", "Open continuous change feeds")?;
        let changes_delivered = IntCounter::new("sofa_changes_delivered_total", "Change records sent to clients")?;

        let replications_active = IntGauge::new("sofa_replications_active", "Running continuous replications")?;
        let replicated_docs = IntCounterVec::new(
            Opts::new("sofa_replicated_docs_total", "Remote changes processed by replication"),
            &["outcome"],
        )?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(commands_total.clone()))?;
        registry.register(Box::new(commands_errors.clone()))?;
        registry.register(Box::new(command_duration_seconds.clone()))?;
        registry.register(Box::new(documents_total.clone()))?;
        registry.register(Box::new(update_seq.clone()))?;
        registry.register(Box::new(writes_total.clone()))?;
        registry.register(Box::new(conflicts_total.clone()))?;
        registry.register(Box::new(bytes_received.clone()))?;
        registry.register(Box::new(bytes_sent.clone()))?;
        registry.register(Box::new(feeds_active.clone()))?;
        registry.register(Box::new(changes_delivered.clone()))?;
        registry.register(Box::new(replications_active.clone()))?;
        registry.register(Box::new(replicated_docs.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            commands_total,
            commands_errors,
            command_duration_seconds,
            documents_total,
            update_seq,
            writes_total,
            conflicts_total,
            bytes_received,
            bytes_sent,
            feeds_active,
            changes_delivered,
            replications_active,
            replicated_docs,
        })
    }

    /// Record a new connection
    pub fn record_connection(&self, transport: &str) {
        self.connections_total.with_label_values(&[transport]).inc();
        self.connections_active.with_label_values(&[transport]).inc();
    }

    /// Record a connection closed
    pub fn record_disconnection(&self, transport: &str) {
        self.connections_active.with_label_values(&[transport]).dec();
    }

    /// Record a command execution
    pub fn record_command(&self, command: &str, duration_secs: f64) {
        self.commands_total.with_label_values(&[command]).inc();
        self.command_duration_seconds
            .with_label_values(&[command])
            .observe(duration_secs);
    }

    /// Record a command error
    pub fn record_error(&self, command: &str, error_type: &str) {
        self.commands_errors
            .with_label_values(&[command, error_type])
            .inc();
        if error_type == "CONFLICT" {
            self.conflicts_total.inc();
        }
    }

    /// Update store gauges
    pub fn set_store_info(&self, info: &sofa_core::StoreInfo) {
        self.documents_total.set(info.doc_count as i64);
        self.update_seq.set(info.update_seq as i64);
    }

    /// Record bytes transferred
    pub fn record_bytes(&self, received: u64, sent: u64) {
        self.bytes_received.inc_by(received);
        self.bytes_sent.inc_by(sent);
    }

    /// Record the outcome of one replication pass
    pub fn record_replication(&self, summary: &sofa_core::ReplicationSummary) {
        self.replicated_docs
            .with_label_values(&["accepted"])
            .inc_by(summary.accepted as u64);
        self.replicated_docs
            .with_label_values(&["skipped"])
            .inc_by(summary.skipped as u64);
        self.replicated_docs
            .with_label_values(&["failed"])
            .inc_by(summary.failed as u64);
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
