//! Per-call options

use serde::{Deserialize, Serialize};

/// Options accepted by every store operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    /// Derive a new revision and check the caller's; `false` installs foreign revisions verbatim
    pub new_edits: bool,
    /// Keep a change feed open after the initial scan
    pub continuous: bool,
    /// Abort a bulk write on the first per-document failure
    pub ensure_full_commit: bool,
    /// First sequence number a change feed reports
    pub since: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            new_edits: true,
            continuous: false,
            ensure_full_commit: false,
            since: 0,
        }
    }
}

impl Options {
    /// Options for writing revisions received from another node
    pub fn foreign() -> Self {
        Self {
            new_edits: false,
            ..Self::default()
        }
    }

    pub fn since(mut self, seq: u64) -> Self {
        self.since = seq;
        self
    }

    pub fn continuous(mut self) -> Self {
        self.continuous = true;
        self
    }

    pub fn full_commit(mut self) -> Self {
        self.ensure_full_commit = true;
        self
    }
}

/// Primary-key range query over the documents collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AllDocsOptions {
    /// Inclusive lower id bound
    pub start_key: Option<String>,
    /// Inclusive upper id bound
    pub end_key: Option<String>,
    pub descending: bool,
    /// Report tombstones alongside live documents
    pub include_deleted: bool,
    /// Stop after this many documents
    pub limit: Option<usize>,
}
