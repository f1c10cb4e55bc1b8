//! HTTP change source
//!
//! Reads a remote node's `_changes` feed with bodies and leaf revisions, the
//! shape served by [`crate::http`] and by CouchDB.

use crate::error::TransportError;
use async_trait::async_trait;
use reqwest::Client;
use sofa_core::{ChangeSource, Error, RemoteChanges, Result};
use std::time::Duration;
use tracing::debug;

/// Change source backed by a remote `_changes` endpoint
#[derive(Debug, Clone)]
pub struct HttpChangeSource {
    base_url: String,
    client: Client,
}

impl HttpChangeSource {
    pub fn new(url: &str, timeout: Duration) -> std::result::Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ChangeSource for HttpChangeSource {
    async fn changes_since(&self, since: u64) -> Result<RemoteChanges> {
        let url = format!(
            "{}/_changes?style=all_docs&include_docs=true&since={}",
            self.base_url, since
        );
        debug!(url = %url, "Fetching remote changes");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Error::Transport(format!(
                "Changes request failed: {}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| Error::Transport(format!("Invalid changes response: {}", e)))
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}
