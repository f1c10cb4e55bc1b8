//! Connection handler - processes commands against a store

use crate::metrics::Metrics;
use crate::registry::{ReplicationOutcome, ReplicationRegistry};
use serde_json::{json, Value};
use sofa_core::{
    AllDocsOptions, ChangeFeed, ChangeRecord, Document, Error, Options, Revision, Store,
    WriteResult,
};
use sofa_protocol::{Command, CommandKind, Parser, ProtocolError, Response};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Handles a single client connection
pub struct ConnectionHandler {
    /// Unique client ID
    pub client_id: String,
    store: Store,
    replications: Arc<ReplicationRegistry>,
    parser: Parser,
    /// Continuous feed requested by the last CHANGES CONTINUOUS, not yet taken
    pending_feed: Option<ChangeFeed>,
    metrics: Option<Arc<Metrics>>,
    closed: bool,
}

impl ConnectionHandler {
    pub fn new(client_id: String, store: Store, replications: Arc<ReplicationRegistry>) -> Self {
        Self {
            client_id,
            store,
            replications,
            parser: Parser::new(),
            pending_feed: None,
            metrics: None,
            closed: false,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Process incoming data and return responses
    pub async fn process(&mut self, data: &[u8]) -> Vec<Response> {
        let mut responses = Vec::new();

        if let Err(e) = self.parser.feed(data) {
            responses.push(Response::error("PARSE_ERROR", e.to_string()));
            return responses;
        }

        while !self.closed {
            match self.parser.parse() {
                Ok(Some(cmd)) => {
                    let response = self.handle_command(cmd).await;
                    responses.push(response);
                }
                Ok(None) => break,
                Err(e) => responses.push(e.into()),
            }
        }

        responses
    }

    /// Whether the client sent QUIT
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Continuous feed started by the last command, if any
    pub fn take_feed(&mut self) -> Option<ChangeFeed> {
        self.pending_feed.take()
    }

    /// Handle a single command
    async fn handle_command(&mut self, cmd: Command) -> Response {
        debug!(client = %self.client_id, cmd = cmd.name(), "Processing command");
        let name = cmd.name();
        let started = Instant::now();

        let response = match self.execute(cmd).await {
            Ok(response) => response,
            Err(ProtocolError::Core(Error::NotFound(_))) => Response::null(),
            Err(e) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.record_error(name, e.code());
                }
                e.into()
            }
        };

        if let Some(ref metrics) = self.metrics {
            metrics.record_command(name, started.elapsed().as_secs_f64());
            metrics.set_store_info(&self.store.info());
        }
        response
    }

    async fn execute(&mut self, cmd: Command) -> Result<Response, ProtocolError> {
        match cmd.kind {
            CommandKind::Ping => Ok(Response::pong()),
            CommandKind::Quit => {
                self.closed = true;
                Ok(Response::ok_with_message("Goodbye"))
            }
            CommandKind::Info => self.handle_info().await,
            CommandKind::Get => {
                let id = required_id(cmd.document_id)?;
                let doc = self.store.get(&id).await?;
                Ok(Response::json(doc.to_json()))
            }
            CommandKind::Put { doc } => self.handle_put(doc, Options::default()).await,
            CommandKind::PutForeign { doc } => self.handle_put(doc, Options::foreign()).await,
            CommandKind::Delete { rev } => {
                let id = required_id(cmd.document_id)?;
                let rev = Revision::parse(&rev)?;
                let doc = Document::new(id, Default::default()).with_rev(rev);
                let result = self.store.remove(doc, Options::default()).await?;
                self.record_writes(1);
                Ok(Response::json(write_json(&result)))
            }
            CommandKind::Bulk { docs, atomic } => self.handle_bulk(docs, atomic).await,
            CommandKind::Changes { since, continuous } => self.handle_changes(since, continuous).await,
            CommandKind::Keys { start, end } => {
                let options = AllDocsOptions {
                    start_key: start,
                    end_key: end,
                    ..Default::default()
                };
                let docs = self.store.all_docs(&options).await?;
                Ok(Response::array(
                    docs.into_iter()
                        .map(|doc| Response::bulk(doc.id.into_bytes()))
                        .collect(),
                ))
            }
            CommandKind::Replicate {
                url,
                since,
                continuous,
            } => {
                let outcome = self
                    .replications
                    .replicate(&self.store, &url, since, continuous)
                    .await?;
                Ok(match outcome {
                    ReplicationOutcome::Completed(summary) => Response::json(json!(summary)),
                    ReplicationOutcome::Started(id) => Response::ok_with_message(id),
                })
            }
            CommandKind::Unreplicate { replication_id } => {
                match self.replications.cancel(&replication_id).await? {
                    Some(summary) => Ok(Response::json(json!(summary))),
                    None => Ok(Response::error(
                        "NOT_FOUND",
                        format!("No replication {}", replication_id),
                    )),
                }
            }
        }
    }

    async fn handle_put(&mut self, doc: Value, options: Options) -> Result<Response, ProtocolError> {
        let doc = Document::from_json(doc)?;
        let result = self.store.put(doc, options).await?;
        self.record_writes(1);
        Ok(Response::json(write_json(&result)))
    }

    async fn handle_bulk(&mut self, docs: Vec<Value>, atomic: bool) -> Result<Response, ProtocolError> {
        let docs = docs
            .into_iter()
            .map(Document::from_json)
            .collect::<Result<Vec<_>, _>>()?;
        let options = if atomic {
            Options::default().full_commit()
        } else {
            Options::default()
        };

        let results = self.store.bulk(docs, options).await?;
        let written = results.iter().filter(|r| r.is_ok()).count();
        self.record_writes(written as u64);

        let items = results
            .iter()
            .map(|result| match result {
                Ok(written) => write_json(written),
                Err(e) => error_json(e),
            })
            .collect();
        Ok(Response::json(Value::Array(items)))
    }

    async fn handle_changes(&mut self, since: u64, continuous: bool) -> Result<Response, ProtocolError> {
        let options = Options {
            since,
            continuous,
            ..Options::default()
        };

        if continuous {
            info!(client = %self.client_id, since, "Streaming changes");
            self.pending_feed = Some(self.store.changes(options));
            return Ok(Response::ok_with_message("Streaming changes"));
        }

        let records = self.store.changes(options).collect().await?;
        if let Some(ref metrics) = self.metrics {
            metrics.changes_delivered.inc_by(records.len() as u64);
        }
        Ok(Response::array(records.iter().map(change_frame).collect()))
    }

    async fn handle_info(&self) -> Result<Response, ProtocolError> {
        let info = self.store.info();
        let stats = self.store.storage_stats().await?;
        let body = json!({
            "version": env!("CARGO_PKG_VERSION"),
            "db_name": info.name,
            "doc_count": info.doc_count,
            "doc_del_count": info.deleted_count,
            "update_seq": info.update_seq,
            "client_id": self.client_id,
            "replications": self.replications.list(),
            "storage": {
                "collections": stats.collection_count,
                "entries": stats.entry_count,
                "size_bytes": stats.total_size_bytes,
            },
        });
        Ok(Response::json(body))
    }

    fn record_writes(&self, n: u64) {
        if let Some(ref metrics) = self.metrics {
            metrics.writes_total.inc_by(n);
        }
    }
}

fn required_id(id: Option<String>) -> Result<String, ProtocolError> {
    id.ok_or_else(|| ProtocolError::MissingArgument("document_id".into()))
}

/// `{"ok": true, "id", "rev", "seq"}`
pub fn write_json(result: &WriteResult) -> Value {
    json!({
        "ok": true,
        "id": result.id,
        "rev": result.rev,
        "seq": result.seq,
    })
}

/// `{"error", "reason", "id"?}`
pub fn error_json(error: &Error) -> Value {
    let mut body = json!({
        "error": error.kind(),
        "reason": error.to_string(),
    });
    if let Error::Conflict { id, .. } = error {
        body["id"] = json!(id);
    }
    body
}

/// Change frame for one record: `#<seq> {"id", "rev", "deleted"?, "doc"}`
pub fn change_frame(record: &ChangeRecord) -> Response {
    let mut body = json!({
        "id": record.id,
        "seq": record.seq,
        "rev": record.rev,
        "doc": record.doc.as_ref().map(Document::to_json),
    });
    if record.deleted {
        body["deleted"] = json!(true);
    }
    Response::change(record.seq, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sofa_storage::MemoryBackend;

    async fn handler() -> ConnectionHandler {
        let store = Store::open(Arc::new(MemoryBackend::new()), "test").await.unwrap();
        ConnectionHandler::new("test".into(), store, Arc::new(ReplicationRegistry::default()))
    }

    async fn send(handler: &mut ConnectionHandler, line: &str) -> Response {
        let mut responses = handler.process(format!("{}\r\n", line).as_bytes()).await;
        assert_eq!(responses.len(), 1);
        responses.remove(0)
    }

    fn json_of(response: Response) -> Value {
        match response {
            Response::Json(v) => v,
            other => panic!("expected JSON, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let mut h = handler().await;

        let put = json_of(send(&mut h, r#"PUT {"_id": "a", "x": 1}"#).await);
        assert_eq!(put["ok"], json!(true));
        let rev = put["rev"].as_str().unwrap().to_string();
        assert!(rev.starts_with("1-"));

        let doc = json_of(send(&mut h, "GET a").await);
        assert_eq!(doc["x"], json!(1));
        assert_eq!(doc["_rev"], json!(rev));

        let stale = send(&mut h, r#"PUT {"_id": "a", "x": 2}"#).await;
        assert!(matches!(stale, Response::Error { ref code, .. } if code == "CONFLICT"));

        let del = json_of(send(&mut h, &format!("DEL a {}", rev)).await);
        assert!(del["rev"].as_str().unwrap().starts_with("2-"));
        assert_eq!(send(&mut h, "GET a").await, Response::Null);
    }

    #[tokio::test]
    async fn test_put_foreign() {
        let mut h = handler().await;
        let put = json_of(send(&mut h, r#"PUTFOREIGN {"_id": "b", "_rev": "3-abc"}"#).await);
        assert_eq!(put["rev"], json!("3-abc"));

        let bad = send(&mut h, r#"PUTFOREIGN {"_id": "c"}"#).await;
        assert!(matches!(bad, Response::Error { ref code, .. } if code == "BAD_REVISION"));
    }

    #[tokio::test]
    async fn test_bulk_reports_per_document() {
        let mut h = handler().await;
        let results = json_of(send(&mut h, r#"BULK [{"_id": "a"}, {"_id": "a"}]"#).await);
        assert_eq!(results[0]["ok"], json!(true));
        assert_eq!(results[1]["error"], json!("conflict"));

        let atomic = send(&mut h, r#"BULK ATOMIC [{"_id": "b"}, {"_id": "a"}]"#).await;
        assert!(matches!(atomic, Response::Error { ref code, .. } if code == "CONFLICT"));
        assert_eq!(send(&mut h, "GET b").await, Response::Null);
    }

    #[tokio::test]
    async fn test_changes_and_keys() {
        let mut h = handler().await;
        send(&mut h, r#"PUT {"_id": "b"}"#).await;
        send(&mut h, r#"PUT {"_id": "a"}"#).await;

        let changes = send(&mut h, "CHANGES SINCE 1").await;
        match changes {
            Response::Array(items) => {
                assert_eq!(items.len(), 1);
                assert!(matches!(items[0], Response::Change { seq: 2, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }

        let keys = send(&mut h, "KEYS").await;
        assert_eq!(
            keys,
            Response::array(vec![Response::bulk(b"a".to_vec()), Response::bulk(b"b".to_vec())])
        );
    }

    #[tokio::test]
    async fn test_continuous_changes_hands_over_feed() {
        let mut h = handler().await;
        send(&mut h, r#"PUT {"_id": "a"}"#).await;

        let ack = send(&mut h, "CHANGES CONTINUOUS").await;
        assert_eq!(ack, Response::ok_with_message("Streaming changes"));

        let mut feed = h.take_feed().unwrap();
        assert_eq!(feed.next().await.unwrap().unwrap().id, "a");
        assert!(h.take_feed().is_none());
    }

    #[tokio::test]
    async fn test_info_reports_counts() {
        let mut h = handler().await;
        send(&mut h, r#"PUT {"_id": "a"}"#).await;
        let info = json_of(send(&mut h, "INFO").await);
        assert_eq!(info["doc_count"], json!(1));
        assert_eq!(info["update_seq"], json!(1));
        assert_eq!(info["storage"]["collections"], json!(2));
    }

    #[tokio::test]
    async fn test_quit_stops_processing() {
        let mut h = handler().await;
        let responses = h.process(b"QUIT\r\nPING\r\n").await;
        assert_eq!(responses, vec![Response::ok_with_message("Goodbye")]);
        assert!(h.is_closed());
    }

    #[tokio::test]
    async fn test_parse_errors_are_reported() {
        let mut h = handler().await;
        let response = send(&mut h, "FROB x").await;
        assert!(matches!(response, Response::Error { ref code, .. } if code == "INVALID_CMD"));

        let response = send(&mut h, "UNREPLICATE rep-9").await;
        assert!(matches!(response, Response::Error { ref code, .. } if code == "NOT_FOUND"));
    }
}
