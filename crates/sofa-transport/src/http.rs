//! HTTP API
//!
//! A CouchDB-flavoured JSON surface over one store. `GET /_changes` with
//! `style=all_docs&include_docs=true` is the feed read by
//! [`crate::remote::HttpChangeSource`], so one sofa node can pull from another.
//!
//! | Route                    | Operation                          |
//! |--------------------------|------------------------------------|
//! | `GET /`                  | store info                         |
//! | `GET /_changes`          | one-shot change feed               |
//! | `GET /_all_docs`         | primary-key range query            |
//! | `POST /_bulk_docs`       | bulk write                         |
//! | `POST /_replicate`       | pull replication                   |
//! | `DELETE /_replicate/:id` | stop a continuous replication      |
//! | `GET/PUT/DELETE /:id`    | single document                    |
//! | `GET /metrics`           | Prometheus text format             |

use crate::error::TransportError;
use crate::handler::{error_json, write_json};
use crate::metrics::Metrics;
use crate::registry::{ReplicationOutcome, ReplicationRegistry};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::TryStreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use sofa_core::{AllDocsOptions, Document, Error, Options, Revision, Store};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Shared state of every HTTP handler
#[derive(Clone)]
pub struct AppState {
    store: Store,
    replications: Arc<ReplicationRegistry>,
    metrics: Option<Arc<Metrics>>,
}

impl AppState {
    fn observe(&self, command: &str, started: Instant) {
        if let Some(ref metrics) = self.metrics {
            metrics.record_command(command, started.elapsed().as_secs_f64());
        }
    }
}

/// Core error rendered as `{"error": kind, "reason": message}`
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::MalformedRevision(_) | Error::InvalidDocument(_) | Error::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Transport(_) => StatusCode::BAD_GATEWAY,
            Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": self.0.kind(),
            "reason": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// HTTP server for one store
pub struct HttpServer {
    state: AppState,
    addr: SocketAddr,
}

impl HttpServer {
    pub fn new(store: Store, replications: Arc<ReplicationRegistry>, addr: SocketAddr) -> Self {
        Self {
            state: AppState {
                store,
                replications,
                metrics: None,
            },
            addr,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.state.metrics = Some(metrics);
        self
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Start the HTTP server
    pub async fn run(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Sofa HTTP server listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(info))
        .route("/_changes", get(changes))
        .route("/_all_docs", get(all_docs))
        .route("/_bulk_docs", post(bulk_docs))
        .route("/_replicate", post(replicate))
        .route("/_replicate/:id", delete(unreplicate))
        .route("/metrics", get(metrics))
        .route("/:id", get(get_doc).put(put_doc).delete(delete_doc))
        .with_state(state)
}

async fn info(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let info = state.store.info();
    let stats = state.store.storage_stats().await?;
    Ok(Json(json!({
        "db_name": info.name,
        "doc_count": info.doc_count,
        "doc_del_count": info.deleted_count,
        "update_seq": info.update_seq,
        "version": env!("CARGO_PKG_VERSION"),
        "replications": state.replications.list(),
        "storage": {
            "collections": stats.collection_count,
            "entries": stats.entry_count,
            "size_bytes": stats.total_size_bytes,
        },
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChangesParams {
    since: u64,
    style: Option<String>,
    include_docs: bool,
    limit: Option<usize>,
}

async fn changes(
    State(state): State<AppState>,
    Query(params): Query<ChangesParams>,
) -> ApiResult<Json<Value>> {
    let started = Instant::now();
    // Replication sources only want the entry that carries each id's current revision
    let leaves_only = params.style.as_deref() == Some("all_docs");
    let limit = params.limit.unwrap_or(usize::MAX);

    let mut feed = Box::pin(state.store.changes(Options::default().since(params.since)).into_stream());
    let mut results = Vec::new();
    let mut last_seq = params.since;

    while results.len() < limit {
        let Some(record) = feed.try_next().await? else {
            break;
        };
        last_seq = record.seq;
        if leaves_only && state.store.latest_seq(&record.id) != Some(record.seq) {
            continue;
        }

        let mut row = json!({
            "seq": record.seq,
            "id": record.id,
            "changes": [{"rev": record.rev}],
        });
        if record.deleted {
            row["deleted"] = json!(true);
        }
        if params.include_docs {
            row["doc"] = record.doc.as_ref().map(Document::to_json).unwrap_or(Value::Null);
        }
        results.push(row);
    }

    debug!(since = params.since, last_seq, count = results.len(), "Served changes");
    if let Some(ref metrics) = state.metrics {
        metrics.changes_delivered.inc_by(results.len() as u64);
    }
    state.observe("http_changes", started);
    Ok(Json(json!({
        "results": results,
        "last_seq": last_seq,
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AllDocsParams {
    startkey: Option<String>,
    endkey: Option<String>,
    descending: bool,
    include_deleted: bool,
    include_docs: bool,
    limit: Option<usize>,
}

async fn all_docs(
    State(state): State<AppState>,
    Query(params): Query<AllDocsParams>,
) -> ApiResult<Json<Value>> {
    let started = Instant::now();
    let options = AllDocsOptions {
        start_key: params.startkey,
        end_key: params.endkey,
        descending: params.descending,
        include_deleted: params.include_deleted,
        limit: params.limit,
    };
    let docs = state.store.all_docs(&options).await?;

    let rows: Vec<Value> = docs
        .iter()
        .map(|doc| {
            let mut row = json!({
                "id": doc.id,
                "key": doc.id,
                "value": {"rev": doc.rev},
            });
            if doc.deleted {
                row["value"]["deleted"] = json!(true);
            }
            if params.include_docs {
                row["doc"] = doc.to_json();
            }
            row
        })
        .collect();

    state.observe("http_all_docs", started);
    Ok(Json(json!({
        "total_rows": rows.len(),
        "rows": rows,
    })))
}

#[derive(Debug, Deserialize)]
struct BulkRequest {
    docs: Vec<Value>,
    #[serde(default = "default_true")]
    new_edits: bool,
    #[serde(default)]
    all_or_nothing: bool,
}

fn default_true() -> bool {
    true
}

async fn bulk_docs(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let started = Instant::now();
    let docs = request
        .docs
        .into_iter()
        .map(Document::from_json)
        .collect::<Result<Vec<_>, _>>()?;
    let options = Options {
        new_edits: request.new_edits,
        ensure_full_commit: request.all_or_nothing,
        ..Options::default()
    };

    let results = state.store.bulk(docs, options).await?;
    if let Some(ref metrics) = state.metrics {
        metrics
            .writes_total
            .inc_by(results.iter().filter(|r| r.is_ok()).count() as u64);
    }

    let body = results
        .iter()
        .map(|result| match result {
            Ok(written) => write_json(written),
            Err(e) => error_json(e),
        })
        .collect();
    state.observe("http_bulk_docs", started);
    Ok((StatusCode::CREATED, Json(Value::Array(body))))
}

#[derive(Debug, Deserialize)]
struct ReplicateRequest {
    source: String,
    #[serde(default)]
    since: u64,
    #[serde(default)]
    continuous: bool,
}

async fn replicate(
    State(state): State<AppState>,
    Json(request): Json<ReplicateRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .replications
        .replicate(&state.store, &request.source, request.since, request.continuous)
        .await?;
    Ok(Json(match outcome {
        ReplicationOutcome::Completed(summary) => json!({"ok": true, "summary": summary}),
        ReplicationOutcome::Started(id) => json!({"ok": true, "replication_id": id}),
    }))
}

async fn unreplicate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    match state.replications.cancel(&id).await? {
        Some(summary) => Ok(Json(json!({"ok": true, "summary": summary}))),
        None => Err(Error::NotFound(id).into()),
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(ref metrics) => {
            metrics.set_store_info(&state.store.info());
            metrics.export().into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_doc(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let doc = state.store.get(&id).await?;
    Ok(Json(doc.to_json()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WriteParams {
    rev: Option<String>,
    new_edits: Option<bool>,
}

async fn put_doc(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<WriteParams>,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let started = Instant::now();
    let mut doc = Document::from_json(body)?;
    doc.id = id;
    if let Some(ref rev) = params.rev {
        doc.rev = Some(Revision::parse(rev)?);
    }
    let options = Options {
        new_edits: params.new_edits.unwrap_or(true),
        ..Options::default()
    };

    let result = state.store.put(doc, options).await?;
    if let Some(ref metrics) = state.metrics {
        metrics.writes_total.inc();
    }
    state.observe("http_put", started);
    Ok((StatusCode::CREATED, Json(write_json(&result))))
}

async fn delete_doc(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<WriteParams>,
) -> ApiResult<Json<Value>> {
    let started = Instant::now();
    let rev = params.rev.ok_or_else(|| Error::Conflict {
        id: id.clone(),
        reason: "no revision given".into(),
    })?;
    let doc = Document::new(id, Default::default()).with_rev(Revision::parse(&rev)?);

    let result = state.store.remove(doc, Options::default()).await?;
    if let Some(ref metrics) = state.metrics {
        metrics.writes_total.inc();
    }
    state.observe("http_delete", started);
    Ok(Json(write_json(&result)))
}
