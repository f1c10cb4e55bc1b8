//! Sofa Daemon (sofad)
//!
//! Serves one document store over the TCP line protocol and the HTTP API.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (TCP on 6380, HTTP on 5984, in-memory)
//! sofad
//!
//! # Custom ports
//! sofad --tcp-port 7000 --http-port 7001
//!
//! # With persistence
//! sofad --db /var/lib/sofa/sofa.db
//!
//! # With configuration file
//! sofad --config /etc/sofa/sofa.toml
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sofa_core::Store;
use sofa_storage::{Backend, MemoryBackend, SqliteBackend};
use sofa_transport::{HttpServer, Metrics, ReplicationRegistry, TcpServer};

use crate::config::{BackendKind, Config};

/// Sofa Daemon - revisioned document store
#[derive(Parser, Debug)]
#[command(name = "sofad")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(long, env = "SOFA_TCP_PORT")]
    tcp_port: Option<u16>,

    /// HTTP port to listen on
    #[arg(long, env = "SOFA_HTTP_PORT")]
    http_port: Option<u16>,

    /// Bind address
    #[arg(long, env = "SOFA_BIND")]
    bind: Option<String>,

    /// Configuration file path
    #[arg(short, long, env = "SOFA_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "SOFA_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Disable TCP server
    #[arg(long)]
    no_tcp: bool,

    /// Disable HTTP server
    #[arg(long)]
    no_http: bool,

    /// SQLite database path for persistence (default: in-memory only)
    #[arg(long, env = "SOFA_DB")]
    db: Option<PathBuf>,

    /// Store name
    #[arg(long, env = "SOFA_NAME")]
    name: Option<String>,
}

impl Args {
    /// Flags override values from the file
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.tcp_port {
            config.server.tcp_port = port;
        }
        if let Some(port) = self.http_port {
            config.server.http_port = port;
        }
        if let Some(ref bind) = self.bind {
            config.server.bind = bind.clone();
        }
        if self.no_tcp {
            config.server.tcp = false;
        }
        if self.no_http {
            config.server.http = false;
        }
        if let Some(ref db) = self.db {
            config.storage.backend = BackendKind::Sqlite;
            config.storage.path = Some(db.clone());
        }
        if let Some(ref name) = self.name {
            config.storage.name = name.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);

    // Print banner
    print_banner();

    let backend = open_backend(&config)?;
    let store = Store::open(backend, config.storage.name.clone())
        .await
        .context("Failed to open store")?;
    let info = store.info();
    info!(
        name = %info.name,
        docs = info.doc_count,
        update_seq = info.update_seq,
        "Store opened"
    );

    let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);
    metrics.set_store_info(&info);
    let replications = Arc::new(
        ReplicationRegistry::new(
            config.replication.poll_interval(),
            config.replication.timeout(),
        )
        .with_metrics(metrics.clone()),
    );

    info!(
        tcp_port = config.server.tcp_port,
        http_port = config.server.http_port,
        bind = %config.server.bind,
        "Starting sofa daemon"
    );

    // Start servers
    let mut handles = Vec::new();

    if config.server.tcp {
        let tcp_addr: SocketAddr =
            format!("{}:{}", config.server.bind, config.server.tcp_port).parse()?;
        let tcp_server = TcpServer::new(store.clone(), replications.clone(), tcp_addr)
            .with_metrics(metrics.clone());
        handles.push(tokio::spawn(async move {
            if let Err(e) = tcp_server.run().await {
                error!(error = %e, "TCP server error");
            }
        }));
    }

    if config.server.http {
        let http_addr: SocketAddr =
            format!("{}:{}", config.server.bind, config.server.http_port).parse()?;
        let http_server = HttpServer::new(store.clone(), replications.clone(), http_addr)
            .with_metrics(metrics.clone());
        handles.push(tokio::spawn(async move {
            if let Err(e) = http_server.run().await {
                error!(error = %e, "HTTP server error");
            }
        }));
    }

    if handles.is_empty() {
        anyhow::bail!("At least one transport must be enabled");
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    replications.shutdown().await;
    for handle in handles {
        handle.abort();
    }

    Ok(())
}

fn open_backend(config: &Config) -> Result<Arc<dyn Backend>> {
    match config.storage.backend {
        BackendKind::Memory => {
            info!("Running in-memory only (no --db specified)");
            Ok(Arc::new(MemoryBackend::new()))
        }
        BackendKind::Sqlite => {
            let path = config
                .storage
                .path
                .as_ref()
                .context("storage.path is required for the sqlite backend")?;
            info!(path = %path.display(), "Initializing SQLite persistence");
            let backend = SqliteBackend::new(path)
                .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
            Ok(Arc::new(backend))
        }
    }
}

fn print_banner() {
    println!(
        r#"
  ╔═╗╔═╗╔═╗╔═╗
  ╚═╗║ ║╠╣ ╠═╣
  ╚═╝╚═╝╚  ╩ ╩
  Revisioned document store
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
