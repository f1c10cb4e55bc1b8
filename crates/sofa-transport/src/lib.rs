//! Sofa Transport Layer
//!
//! Provides network access to a sofa store:
//! - TCP: line protocol connections, including streamed change feeds
//! - HTTP: CouchDB-flavoured JSON API that also serves as a replication source
//! - Remote: HTTP client that reads another node's `_changes` feed
//! - Metrics: Prometheus metrics, exported at `/metrics`

pub mod error;
pub mod handler;
pub mod http;
pub mod metrics;
pub mod registry;
pub mod remote;
pub mod tcp;

pub use error::TransportError;
pub use handler::ConnectionHandler;
pub use http::HttpServer;
pub use metrics::Metrics;
pub use registry::ReplicationRegistry;
pub use remote::HttpChangeSource;
pub use tcp::TcpServer;
