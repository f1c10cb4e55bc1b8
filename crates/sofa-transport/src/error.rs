//! Transport error types

use thiserror::Error;

/// Transport layer errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}
