//! Error types for the feed core.
//!
//! Only the transport handshake and the history backfill can fail. Malformed
//! frames and schema-invalid events are not errors; they are routed to the
//! opaque path by the normalizer.

/// Errors raised while opening a streaming connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Handshake timed out after {0}ms")]
    Timeout(u64),

    #[error("Connection attempt cancelled")]
    Cancelled,
}

/// Errors raised while fetching history from the audit REST API.
#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Invalid history response: {0}")]
    Decode(String),

    #[error("History cache error: {0}")]
    Cache(#[from] std::io::Error),
}
