use std::path::PathBuf;
use thiserror::Error;

/// Per-image metadata failures. Always recoverable: the image is excluded
/// from later stages and reported.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Missing geotag or timestamp in {path}")]
    MissingGeotagOrTimestamp { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("EXIF parsing error: {0}")]
    Exif(#[from] exif::Error),
}

/// Failures talking to the remote imagery service. Isolated per file (or per
/// session call) by the orchestrator.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upload session {key} is already closed")]
    SessionClosed { key: String },

    #[error("Malformed upload session: {message}")]
    MalformedSession { message: String },
}

/// Run-level failures. These abort the invocation before any remote call.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Processing ledger {path} is corrupt: {reason}")]
    LedgerCorrupt { path: PathBuf, reason: String },

    #[error("Missing required credentials: {}", .missing.join(", "))]
    AuthenticationMissing { missing: Vec<&'static str> },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
