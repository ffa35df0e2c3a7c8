//! Error types for news-ingest
//!
//! This module provides the error taxonomy for the whole pipeline:
//! - Domain-specific error types (database, asset download, frontier)
//! - A coarse [`ErrorKind`] classification that every dispatcher consumes
//!   (retry loop, skip-and-continue, capacity halt, propagate)
//!
//! Task payloads and bookkeeping rows only ever store `error.to_string()` and
//! [`ErrorKind::as_str`], never Rust type names.

use crate::types::AssetKind;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for news-ingest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for news-ingest
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "storage.active_volume")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Asset download error
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Frontier source error
    #[error("frontier error: {0}")]
    Frontier(#[from] FrontierError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-success HTTP status for a page or document fetch
    #[error("HTTP {status} for {url}")]
    Http {
        /// Requested URL
        url: String,
        /// Response status code
        status: u16,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Article could not be parsed (missing title or body)
    #[error("parse error for {url}: {reason}")]
    Parse {
        /// Article URL
        url: String,
        /// What was missing or malformed
        reason: String,
    },

    /// Storage volume reached its warning threshold or the pause sentinel exists
    #[error("ingestion paused: {reason}")]
    StoragePaused {
        /// Why ingestion is paused
        reason: String,
    },

    /// Failed to check disk usage
    #[error("failed to check disk usage: {0}")]
    DiskSpaceCheckFailed(String),

    /// External tool execution failed (ffmpeg, video resolver)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Operation not supported (missing binary, unknown site, etc.)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Record not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Work was cancelled by a time limit or shutdown
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Asset download errors
///
/// Every variant carries the URL that was attempted so failure bookkeeping can
/// store a self-contained reason.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Server answered with a non-success status
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// Attempted URL
        url: String,
        /// Response status code
        status: u16,
    },

    /// Server answered 2xx with an empty body
    #[error("empty response body for {url}")]
    EmptyBody {
        /// Attempted URL
        url: String,
    },

    /// Transport-level failure (connect, TLS, reset, body stream)
    #[error("request to {url} failed: {reason}")]
    Transport {
        /// Attempted URL
        url: String,
        /// Underlying error text
        reason: String,
        /// Whether the failure was a timeout
        timeout: bool,
    },

    /// HLS remux failed; stderr of the transcoder is folded into `reason`
    #[error("transcode of {url} failed: {reason}")]
    Transcode {
        /// Manifest URL
        url: String,
        /// Exit status and captured stderr
        reason: String,
    },

    /// Transcoder exceeded its time budget and was killed
    #[error("transcode of {url} timed out after {seconds}s")]
    TranscodeTimeout {
        /// Manifest URL
        url: String,
        /// Configured budget in seconds
        seconds: u64,
    },

    /// Writing the asset to disk failed
    #[error("failed to write {path}: {reason}")]
    Write {
        /// Target path
        path: PathBuf,
        /// Underlying error text
        reason: String,
    },

    /// Download was not started because the unit hit its soft time limit
    #[error("download of {url} cancelled before it started")]
    Cancelled {
        /// Asset URL
        url: String,
    },

    /// An individual asset in a batch failed
    #[error("{kind} #{sequence} failed: {source}")]
    Asset {
        /// Asset kind
        kind: AssetKind,
        /// Asset sequence within the article
        sequence: u32,
        /// Underlying failure
        #[source]
        source: Box<DownloadError>,
    },
}

/// Frontier source errors
#[derive(Debug, Error)]
pub enum FrontierError {
    /// NDJSON job log does not exist
    #[error("jobs file not found: {0}")]
    MissingJobsFile(PathBuf),

    /// Root sitemap is neither a sitemap index nor a urlset
    #[error("{url} is not a sitemap (root element <{root}>)")]
    NotASitemap {
        /// Sitemap URL
        url: String,
        /// Name of the root element that was found
        root: String,
    },

    /// Malformed XML document
    #[error("invalid XML in {url}: {reason}")]
    InvalidXml {
        /// Document URL
        url: String,
        /// Parser error text
        reason: String,
    },

    /// Category definition is unusable
    #[error("invalid category {slug}: {reason}")]
    InvalidCategory {
        /// Category slug
        slug: String,
        /// What is wrong with it
        reason: String,
    },

    /// The consumer dropped its receiver
    #[error("frontier consumer closed")]
    ConsumerClosed,
}

/// Coarse classification consumed by every retry/skip/halt dispatcher
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network timeout, 5xx, lock contention: retry with backoff
    Transient,
    /// 4xx, empty body, malformed document: skip the item, no retry
    Permanent,
    /// Storage threshold reached: halt the worker gracefully
    Capacity,
    /// Article missing title or body: per-job failure
    Parse,
    /// Configuration or shutdown: propagate
    Fatal,
}

impl ErrorKind {
    /// Stable name stored in bookkeeping rows
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Capacity => "capacity",
            ErrorKind::Parse => "parse",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn status_kind(status: u16) -> ErrorKind {
    if status >= 500 || status == 408 || status == 429 {
        ErrorKind::Transient
    } else {
        ErrorKind::Permanent
    }
}

fn io_kind(e: &std::io::Error) -> ErrorKind {
    match e.kind() {
        std::io::ErrorKind::TimedOut
        | std::io::ErrorKind::ConnectionRefused
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::Interrupted => ErrorKind::Transient,
        _ => ErrorKind::Permanent,
    }
}

impl DownloadError {
    /// Classify this failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            DownloadError::HttpStatus { status, .. } => status_kind(*status),
            DownloadError::EmptyBody { .. } => ErrorKind::Permanent,
            DownloadError::Transport { .. } => ErrorKind::Transient,
            DownloadError::Transcode { .. } => ErrorKind::Permanent,
            DownloadError::TranscodeTimeout { .. } => ErrorKind::Transient,
            DownloadError::Write { .. } => ErrorKind::Permanent,
            DownloadError::Cancelled { .. } => ErrorKind::Transient,
            DownloadError::Asset { source, .. } => source.kind(),
        }
    }

    /// Wrap this failure with the asset it belongs to
    pub fn for_asset(self, kind: AssetKind, sequence: u32) -> Self {
        DownloadError::Asset {
            kind,
            sequence,
            source: Box::new(self),
        }
    }
}

impl Error {
    /// Classify this error for dispatch
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(e) => {
                if e.is_timeout() || e.is_connect() {
                    ErrorKind::Transient
                } else if let Some(status) = e.status() {
                    status_kind(status.as_u16())
                } else {
                    ErrorKind::Permanent
                }
            }
            Error::Http { status, .. } => status_kind(*status),
            Error::Io(e) => io_kind(e),
            Error::Download(e) => e.kind(),
            // SQLite busy/locked surfaces here; persistence is retried at the task level
            Error::Database(_) | Error::Sqlx(_) => ErrorKind::Transient,
            Error::Parse { .. } => ErrorKind::Parse,
            Error::StoragePaused { .. } => ErrorKind::Capacity,
            Error::ExternalTool(msg) => {
                if msg.contains("timed out") || msg.contains("timeout") {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
            Error::Cancelled(_) => ErrorKind::Transient,
            Error::Config { .. } | Error::ShuttingDown => ErrorKind::Fatal,
            Error::Frontier(FrontierError::ConsumerClosed) => ErrorKind::Fatal,
            Error::Frontier(_)
            | Error::Serialization(_)
            | Error::DiskSpaceCheckFailed(_)
            | Error::NotSupported(_)
            | Error::NotFound(_)
            | Error::Other(_) => ErrorKind::Permanent,
        }
    }

    /// Build a configuration error for a specific key
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }
}
