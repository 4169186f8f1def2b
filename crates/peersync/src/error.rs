//! Error types for the replication daemon.

use peersync_watch::WatchError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading configuration or driving replication.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A configuration file could not be parsed.
    #[error("failed to parse config {file:?}: {msg}")]
    ConfigParse {
        /// File that failed to parse.
        file: PathBuf,
        /// Parser message.
        msg: String,
    },

    /// A single item record is malformed.
    #[error("invalid item: {msg}")]
    InvalidItem {
        /// What is wrong with the record.
        msg: String,
    },

    /// Watch setup or read failure.
    #[error("watcher error: {0}")]
    Watcher(#[from] WatchError),

    /// A status value could not be persisted.
    #[error("persist error: {msg}")]
    Persist {
        /// Error message describing the issue.
        msg: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation refused because sync is disabled.
    #[error("sync is disabled")]
    SyncDisabled,

    /// A full sync is already running.
    #[error("full sync already in progress")]
    FullSyncInProgress,
}

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, SyncError>;
