//! Error types for the change-detection engine.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while setting up or reading filesystem watches.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The kernel event channel could not be created.
    #[error("failed to initialize inotify: {0}")]
    Init(#[source] std::io::Error),

    /// A watch registration was rejected by the kernel.
    #[error("failed to add watch for {path:?}: {source}")]
    AddWatch {
        /// Path that could not be watched.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Neither the path nor any of its ancestors exist.
    #[error("no existing ancestor to watch for {path:?}")]
    NoExistingAncestor {
        /// Path that was requested.
        path: PathBuf,
    },

    /// The path cannot be handed to the kernel (interior NUL byte).
    #[error("invalid path {path:?}")]
    InvalidPath {
        /// Offending path.
        path: PathBuf,
    },

    /// Reading from the event channel failed.
    #[error("failed to read inotify events: {0}")]
    Read(#[source] std::io::Error),
}

/// Result alias for watch operations.
pub type Result<T> = std::result::Result<T, WatchError>;
