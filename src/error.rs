// Error kinds surfaced by the cache, dispatcher and preprocessing pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Result of one physical index write, shared by every callback queued for it.
#[derive(Debug, Clone, Error)]
#[error("failed to persist cache index {path:?}: {message}")]
pub struct PersistError {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum AssetError {
    /// Network failure, timeout, abort or non-success status.
    #[error("{source}")]
    Fetch {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    /// The read step rejected a local, cached or freshly downloaded file.
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// Persisted index missing, unreadable or written by another schema version.
    #[error("cache index {path:?} is unusable: {reason}")]
    CacheCorruption { path: PathBuf, reason: String },

    #[error(transparent)]
    Persist(#[from] PersistError),

    /// The URL-resolution sub-pipeline failed.
    #[error("url transform failed: {0}")]
    Pipeline(#[source] anyhow::Error),

    #[error("storage operation failed: {0}")]
    Storage(#[source] anyhow::Error),

    /// Configuration rejected or a collaborator could not be built from it.
    #[error("invalid engine configuration: {0}")]
    Config(#[source] anyhow::Error),

    #[error("dispatcher has been shut down")]
    Shutdown,
}

impl AssetError {
    pub fn is_fetch(&self) -> bool {
        matches!(self, AssetError::Fetch { .. })
    }
}
