use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

/// Progress report: `(loaded, total)` in bytes. Only emitted when the total is known.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Download `url` into `destination`, returning the path that now holds the content.
    ///
    /// Timeouts, aborts and non-success statuses are all reported as `Err`.
    async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        headers: &HashMap<String, String>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<PathBuf>;
}
