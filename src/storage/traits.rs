use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait Storage: Send + Sync {
    fn read_text(&self, path: &Path) -> Result<String>;

    fn read_bytes(&self, path: &Path) -> Result<Bytes>;

    fn read_json(&self, path: &Path) -> Result<serde_json::Value> {
        let text = self.read_text(path)?;
        serde_json::from_str(&text).with_context(|| format!("invalid json in {:?}", path))
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()>;

    async fn write_file_async(&self, path: &Path, contents: String) -> Result<()>;

    fn delete_file(&self, path: &Path) -> Result<()>;

    /// Size of a file in bytes.
    fn file_size(&self, path: &Path) -> Result<u64>;

    fn make_dir(&self, path: &Path, recursive: bool) -> Result<()>;

    fn remove_dir(&self, path: &Path, recursive: bool) -> Result<()>;

    /// Writable per-user data directory; the cache root lives beneath it.
    fn user_data_root(&self) -> PathBuf;
}
