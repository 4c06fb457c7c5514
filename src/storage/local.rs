// Local filesystem backend: std::fs for the synchronous calls, tokio::fs for async writes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;

use super::traits::Storage;

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(user_data_root: impl Into<PathBuf>) -> Self {
        Self {
            root: user_data_root.into(),
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn read_text(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))
    }

    fn read_bytes(&self, path: &Path) -> Result<Bytes> {
        let data = fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
        Ok(Bytes::from(data))
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        fs::write(path, contents).with_context(|| format!("failed to write {:?}", path))
    }

    async fn write_file_async(&self, path: &Path, contents: String) -> Result<()> {
        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("failed to write {:?}", path))
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).with_context(|| format!("failed to delete {:?}", path))
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        let meta = fs::metadata(path).with_context(|| format!("failed to stat {:?}", path))?;
        Ok(meta.len())
    }

    fn make_dir(&self, path: &Path, recursive: bool) -> Result<()> {
        let result = if recursive {
            fs::create_dir_all(path)
        } else {
            fs::create_dir(path)
        };
        result.with_context(|| format!("failed to create directory {:?}", path))
    }

    fn remove_dir(&self, path: &Path, recursive: bool) -> Result<()> {
        let result = if recursive {
            fs::remove_dir_all(path)
        } else {
            fs::remove_dir(path)
        };
        result.with_context(|| format!("failed to remove directory {:?}", path))
    }

    fn user_data_root(&self) -> PathBuf {
        self.root.clone()
    }
}
