// In-memory storage backend. Keeps a virtual cache directory and counts physical operations.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::traits::Storage;

pub struct MemoryStorage {
    root: PathBuf,
    files: Mutex<BTreeMap<PathBuf, Bytes>>,
    dirs: Mutex<BTreeSet<PathBuf>>,
    deleted: Mutex<Vec<PathBuf>>,
    async_writes: AtomicUsize,
    sync_writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new(user_data_root: impl Into<PathBuf>) -> Self {
        Self {
            root: user_data_root.into(),
            files: Mutex::new(BTreeMap::new()),
            dirs: Mutex::new(BTreeSet::new()),
            deleted: Mutex::new(Vec::new()),
            async_writes: AtomicUsize::new(0),
            sync_writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Place a file directly, bypassing write accounting.
    pub fn insert_file(&self, path: impl Into<PathBuf>, contents: impl Into<Bytes>) {
        self.files.lock().insert(path.into(), contents.into());
    }

    pub fn contains_file(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }

    pub fn contains_dir(&self, path: &Path) -> bool {
        self.dirs.lock().contains(path)
    }

    /// Completed asynchronous writes.
    pub fn async_write_count(&self) -> usize {
        self.async_writes.load(Ordering::SeqCst)
    }

    pub fn sync_write_count(&self) -> usize {
        self.sync_writes.load(Ordering::SeqCst)
    }

    /// Files removed through `delete_file`, in deletion order.
    pub fn deleted_files(&self) -> Vec<PathBuf> {
        self.deleted.lock().clone()
    }

    /// Make every subsequent write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn store(&self, path: &Path, contents: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("write rejected: {:?}", path));
        }
        self.files
            .lock()
            .insert(path.to_path_buf(), Bytes::copy_from_slice(contents.as_bytes()));
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn read_text(&self, path: &Path) -> Result<String> {
        let data = self.read_bytes(path)?;
        Ok(String::from_utf8(data.to_vec())?)
    }

    fn read_bytes(&self, path: &Path) -> Result<Bytes> {
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no such file: {:?}", path))
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        self.store(path, contents)?;
        self.sync_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write_file_async(&self, path: &Path, contents: String) -> Result<()> {
        self.store(path, &contents)?;
        self.async_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        match self.files.lock().remove(path) {
            Some(_) => {
                self.deleted.lock().push(path.to_path_buf());
                Ok(())
            }
            None => Err(anyhow!("no such file: {:?}", path)),
        }
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(self.read_bytes(path)?.len() as u64)
    }

    fn make_dir(&self, path: &Path, _recursive: bool) -> Result<()> {
        self.dirs.lock().insert(path.to_path_buf());
        Ok(())
    }

    fn remove_dir(&self, path: &Path, recursive: bool) -> Result<()> {
        let mut dirs = self.dirs.lock();
        let mut files = self.files.lock();
        let has_children = files.keys().any(|p| p.starts_with(path) && p != path);
        if has_children && !recursive {
            return Err(anyhow!("directory not empty: {:?}", path));
        }
        if !dirs.contains(path) && !has_children {
            return Err(anyhow!("no such directory: {:?}", path));
        }
        files.retain(|p, _| !p.starts_with(path));
        dirs.retain(|p| !p.starts_with(path));
        Ok(())
    }

    fn user_data_root(&self) -> PathBuf {
        self.root.clone()
    }
}
