// Persistent cache index — maps source URLs to cached files, coalesces writes, evicts LRU entries.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use anyhow::anyhow;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::writer::{WriteCallback, WriteQueue};
use crate::config::{EngineConfig, INTERNAL_BUNDLE};
use crate::error::{AssetError, PersistError};
use crate::storage::traits::Storage;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One cached source URL. The URL itself is the key of the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    #[serde(rename = "bundle")]
    pub bundle_name: Option<String>,
    /// Location under the cache root, `/`-separated.
    #[serde(rename = "url")]
    pub relative_path: String,
    #[serde(rename = "lastTime")]
    pub last_access_time: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexDocument<'a> {
    schema_version: &'a str,
    files: &'a BTreeMap<String, CacheRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIndex {
    schema_version: String,
    #[serde(default)]
    files: BTreeMap<String, CacheRecord>,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub dir_name: String,
    pub index_file_name: String,
    pub schema_version: String,
    pub write_interval: Duration,
    pub delete_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for CacheSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            dir_name: config.cache_dir_name.clone(),
            index_file_name: config.index_file_name.clone(),
            schema_version: config.schema_version.clone(),
            write_interval: config.write_interval(),
            delete_interval: config.delete_interval(),
        }
    }
}

struct Inner {
    storage: Arc<dyn Storage>,
    settings: CacheSettings,
    root: PathBuf,
    index_path: PathBuf,
    records: RwLock<BTreeMap<String, CacheRecord>>,
    bundle_folders: Mutex<BTreeSet<String>>,
    writes: Mutex<WriteQueue>,
    /// Serializes physical writes so a late timer never overlaps a slow write.
    write_serial: tokio::sync::Mutex<()>,
    cleaning: AtomicBool,
    /// Runtime that runs persist timers and deferred deletions.
    runtime: Handle,
}

/// Handle to the cache index. Clones share the same state.
///
/// Must be initialized inside a tokio runtime. Timers for writes and deletions are
/// spawned on that runtime, so mutations may come from any thread afterwards.
#[derive(Clone)]
pub struct CacheIndex {
    inner: Arc<Inner>,
}

impl CacheIndex {
    /// Load the persisted index under the user-data root, or start over with an empty one.
    ///
    /// A missing, unreadable or version-mismatched index wipes the whole cache directory;
    /// the fresh empty index is written synchronously before returning.
    pub fn initialize(storage: Arc<dyn Storage>, settings: CacheSettings) -> Result<Self, AssetError> {
        let runtime = Handle::try_current().map_err(|e| {
            AssetError::Config(anyhow!("cache index needs a tokio runtime: {}", e))
        })?;
        let root = storage.user_data_root().join(&settings.dir_name);
        let index_path = root.join(&settings.index_file_name);
        let inner = Arc::new(Inner {
            storage,
            settings,
            root,
            index_path,
            records: RwLock::new(BTreeMap::new()),
            bundle_folders: Mutex::new(BTreeSet::new()),
            writes: Mutex::new(WriteQueue::default()),
            write_serial: tokio::sync::Mutex::new(()),
            cleaning: AtomicBool::new(false),
            runtime,
        });

        match inner.load_persisted() {
            Ok(files) => {
                info!(
                    "cache index loaded: {} entries from {:?}",
                    files.len(),
                    inner.index_path
                );
                *inner.records.write() = files;
            }
            Err(e) => {
                warn!("{}; resetting cache directory", e);
                inner.reset_directory()?;
            }
        }

        Ok(Self { inner })
    }

    pub fn cache_root(&self) -> &Path {
        &self.inner.root
    }

    pub fn index_path(&self) -> &Path {
        &self.inner.index_path
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    /// Absolute path of the cached copy of `url`, refreshing its access time.
    pub fn get_cached_path(&self, url: &str) -> Option<PathBuf> {
        let mut records = self.inner.records.write();
        let record = records.get_mut(url)?;
        record.last_access_time = now_ms();
        Some(self.inner.root.join(&record.relative_path))
    }

    pub fn update_last_time(&self, url: &str) -> bool {
        match self.inner.records.write().get_mut(url) {
            Some(record) => {
                record.last_access_time = now_ms();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.inner.records.read().contains_key(url)
    }

    /// Copy of the record for `url`, without touching its access time.
    pub fn record(&self, url: &str) -> Option<CacheRecord> {
        self.inner.records.read().get(url).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.read().is_empty()
    }

    /// Insert or overwrite a record stamped with the current time, then schedule a persist.
    pub fn record_entry(&self, url: &str, relative_path: &str, bundle_name: Option<&str>) {
        let record = CacheRecord {
            bundle_name: bundle_name.map(str::to_string),
            relative_path: relative_path.to_string(),
            last_access_time: now_ms(),
        };
        self.inner.records.write().insert(url.to_string(), record);
        debug!("cached {} at {}", url, relative_path);
        self.schedule_write(None);
    }

    /// Request a coalesced persist of the whole index.
    ///
    /// The first request arms a timer for `write_interval`; everything queued before
    /// the timer fires shares that one write and its result.
    pub fn schedule_write(&self, callback: Option<WriteCallback>) {
        let arm = self.inner.writes.lock().enqueue(callback);
        if arm {
            let inner = Arc::clone(&self.inner);
            self.inner.runtime.spawn(async move {
                tokio::time::sleep(inner.settings.write_interval).await;
                inner.write_scheduled().await;
            });
        }
    }

    /// Schedule a write and wait for the one that covers the current state.
    pub async fn flush(&self) -> Result<(), PersistError> {
        let (tx, rx) = oneshot::channel();
        self.schedule_write(Some(Box::new(move |result| {
            let _ = tx.send(result);
        })));
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.inner.persist_error("write task dropped")),
        }
    }

    /// Evict the least recently used third of all non-internal entries.
    ///
    /// Entries leave the index immediately. Their files are deleted one per
    /// `delete_interval`, starting only after the shrunken index was persisted.
    /// Returns the number of evicted entries; 0 when an eviction is already running.
    pub fn evict_lru(&self) -> usize {
        if self.inner.cleaning.swap(true, Ordering::AcqRel) {
            debug!("eviction already running");
            return 0;
        }

        let mut victims: Vec<(String, PathBuf)> = {
            let mut records = self.inner.records.write();
            let mut candidates: Vec<(&String, &CacheRecord)> = records
                .iter()
                .filter(|(_, r)| r.bundle_name.as_deref() != Some(INTERNAL_BUNDLE))
                .collect();
            candidates.sort_by_key(|(_, r)| r.last_access_time);
            let evict_count = candidates.len() / 3;
            let victims: Vec<(String, PathBuf)> = candidates
                .into_iter()
                .take(evict_count)
                .map(|(url, r)| (url.clone(), self.inner.root.join(&r.relative_path)))
                .collect();
            for (url, _) in &victims {
                records.remove(url);
            }
            victims
        };

        if victims.is_empty() {
            self.inner.cleaning.store(false, Ordering::Release);
            return 0;
        }

        let count = victims.len();
        info!("evicting {} least recently used cache entries", count);

        // Oldest first once popped.
        victims.reverse();
        let inner = Arc::clone(&self.inner);
        self.schedule_write(Some(Box::new(move |result| {
            if let Err(e) = result {
                warn!("{}; deleting evicted files anyway", e);
            }
            inner.delete_deferred(victims);
        })));

        count
    }

    pub fn is_evicting(&self) -> bool {
        self.inner.cleaning.load(Ordering::Acquire)
    }

    /// Forget `url` now; its file is deleted once the next write has completed.
    pub fn remove_entry(&self, url: &str) -> bool {
        let removed = self.inner.records.write().remove(url);
        let Some(record) = removed else {
            return false;
        };

        let path = self.inner.root.join(&record.relative_path);
        let storage = Arc::clone(&self.inner.storage);
        debug!("removed cache entry {} ({:?})", url, path);
        self.schedule_write(Some(Box::new(move |_| {
            if let Err(e) = storage.delete_file(&path) {
                warn!("cached file {:?} not deleted: {:#}", path, e);
            }
        })));
        true
    }

    /// Wipe the cache directory and index synchronously, then recreate known bundle folders.
    pub fn clear(&self) -> Result<(), AssetError> {
        info!("clearing cache directory {:?}", self.inner.root);
        self.inner.reset_directory()?;

        let folders: Vec<String> = self.inner.bundle_folders.lock().iter().cloned().collect();
        for name in folders {
            self.inner
                .storage
                .make_dir(&self.inner.root.join(&name), true)
                .map_err(AssetError::Storage)?;
        }
        Ok(())
    }

    /// Create `<cacheRoot>/<name>` and remember it so `clear` can restore it.
    pub fn make_bundle_folder(&self, name: &str) -> Result<(), AssetError> {
        self.inner
            .storage
            .make_dir(&self.inner.root.join(name), true)
            .map_err(AssetError::Storage)?;
        self.inner.bundle_folders.lock().insert(name.to_string());
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_last_access(&self, url: &str, time: u64) {
        if let Some(record) = self.inner.records.write().get_mut(url) {
            record.last_access_time = time;
        }
    }
}

impl Inner {
    fn load_persisted(&self) -> Result<BTreeMap<String, CacheRecord>, AssetError> {
        let corrupt = |reason: String| AssetError::CacheCorruption {
            path: self.index_path.clone(),
            reason,
        };

        let value = self
            .storage
            .read_json(&self.index_path)
            .map_err(|e| corrupt(format!("{:#}", e)))?;
        let stored: StoredIndex =
            serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;
        if stored.schema_version != self.settings.schema_version {
            return Err(corrupt(format!(
                "schema version {} does not match {}",
                stored.schema_version, self.settings.schema_version
            )));
        }
        Ok(stored.files)
    }

    fn reset_directory(&self) -> Result<(), AssetError> {
        if let Err(e) = self.storage.remove_dir(&self.root, true) {
            debug!("cache directory not removed: {:#}", e);
        }
        self.records.write().clear();
        self.storage
            .make_dir(&self.root, true)
            .map_err(AssetError::Storage)?;

        let text = self.serialize()?;
        self.storage
            .write_file(&self.index_path, &text)
            .map_err(|e| self.persist_error(format!("{:#}", e)))?;
        Ok(())
    }

    fn serialize(&self) -> Result<String, PersistError> {
        let records = self.records.read();
        let document = IndexDocument {
            schema_version: &self.settings.schema_version,
            files: &records,
        };
        serde_json::to_string(&document).map_err(|e| self.persist_error(e))
    }

    fn persist_error(&self, message: impl Display) -> PersistError {
        PersistError {
            path: self.index_path.clone(),
            message: message.to_string(),
        }
    }

    async fn write_scheduled(&self) {
        let _serial = self.write_serial.lock().await;
        let callbacks = self.writes.lock().begin();

        let result = match self.serialize() {
            Ok(text) => self
                .storage
                .write_file_async(&self.index_path, text)
                .await
                .map_err(|e| self.persist_error(format!("{:#}", e))),
            Err(e) => Err(e),
        };
        match &result {
            Ok(()) => debug!("cache index persisted ({} waiters)", callbacks.len()),
            Err(e) => warn!("{}", e),
        }

        for cb in callbacks {
            cb(result.clone());
        }
        self.writes.lock().finish();
    }

    fn delete_deferred(self: Arc<Self>, mut victims: Vec<(String, PathBuf)>) {
        let runtime = self.runtime.clone();
        runtime.spawn(async move {
            while let Some((url, path)) = victims.pop() {
                tokio::time::sleep(self.settings.delete_interval).await;
                match self.storage.delete_file(&path) {
                    Ok(()) => debug!("deleted evicted file for {}", url),
                    Err(e) => warn!("evicted file for {} not deleted: {:#}", url, e),
                }
            }
            self.cleaning.store(false, Ordering::Release);
            debug!("eviction finished");
        });
    }
}
