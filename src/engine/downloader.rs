// Download dispatcher — classifies URLs as local, cached or remote and drives fetch → read → register.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{now_ms, CacheIndex};
use super::stats::{StatsCollector, StatsSnapshot};
use super::throttle::{LoadContext, Throttle};
use crate::config::EngineConfig;
use crate::error::AssetError;
use crate::pipeline::options::{RequestOptions, CACHE_BUNDLE_ROOT};
use crate::source::traits::{ProgressCallback, RemoteFetcher};

/// URLs of the form `scheme://...` are fetched remotely and cached; anything else is local.
static REMOTE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\w+://.*").expect("invalid remote url regex"));

pub fn is_remote_url(url: &str) -> bool {
    REMOTE_URL.is_match(url)
}

/// Extension of the last path segment including the dot, ignoring any query string.
pub fn extname(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    match name.rfind('.') {
        Some(dot) => &name[dot..],
        None => "",
    }
}

/// Where a requested URL will be read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Local(PathBuf),
    Cached(PathBuf),
    Remote,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Skip the cache and fetch again.
    pub reload: bool,
    /// Bundle subfolder for the downloaded file.
    pub cache_bundle_root: Option<String>,
    pub headers: HashMap<String, String>,
    pub context: LoadContext,
    /// Bundle version, used by bundle loads only.
    pub version: Option<String>,
}

impl DownloadOptions {
    /// Read `reload`, `header`, `preset`, `version` and the cache bundle root from request options.
    pub fn from_request_options(options: &RequestOptions) -> Self {
        let headers = match options.get("header") {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect(),
            _ => HashMap::new(),
        };
        Self {
            reload: options.get_bool("reload"),
            cache_bundle_root: options.get_str(CACHE_BUNDLE_ROOT).map(str::to_string),
            headers,
            context: options
                .get_str("preset")
                .and_then(LoadContext::from_name)
                .unwrap_or_default(),
            version: options.get_str("version").map(str::to_string),
        }
    }
}

/// Resume state for a URL whose last download failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub retry_count: u32,
    /// Relative destination reserved by the first failed attempt.
    pub storage_path: String,
}

pub struct Dispatcher {
    cache: CacheIndex,
    fetcher: Arc<dyn RemoteFetcher>,
    throttle: Throttle,
    stats: Arc<StatsCollector>,
    failures: Mutex<HashMap<String, FailureRecord>>,
    loaded_scripts: Mutex<HashMap<String, PathBuf>>,
    pub(super) remote_bundles: HashSet<String>,
    pub(super) server_root: String,
    pub(super) bundle_versions: HashMap<String, String>,
    suffix: AtomicU64,
    max_retry_count: u32,
    shutdown_token: CancellationToken,
}

impl Dispatcher {
    pub fn new(cache: CacheIndex, fetcher: Arc<dyn RemoteFetcher>, config: &EngineConfig) -> Self {
        Self {
            cache,
            fetcher,
            throttle: Throttle::new(&config.throttle),
            stats: Arc::new(StatsCollector::new()),
            failures: Mutex::new(HashMap::new()),
            loaded_scripts: Mutex::new(HashMap::new()),
            remote_bundles: config.remote_bundles.iter().cloned().collect(),
            server_root: config.server_root(),
            bundle_versions: config.bundle_versions.clone(),
            suffix: AtomicU64::new(0),
            max_retry_count: config.max_retry_count,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn cache(&self) -> &CacheIndex {
        &self.cache
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn failure_record(&self, url: &str) -> Option<FailureRecord> {
        self.failures.lock().get(url).cloned()
    }

    /// Stop starting remote fetches; throttled waiters resolve to `AssetError::Shutdown`.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    pub fn classify(&self, url: &str, options: &DownloadOptions) -> Classification {
        if !is_remote_url(url) {
            return Classification::Local(PathBuf::from(url));
        }
        if options.reload {
            return Classification::Remote;
        }
        match self.cache.get_cached_path(url) {
            Some(path) => Classification::Cached(path),
            None => Classification::Remote,
        }
    }

    /// Resolve `url` to a readable file and run `read` on it.
    ///
    /// Local paths are read as they are. Cached copies are read and dropped from the
    /// cache if `read` rejects them. Remote URLs are downloaded into the cache and only
    /// registered once `read` accepted the downloaded file.
    pub async fn dispatch<T, F, Fut>(
        &self,
        url: &str,
        options: &DownloadOptions,
        on_progress: Option<ProgressCallback>,
        read: F,
    ) -> Result<T, AssetError>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.classify(url, options) {
            Classification::Local(path) => {
                self.stats.record_local();
                read(path.clone())
                    .await
                    .map_err(|source| AssetError::Read { path, source })
            }
            Classification::Cached(path) => {
                self.stats.record_cache_hit();
                debug!("cache hit {} -> {:?}", url, path);
                match read(path.clone()).await {
                    Ok(value) => Ok(value),
                    Err(source) => {
                        warn!("cached copy of {} unreadable, dropping it: {:#}", url, source);
                        self.cache.remove_entry(url);
                        Err(AssetError::Read { path, source })
                    }
                }
            }
            Classification::Remote => self.download(url, options, on_progress, read).await,
        }
    }

    async fn download<T, F, Fut>(
        &self,
        url: &str,
        options: &DownloadOptions,
        on_progress: Option<ProgressCallback>,
        read: F,
    ) -> Result<T, AssetError>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let storage_path = self.reserve_storage_path(url, options);
        let destination = self.cache.cache_root().join(&storage_path);

        let fetched = {
            let _permit = self
                .throttle
                .acquire(options.context, &self.shutdown_token)
                .await?;
            debug!("downloading {} -> {:?}", url, destination);

            self.stats.increment_workers();
            let result = self
                .fetcher
                .fetch(url, &destination, &options.headers, on_progress)
                .await;
            self.stats.decrement_workers();
            result
        };

        let path = match fetched {
            Ok(path) => path,
            Err(source) => {
                self.stats.record_download_result(false);
                self.record_failure(url, &storage_path);
                return Err(AssetError::Fetch {
                    url: url.to_string(),
                    source,
                });
            }
        };

        self.failures.lock().remove(url);
        self.stats.record_download_result(true);
        match self.cache.storage().file_size(&path) {
            Ok(size) => self.stats.record_downloaded(size),
            Err(e) => debug!("size of {:?} unknown: {:#}", path, e),
        }

        // A file that downloads but does not read stays on disk unregistered. Eviction
        // only walks indexed entries, so only `clear` reclaims it.
        let value = read(path.clone())
            .await
            .map_err(|source| AssetError::Read { path, source })?;
        self.cache
            .record_entry(url, &storage_path, options.cache_bundle_root.as_deref());
        Ok(value)
    }

    /// Destination for a download, relative to the cache root.
    ///
    /// A URL with a pending failure reuses its earlier slot so a partial file can resume.
    fn reserve_storage_path(&self, url: &str, options: &DownloadOptions) -> String {
        if let Some(record) = self.failures.lock().get(url) {
            debug!(
                "resuming {} into {} (retry {})",
                url, record.storage_path, record.retry_count
            );
            return record.storage_path.clone();
        }

        let file_name = format!(
            "{}{}{}",
            now_ms(),
            self.suffix.fetch_add(1, Ordering::Relaxed),
            extname(url)
        );
        match &options.cache_bundle_root {
            Some(bundle) => format!("{}/{}", bundle, file_name),
            None => file_name,
        }
    }

    fn record_failure(&self, url: &str, storage_path: &str) {
        let mut failures = self.failures.lock();
        let retry_count = match failures.get_mut(url) {
            Some(record) => {
                record.retry_count += 1;
                record.retry_count
            }
            None => {
                failures.insert(
                    url.to_string(),
                    FailureRecord {
                        retry_count: 1,
                        storage_path: storage_path.to_string(),
                    },
                );
                1
            }
        };

        if retry_count >= self.max_retry_count {
            failures.remove(url);
            info!(
                "giving up resume of {} after {} failures",
                url, retry_count
            );
        } else {
            warn!("download of {} failed (attempt {})", url, retry_count);
        }
    }

    /// Fetch a file and return its local path without reading it.
    pub async fn download_file(&self, url: &str, options: &DownloadOptions) -> Result<PathBuf, AssetError> {
        self.dispatch(url, options, None, |path| async move { Ok(path) })
            .await
    }

    pub async fn download_text(&self, url: &str, options: &DownloadOptions) -> Result<String, AssetError> {
        let storage = Arc::clone(self.cache.storage());
        self.dispatch(url, options, None, |path| async move {
            storage.read_text(&path)
        })
        .await
    }

    pub async fn download_json(&self, url: &str, options: &DownloadOptions) -> Result<Value, AssetError> {
        let storage = Arc::clone(self.cache.storage());
        self.dispatch(url, options, None, |path| async move {
            storage.read_json(&path)
        })
        .await
    }

    pub async fn download_bytes(&self, url: &str, options: &DownloadOptions) -> Result<Bytes, AssetError> {
        let storage = Arc::clone(self.cache.storage());
        self.dispatch(url, options, None, |path| async move {
            storage.read_bytes(&path)
        })
        .await
    }

    /// Fetch a script once; later requests for the same URL return the first result.
    pub async fn download_script(&self, url: &str, options: &DownloadOptions) -> Result<PathBuf, AssetError> {
        let loaded = self.loaded_scripts.lock().get(url).cloned();
        if let Some(path) = loaded {
            return Ok(path);
        }
        let path = self.download_file(url, options).await?;
        self.loaded_scripts
            .lock()
            .insert(url.to_string(), path.clone());
        Ok(path)
    }

    pub(super) fn user_data_root(&self) -> PathBuf {
        self.cache.storage().user_data_root()
    }

    pub(super) fn is_under_user_data(&self, path: &str) -> bool {
        Path::new(path).starts_with(self.user_data_root())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}
