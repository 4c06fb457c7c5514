use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Directory under the user-data root that holds every cached file.
pub const CACHE_DIR_NAME: &str = "gamecaches";

/// Name of the persisted index file inside the cache root.
pub const INDEX_FILE_NAME: &str = "cacheList.json";

/// Version tag written next to the index. Any other value on disk wipes the cache.
pub const SCHEMA_VERSION: &str = "1.1";

/// Bundle whose cached entries are never evicted.
pub const INTERNAL_BUNDLE: &str = "internal";

/// Debounce window for index persistence (2 s).
pub const WRITE_INTERVAL_MS: u64 = 2000;

/// Spacing between deferred file deletions after an eviction (500 ms).
pub const DELETE_INTERVAL_MS: u64 = 500;

/// Failed attempts after which resume state for a URL is dropped.
pub const MAX_RETRY_COUNT: u32 = 5;

/// One scheduling tick, used to bound how many downloads start at once (~60 fps).
pub const TICK_INTERVAL_MS: u64 = 16;

/// Concurrency caps for one load context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ThrottlePreset {
    /// Maximum downloads outstanding at the same time.
    pub max_concurrency: usize,
    /// Maximum downloads newly started within one tick.
    pub max_requests_per_frame: u32,
}

impl ThrottlePreset {
    pub const fn new(max_concurrency: usize, max_requests_per_frame: u32) -> Self {
        Self {
            max_concurrency,
            max_requests_per_frame,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub default: ThrottlePreset,
    pub preload: ThrottlePreset,
    pub scene: ThrottlePreset,
    pub bundle: ThrottlePreset,
    pub tick_interval_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            default: ThrottlePreset::new(30, 60),
            preload: ThrottlePreset::new(15, 30),
            scene: ThrottlePreset::new(32, 64),
            bundle: ThrottlePreset::new(32, 64),
            tick_interval_ms: TICK_INTERVAL_MS,
        }
    }
}

/// Top-level configuration for the asset engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache_dir_name: String,
    pub index_file_name: String,
    pub schema_version: String,
    pub write_interval_ms: u64,
    pub delete_interval_ms: u64,
    pub max_retry_count: u32,
    /// Bundles served from `server` rather than shipped with the application.
    pub remote_bundles: Vec<String>,
    /// Remote server root. Use [`EngineConfig::server_root`] for the normalized form.
    pub server: String,
    /// Default version per bundle name, used when a load does not name one.
    pub bundle_versions: HashMap<String, String>,
    pub throttle: ThrottleConfig,
    /// Simultaneous transfers inside the HTTP transport.
    pub downloader_max_tasks: usize,
    pub downloader_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir_name: CACHE_DIR_NAME.to_string(),
            index_file_name: INDEX_FILE_NAME.to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            write_interval_ms: WRITE_INTERVAL_MS,
            delete_interval_ms: DELETE_INTERVAL_MS,
            max_retry_count: MAX_RETRY_COUNT,
            remote_bundles: Vec::new(),
            server: String::new(),
            bundle_versions: HashMap::new(),
            throttle: ThrottleConfig::default(),
            downloader_max_tasks: 32,
            downloader_timeout_ms: 30_000,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid engine configuration")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine configuration {:?}", path))?;
        Self::from_json_str(&text)
    }

    /// Server root with a trailing `/`, or empty when no server is configured.
    pub fn server_root(&self) -> String {
        let server = self.server.trim();
        if server.is_empty() || server.ends_with('/') {
            server.to_string()
        } else {
            format!("{}/", server)
        }
    }

    pub fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms)
    }

    pub fn delete_interval(&self) -> Duration {
        Duration::from_millis(self.delete_interval_ms)
    }

    pub fn downloader_timeout(&self) -> Duration {
        Duration::from_millis(self.downloader_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.cache_dir_name, CACHE_DIR_NAME);
        assert_eq!(config.schema_version, SCHEMA_VERSION);
        assert_eq!(config.max_retry_count, 5);
        assert_eq!(config.throttle.preload, ThrottlePreset::new(15, 30));
        assert_eq!(config.throttle.scene, ThrottlePreset::new(32, 64));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{"server": "https://cdn.example.com/game", "remote_bundles": ["levels"],
                "throttle": {"preload": {"max_concurrency": 4, "max_requests_per_frame": 8}}}"#,
        )
        .unwrap();
        assert_eq!(config.server_root(), "https://cdn.example.com/game/");
        assert_eq!(config.remote_bundles, vec!["levels".to_string()]);
        assert_eq!(config.throttle.preload, ThrottlePreset::new(4, 8));
        assert_eq!(config.throttle.default, ThrottlePreset::new(30, 60));
        assert_eq!(config.write_interval_ms, WRITE_INTERVAL_MS);
    }

    #[test]
    fn test_server_root_normalization() {
        let mut config = EngineConfig::default();
        assert_eq!(config.server_root(), "");
        config.server = "http://host/".into();
        assert_eq!(config.server_root(), "http://host/");
    }
}
