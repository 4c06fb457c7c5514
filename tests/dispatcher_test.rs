use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use asset_cache_engine::engine::cache::{CacheIndex, CacheSettings};
use asset_cache_engine::engine::downloader::{Classification, DownloadOptions, Dispatcher};
use asset_cache_engine::pipeline::options::{RequestOptions, CACHE_BUNDLE_ROOT};
use asset_cache_engine::pipeline::preprocess::{CacheBundleRootStage, DirectUrlResolver, TransformChain};
use asset_cache_engine::pipeline::task::RequestInput;
use asset_cache_engine::source::traits::{ProgressCallback, RemoteFetcher};
use asset_cache_engine::storage::memory::MemoryStorage;
use asset_cache_engine::{AssetEngine, AssetError, EngineConfig, LoadedAsset};

/// Serves fixed bodies into a `MemoryStorage`, failing a URL a set number of times first.
struct FakeFetcher {
    storage: Arc<MemoryStorage>,
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    failures_left: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<(String, PathBuf)>>,
}

impl FakeFetcher {
    fn new(storage: Arc<MemoryStorage>) -> Arc<Self> {
        Arc::new(Self {
            storage,
            bodies: Mutex::new(HashMap::new()),
            failures_left: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.bodies.lock().insert(url.to_string(), body.into());
    }

    fn fail(&self, url: &str, times: u32) {
        self.failures_left.lock().insert(url.to_string(), times);
    }

    fn calls(&self) -> Vec<(String, PathBuf)> {
        self.calls.lock().clone()
    }

    fn urls(&self) -> Vec<String> {
        self.calls().into_iter().map(|(url, _)| url).collect()
    }
}

#[async_trait]
impl RemoteFetcher for FakeFetcher {
    async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        _headers: &HashMap<String, String>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<PathBuf> {
        self.calls
            .lock()
            .push((url.to_string(), destination.to_path_buf()));

        if let Some(left) = self.failures_left.lock().get_mut(url) {
            if *left > 0 {
                *left -= 1;
                return Err(anyhow!("download failed: {}, status: 0", url));
            }
        }
        let body = self
            .bodies
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("download failed: {}, status: 404", url))?;
        if let Some(cb) = on_progress {
            cb(body.len() as u64, body.len() as u64);
        }
        self.storage.insert_file(destination, body);
        Ok(destination.to_path_buf())
    }
}

struct Harness {
    storage: Arc<MemoryStorage>,
    fetcher: Arc<FakeFetcher>,
    dispatcher: Dispatcher,
}

fn harness(config: EngineConfig) -> Harness {
    let storage = Arc::new(MemoryStorage::new("/data"));
    let fetcher = FakeFetcher::new(storage.clone());
    let cache = CacheIndex::initialize(storage.clone(), CacheSettings::from(&config)).unwrap();
    let dispatcher = Dispatcher::new(cache, fetcher.clone(), &config);
    Harness {
        storage,
        fetcher,
        dispatcher,
    }
}

fn cache_root() -> PathBuf {
    PathBuf::from("/data/gamecaches")
}

#[tokio::test]
async fn test_remote_download_then_cache_hit() {
    let h = harness(EngineConfig::default());
    let url = "http://cdn/config/settings.json";
    h.fetcher.serve(url, r#"{"lang":"en"}"#);
    let options = DownloadOptions::default();

    assert_eq!(h.dispatcher.classify(url, &options), Classification::Remote);
    let value = h.dispatcher.download_json(url, &options).await.unwrap();
    assert_eq!(value["lang"], "en");

    let record = h.dispatcher.cache().record(url).unwrap();
    assert!(record.relative_path.ends_with(".json"));
    assert!(!record.relative_path.contains('/'));
    assert_eq!(record.bundle_name, None);

    let cached = cache_root().join(&record.relative_path);
    assert_eq!(h.dispatcher.classify(url, &options), Classification::Cached(cached));
    let again = h.dispatcher.download_json(url, &options).await.unwrap();
    assert_eq!(again, value);
    assert_eq!(h.fetcher.calls().len(), 1);

    let stats = h.dispatcher.stats();
    assert_eq!(stats.completed_downloads, 1);
    assert_eq!(stats.cache_hits, 1);
}

#[tokio::test]
async fn test_downloaded_bytes_counted_through_storage() {
    let h = harness(EngineConfig::default());
    let url = "http://cdn/textures/atlas.bin";
    h.fetcher.serve(url, vec![7u8; 4096]);

    h.dispatcher
        .download_file(url, &DownloadOptions::default())
        .await
        .unwrap();

    let stats = h.dispatcher.stats();
    assert_eq!(stats.downloaded_bytes, 4096);
    assert_eq!(stats.completed_downloads, 1);
}

#[tokio::test]
async fn test_reload_bypasses_cache() {
    let h = harness(EngineConfig::default());
    let url = "http://cdn/news.txt";
    h.fetcher.serve(url, "v1");
    h.dispatcher
        .download_text(url, &DownloadOptions::default())
        .await
        .unwrap();

    h.fetcher.serve(url, "v2");
    let reload = DownloadOptions {
        reload: true,
        ..DownloadOptions::default()
    };
    assert_eq!(h.dispatcher.classify(url, &reload), Classification::Remote);
    assert_eq!(h.dispatcher.download_text(url, &reload).await.unwrap(), "v2");

    let calls = h.fetcher.calls();
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0].1, calls[1].1);
}

#[tokio::test]
async fn test_local_paths_are_read_directly() {
    let h = harness(EngineConfig::default());
    h.storage.insert_file("assets/main/config.json", r#"{"name":"main"}"#);
    let options = DownloadOptions::default();

    let value = h
        .dispatcher
        .download_json("assets/main/config.json", &options)
        .await
        .unwrap();
    assert_eq!(value["name"], "main");

    let err = h
        .dispatcher
        .download_json("assets/missing.json", &options)
        .await
        .unwrap_err();
    assert!(matches!(err, AssetError::Read { .. }));
    assert!(h.fetcher.calls().is_empty());
    assert!(h.dispatcher.cache().is_empty());
    assert_eq!(h.dispatcher.stats().local_loads, 2);
}

#[tokio::test]
async fn test_failed_download_resumes_same_slot() {
    let h = harness(EngineConfig::default());
    let url = "http://cdn/atlas.png";
    h.fetcher.serve(url, vec![1u8, 2, 3]);
    h.fetcher.fail(url, 2);
    let options = DownloadOptions::default();

    for attempt in 1..=2 {
        let err = h.dispatcher.download_file(url, &options).await.unwrap_err();
        assert!(err.is_fetch());
        assert_eq!(h.dispatcher.failure_record(url).unwrap().retry_count, attempt);
    }
    assert!(!h.dispatcher.cache().contains(url));

    let path = h.dispatcher.download_file(url, &options).await.unwrap();
    assert!(h.dispatcher.failure_record(url).is_none());
    assert!(h.dispatcher.cache().contains(url));

    let calls = h.fetcher.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|(_, dest)| *dest == path));
}

#[tokio::test]
async fn test_failure_record_dropped_at_max_retries() {
    let config = EngineConfig {
        max_retry_count: 3,
        ..EngineConfig::default()
    };
    let h = harness(config);
    let url = "http://cdn/flaky.bin";
    h.fetcher.fail(url, 4);
    let options = DownloadOptions::default();

    for _ in 0..3 {
        assert!(h.dispatcher.download_file(url, &options).await.is_err());
    }
    assert!(h.dispatcher.failure_record(url).is_none());

    assert!(h.dispatcher.download_file(url, &options).await.is_err());
    assert_eq!(h.dispatcher.failure_record(url).unwrap().retry_count, 1);

    let calls = h.fetcher.calls();
    assert_eq!(calls[0].1, calls[2].1);
    assert_ne!(calls[2].1, calls[3].1);
    assert_eq!(h.dispatcher.stats().failed_downloads, 4);
}

#[tokio::test]
async fn test_bundle_scoped_destination() {
    let h = harness(EngineConfig::default());
    let url = "http://cdn/levels/stage1.json";
    h.fetcher.serve(url, "{}");
    let options = DownloadOptions {
        cache_bundle_root: Some("levels".to_string()),
        ..DownloadOptions::default()
    };

    h.dispatcher.download_json(url, &options).await.unwrap();
    let record = h.dispatcher.cache().record(url).unwrap();
    assert!(record.relative_path.starts_with("levels/"));
    assert_eq!(record.bundle_name.as_deref(), Some("levels"));
    assert!(h.fetcher.calls()[0].1.starts_with(cache_root().join("levels")));
}

#[tokio::test]
async fn test_unreadable_cached_copy_is_dropped() {
    let h = harness(EngineConfig::default());
    let url = "http://cdn/broken.json";
    h.storage.insert_file(cache_root().join("1.json"), "not json");
    h.dispatcher.cache().record_entry(url, "1.json", None);

    let err = h
        .dispatcher
        .download_json(url, &DownloadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AssetError::Read { .. }));
    assert!(!h.dispatcher.cache().contains(url));
    assert!(h.fetcher.calls().is_empty());
}

#[tokio::test]
async fn test_unreadable_download_is_not_registered() {
    let h = harness(EngineConfig::default());
    let url = "http://cdn/garbled.json";
    h.fetcher.serve(url, "{{{");

    let err = h
        .dispatcher
        .download_json(url, &DownloadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AssetError::Read { .. }));
    assert!(!h.dispatcher.cache().contains(url));
    assert!(h.dispatcher.failure_record(url).is_none());

    let (_, dest) = &h.fetcher.calls()[0];
    assert!(h.storage.contains_file(dest));
}

#[tokio::test]
async fn test_scripts_load_once() {
    let h = harness(EngineConfig::default());
    let url = "http://cdn/main/index.js";
    h.fetcher.serve(url, "console.log(1)");
    let reload = DownloadOptions {
        reload: true,
        ..DownloadOptions::default()
    };

    let first = h.dispatcher.download_script(url, &reload).await.unwrap();
    let second = h.dispatcher.download_script(url, &reload).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.fetcher.calls().len(), 1);
}

#[tokio::test]
async fn test_remote_bundle_load() {
    let config = EngineConfig {
        server: "http://cdn/game".to_string(),
        remote_bundles: vec!["levels".to_string()],
        bundle_versions: HashMap::from([("levels".to_string(), "a1b2".to_string())]),
        ..EngineConfig::default()
    };
    let h = harness(config);
    h.fetcher.serve(
        "http://cdn/game/remote/levels/config.a1b2.json",
        r#"{"name":"levels","encrypted":true}"#,
    );
    h.fetcher.serve("http://cdn/game/remote/levels/index.a1b2.jsc", "bytecode");

    let bundle = h
        .dispatcher
        .load_bundle("levels", &DownloadOptions::default())
        .await
        .unwrap();

    assert_eq!(bundle.name, "levels");
    assert_eq!(bundle.base, "http://cdn/game/remote/levels/");
    assert_eq!(bundle.config["base"], "http://cdn/game/remote/levels/");
    assert_eq!(
        h.fetcher.urls(),
        vec![
            "http://cdn/game/remote/levels/config.a1b2.json".to_string(),
            "http://cdn/game/remote/levels/index.a1b2.jsc".to_string(),
        ]
    );
    assert!(h.storage.contains_dir(&cache_root().join("levels")));
    let record = h
        .dispatcher
        .cache()
        .record("http://cdn/game/remote/levels/index.a1b2.jsc")
        .unwrap();
    assert_eq!(record.bundle_name.as_deref(), Some("levels"));
}

#[tokio::test]
async fn test_bundle_config_failure_skips_script() {
    let h = harness(EngineConfig::default());
    let url = "http://cdn/bundles/ui";

    let err = h
        .dispatcher
        .load_bundle(url, &DownloadOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_fetch());
    assert_eq!(h.fetcher.urls(), vec![format!("{}/config.json", url)]);
}

#[tokio::test]
async fn test_builtin_bundle_is_local() {
    let h = harness(EngineConfig::default());
    h.storage.insert_file("assets/resources/config.json", "{}");
    h.storage.insert_file("assets/resources/index.js", "");

    let bundle = h
        .dispatcher
        .load_bundle("resources", &DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(bundle.base, "assets/resources/");
    assert_eq!(bundle.script, PathBuf::from("assets/resources/index.js"));
    assert!(h.fetcher.calls().is_empty());
}

#[tokio::test]
async fn test_shutdown_stops_remote_fetches() {
    let h = harness(EngineConfig::default());
    h.dispatcher.shutdown();

    let err = h
        .dispatcher
        .download_text("http://cdn/late.txt", &DownloadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AssetError::Shutdown));
    assert!(h.fetcher.calls().is_empty());
}

fn engine() -> (Arc<FakeFetcher>, AssetEngine) {
    let storage = Arc::new(MemoryStorage::new("/data"));
    let fetcher = FakeFetcher::new(storage.clone());
    let transform = TransformChain::new()
        .with_stage(Arc::new(DirectUrlResolver))
        .with_stage(Arc::new(CacheBundleRootStage));
    let engine = AssetEngine::init(
        EngineConfig::default(),
        storage,
        fetcher.clone(),
        Arc::new(transform),
    )
    .unwrap();
    (fetcher, engine)
}

#[tokio::test]
async fn test_engine_load_dispatches_by_extension() {
    let (fetcher, engine) = engine();
    fetcher.serve("http://cdn/a.json", r#"[1,2]"#);
    fetcher.serve("http://cdn/b.png", vec![0x89u8, 0x50]);
    fetcher.serve("http://cdn/c.md", "# title");

    let assets = engine
        .load(
            vec![
                RequestInput::url("http://cdn/a.json"),
                RequestInput::url("http://cdn/b.png"),
                RequestInput::url("http://cdn/c.md"),
            ],
            RequestOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(assets.len(), 3);
    assert!(matches!(&assets[0], LoadedAsset::Json(v) if *v == json!([1, 2])));
    assert!(matches!(&assets[1], LoadedAsset::File(p) if p.extension().unwrap() == "png"));
    assert!(matches!(&assets[2], LoadedAsset::Text(t) if t == "# title"));

    let items = engine.preprocessor().items();
    assert_eq!(items.outstanding(), 0);
    assert_eq!(engine.preprocessor().tasks().outstanding(), 0);
}

#[tokio::test]
async fn test_engine_load_caches_under_owning_bundle() {
    let (fetcher, engine) = engine();
    fetcher.serve("http://cdn/levels/1.json", "{}");

    let options: RequestOptions = [("bundle", json!("levels"))].into_iter().collect();
    engine
        .load(vec![RequestInput::url("http://cdn/levels/1.json")], options)
        .await
        .unwrap();

    let record = engine.cache().record("http://cdn/levels/1.json").unwrap();
    assert_eq!(record.bundle_name.as_deref(), Some("levels"));
    assert!(record.relative_path.starts_with("levels/"));
}

#[tokio::test]
async fn test_engine_load_propagates_first_error() {
    let (fetcher, engine) = engine();
    fetcher.serve("http://cdn/ok.json", "{}");

    let err = engine
        .load(
            vec![
                RequestInput::url("http://cdn/ok.json"),
                RequestInput::url("http://cdn/missing.json"),
            ],
            RequestOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(err.is_fetch());
    assert_eq!(engine.preprocessor().items().outstanding(), 0);
}

#[tokio::test]
async fn test_engine_load_file_honours_request_options() {
    let (fetcher, engine) = engine();
    fetcher.serve("http://cdn/data", r#"{"k":1}"#);

    let mut options = RequestOptions::new();
    options.insert("ext", ".json");
    options.insert(CACHE_BUNDLE_ROOT, "main");
    let asset = engine.load_file("http://cdn/data", &options).await.unwrap();

    assert!(matches!(asset, LoadedAsset::Json(v) if v["k"] == 1));
    assert_eq!(
        engine.cache().record("http://cdn/data").unwrap().bundle_name.as_deref(),
        Some("main")
    );
}
