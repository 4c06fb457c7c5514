// Engine facade — wires cache, dispatcher and preprocessor from one configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::engine::bundle::LoadedBundle;
use crate::engine::cache::{CacheIndex, CacheSettings};
use crate::engine::downloader::{extname, DownloadOptions, Dispatcher};
use crate::engine::stats::StatsSnapshot;
use crate::error::AssetError;
use crate::pipeline::options::RequestOptions;
use crate::pipeline::preprocess::{
    CacheBundleRootStage, DirectUrlResolver, Preprocessor, TransformChain, UrlTransform,
};
use crate::pipeline::task::RequestInput;
use crate::source::http_source::HttpFetcher;
use crate::source::traits::RemoteFetcher;
use crate::storage::local::LocalStorage;
use crate::storage::traits::Storage;

/// How a fetched file is read, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileHandler {
    Script,
    Json,
    /// Returned as a path for the consumer to decode.
    Asset,
    Bundle,
    Text,
}

const ASSET_EXTENSIONS: &[&str] = &[
    // images
    ".png", ".jpg", ".bmp", ".jpeg", ".gif", ".ico", ".tiff", ".webp", ".image", ".pvr",
    ".pkm", ".astc",
    // audio
    ".mp3", ".ogg", ".wav", ".m4a",
    // video
    ".mp4", ".avi", ".mov", ".mpg", ".mpeg", ".rm", ".rmvb",
    // text assets
    ".txt", ".xml", ".vsh", ".fsh", ".atlas", ".tmx", ".tsx", ".fnt", ".plist",
    ".ExportJson",
    // binary
    ".binary", ".bin", ".dbbin", ".skel",
    // fonts
    ".font", ".eot", ".ttf", ".woff", ".svg", ".ttc",
];

pub fn handler_for(ext: &str) -> FileHandler {
    match ext {
        ".js" | ".jsc" => FileHandler::Script,
        ".json" => FileHandler::Json,
        "bundle" => FileHandler::Bundle,
        _ if ASSET_EXTENSIONS.contains(&ext) => FileHandler::Asset,
        _ => FileHandler::Text,
    }
}

#[derive(Debug, Clone)]
pub enum LoadedAsset {
    Json(Value),
    Text(String),
    File(PathBuf),
    Script(PathBuf),
    Bundle(LoadedBundle),
}

pub struct AssetEngine {
    config: EngineConfig,
    dispatcher: Arc<Dispatcher>,
    preprocessor: Preprocessor,
}

impl AssetEngine {
    /// Load the cache index and build the dispatcher around the given collaborators.
    pub fn init(
        config: EngineConfig,
        storage: Arc<dyn Storage>,
        fetcher: Arc<dyn RemoteFetcher>,
        transform: Arc<dyn UrlTransform>,
    ) -> Result<Self, AssetError> {
        let cache = CacheIndex::initialize(storage, CacheSettings::from(&config))?;
        let dispatcher = Arc::new(Dispatcher::new(cache, fetcher, &config));
        info!(
            "asset engine ready: {} cached entries, {} remote bundles",
            dispatcher.cache().len(),
            config.remote_bundles.len()
        );
        Ok(Self {
            config,
            dispatcher,
            preprocessor: Preprocessor::new(transform),
        })
    }

    /// Engine over the local filesystem and the HTTP transport, resolving plain URLs.
    pub fn with_http(config: EngineConfig, user_data_root: impl Into<PathBuf>) -> Result<Self, AssetError> {
        let fetcher = HttpFetcher::new(config.downloader_max_tasks, config.downloader_timeout())
            .map_err(AssetError::Config)?;
        let transform = TransformChain::new()
            .with_stage(Arc::new(DirectUrlResolver))
            .with_stage(Arc::new(CacheBundleRootStage));
        Self::init(
            config,
            Arc::new(LocalStorage::new(user_data_root)),
            Arc::new(fetcher),
            Arc::new(transform),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheIndex {
        self.dispatcher.cache()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.dispatcher.stats()
    }

    /// Resolve a request into items and fetch them all, in request order.
    ///
    /// Options left after resolution apply to every item unless the item sets them itself.
    pub async fn load(
        &self,
        inputs: Vec<RequestInput>,
        options: RequestOptions,
    ) -> Result<Vec<LoadedAsset>, AssetError> {
        let processed = self.preprocessor.process(inputs, options)?;
        debug!("loading {} items", processed.items.len());

        let mut jobs = JoinSet::new();
        for (index, item) in processed.items.iter().enumerate() {
            let mut item_options = item.options.clone();
            item_options.merge_missing(&processed.options);
            let options = DownloadOptions::from_request_options(&item_options);
            let dispatcher = Arc::clone(&self.dispatcher);
            let url = item.url.clone();
            let ext = item.ext.clone();
            jobs.spawn(async move { (index, fetch_item(&dispatcher, &url, &ext, &options).await) });
        }
        let count = processed.items.len();
        self.preprocessor.release_items(processed.items);

        let mut results: Vec<Option<LoadedAsset>> = vec![None; count];
        while let Some(joined) = jobs.join_next().await {
            let (index, result) =
                joined.map_err(|e| AssetError::Pipeline(anyhow!("load task failed: {}", e)))?;
            results[index] = Some(result?);
        }
        Ok(results.into_iter().flatten().collect())
    }

    /// Fetch one URL, reading it according to its extension.
    pub async fn load_file(&self, url: &str, options: &RequestOptions) -> Result<LoadedAsset, AssetError> {
        let download = DownloadOptions::from_request_options(options);
        let ext = options
            .get_str("ext")
            .unwrap_or_else(|| extname(url))
            .to_string();
        fetch_item(&self.dispatcher, url, &ext, &download).await
    }

    pub async fn load_bundle(
        &self,
        name_or_url: &str,
        options: &DownloadOptions,
    ) -> Result<LoadedBundle, AssetError> {
        self.dispatcher.load_bundle(name_or_url, options).await
    }

    pub fn clear_cache(&self) -> Result<(), AssetError> {
        self.dispatcher.cache().clear()
    }

    /// Safe to call from any thread; deletions run on the engine's runtime.
    pub fn evict_lru(&self) -> usize {
        self.dispatcher.cache().evict_lru()
    }

    /// Persist pending index changes and stop new downloads.
    pub async fn shutdown(&self) -> Result<(), AssetError> {
        self.dispatcher.shutdown();
        self.dispatcher.cache().flush().await?;
        info!("asset engine shut down");
        Ok(())
    }
}

async fn fetch_item(
    dispatcher: &Dispatcher,
    url: &str,
    ext: &str,
    options: &DownloadOptions,
) -> Result<LoadedAsset, AssetError> {
    match handler_for(ext) {
        FileHandler::Script => dispatcher
            .download_script(url, options)
            .await
            .map(LoadedAsset::Script),
        FileHandler::Json => dispatcher.download_json(url, options).await.map(LoadedAsset::Json),
        FileHandler::Asset => dispatcher.download_file(url, options).await.map(LoadedAsset::File),
        FileHandler::Bundle => dispatcher.load_bundle(url, options).await.map(LoadedAsset::Bundle),
        FileHandler::Text => dispatcher.download_text(url, options).await.map(LoadedAsset::Text),
    }
}
