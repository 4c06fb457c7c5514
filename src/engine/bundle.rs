// Bundle loading — config document first, then the bundle's entry script.

use std::path::PathBuf;

use serde_json::Value;
use tracing::{debug, info};

use super::downloader::{is_remote_url, DownloadOptions, Dispatcher};
use crate::error::AssetError;

#[derive(Debug, Clone)]
pub struct LoadedBundle {
    pub name: String,
    /// Location the bundle's files are fetched from, ending with `/`.
    pub base: String,
    /// Parsed config document, with `base` filled in.
    pub config: Value,
    pub script: PathBuf,
}

/// Last path segment of a bundle name or URL.
pub fn bundle_name(name_or_url: &str) -> &str {
    let trimmed = name_or_url.trim_end_matches(['/', '\\']);
    trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed)
}

fn versioned(base: &str, stem: &str, version: Option<&str>, ext: &str) -> String {
    match version {
        Some(v) => format!("{}/{}.{}.{}", base, stem, v, ext),
        None => format!("{}/{}.{}", base, stem, ext),
    }
}

impl Dispatcher {
    /// Where a bundle lives. Remote and user-data bundles get a cache subfolder.
    pub fn resolve_bundle_url(&self, name_or_url: &str) -> Result<String, AssetError> {
        let name = bundle_name(name_or_url);
        if is_remote_url(name_or_url) || self.is_under_user_data(name_or_url) {
            self.cache().make_bundle_folder(name)?;
            Ok(name_or_url.trim_end_matches('/').to_string())
        } else if self.remote_bundles.contains(name) {
            self.cache().make_bundle_folder(name)?;
            Ok(format!("{}remote/{}", self.server_root, name))
        } else {
            Ok(format!("assets/{}", name))
        }
    }

    /// Fetch `config[.<version>].json`, then `index[.<version>].js` (or `.jsc` when the
    /// config says the bundle is encrypted). A failed config fetch skips the script.
    pub async fn load_bundle(
        &self,
        name_or_url: &str,
        options: &DownloadOptions,
    ) -> Result<LoadedBundle, AssetError> {
        let name = bundle_name(name_or_url).to_string();
        let url = self.resolve_bundle_url(name_or_url)?;
        let version = options
            .version
            .clone()
            .or_else(|| self.bundle_versions.get(&name).cloned());

        let mut options = options.clone();
        options.cache_bundle_root = Some(name.clone());

        let config_url = versioned(&url, "config", version.as_deref(), "json");
        debug!("loading bundle {} config from {}", name, config_url);
        let mut config = self.download_json(&config_url, &options).await?;

        let base = format!("{}/", url);
        if let Value::Object(map) = &mut config {
            map.insert("base".to_string(), Value::String(base.clone()));
        }

        let encrypted = config
            .get("encrypted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let script_ext = if encrypted { "jsc" } else { "js" };
        let script_url = versioned(&url, "index", version.as_deref(), script_ext);
        let script = self.download_script(&script_url, &options).await?;

        info!("bundle {} loaded from {}", name, base);
        Ok(LoadedBundle {
            name,
            base,
            config,
            script,
        })
    }
}
