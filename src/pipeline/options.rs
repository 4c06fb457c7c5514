// Request option maps and the partition rule used before URL resolution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bundle subfolder a downloaded file is cached under.
pub const CACHE_BUNDLE_ROOT: &str = "__cacheBundleRoot__";

/// Keys only the URL-resolution step needs.
pub const URL_RESOLUTION_KEYS: &[&str] = &[
    "__requestType__",
    "__isNative__",
    "ext",
    "type",
    "__nativeName__",
    "audioLoadMode",
    "bundle",
];

/// Keys that steer later pipeline stages and never reach URL resolution.
pub const PIPELINE_CONTROL_KEYS: &[&str] = &["__exclude__", "__outputAsArray__"];

/// How a request names what it wants. These keys identify the request itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Path,
    Uuid,
    Dir,
    Scene,
    Url,
}

impl RequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Path => "path",
            RequestType::Uuid => "uuid",
            RequestType::Dir => "dir",
            RequestType::Scene => "scene",
            RequestType::Url => "url",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "path" => Some(RequestType::Path),
            "uuid" => Some(RequestType::Uuid),
            "dir" => Some(RequestType::Dir),
            "scene" => Some(RequestType::Scene),
            "url" => Some(RequestType::Url),
            _ => None,
        }
    }
}

/// Where an option key goes when a request is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionRole {
    /// Request selector; copied nowhere.
    Structural,
    UrlResolution,
    PipelineControl,
    /// Copied to both sides.
    Shared,
}

pub fn role_of(key: &str) -> OptionRole {
    if RequestType::from_key(key).is_some() {
        OptionRole::Structural
    } else if URL_RESOLUTION_KEYS.contains(&key) {
        OptionRole::UrlResolution
    } else if PIPELINE_CONTROL_KEYS.contains(&key) {
        OptionRole::PipelineControl
    } else {
        OptionRole::Shared
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestOptions(BTreeMap<String, Value>);

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Copy every entry of `other` that is not already set here.
    pub fn merge_missing(&mut self, other: &RequestOptions) {
        for (k, v) in other.iter() {
            self.0.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    /// Split into `(url_resolution, remainder)` following [`role_of`].
    pub fn split(&self) -> (RequestOptions, RequestOptions) {
        let mut sub = RequestOptions::new();
        let mut left = RequestOptions::new();
        for (key, value) in self.iter() {
            match role_of(key) {
                OptionRole::Structural => {}
                OptionRole::UrlResolution => {
                    sub.0.insert(key.clone(), value.clone());
                }
                OptionRole::PipelineControl => {
                    left.0.insert(key.clone(), value.clone());
                }
                OptionRole::Shared => {
                    sub.0.insert(key.clone(), value.clone());
                    left.0.insert(key.clone(), value.clone());
                }
            }
        }
        (sub, left)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for RequestOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
