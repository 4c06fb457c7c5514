// Asset cache engine — persistent URL cache, resumable download dispatch, request preprocessing.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod source;
pub mod storage;

pub use api::engine_api::{AssetEngine, LoadedAsset};
pub use config::EngineConfig;
pub use error::{AssetError, PersistError};
