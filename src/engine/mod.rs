// Engine core — cache index, download dispatch, bundle loading and throttling.

pub mod bundle;
pub mod cache;
pub mod downloader;
pub mod stats;
pub mod throttle;
pub mod writer;
