// Storage facade — filesystem capability consumed by the cache and dispatcher.

pub mod local;
pub mod memory;
pub mod traits;
