// Public surface — engine facade and tracing setup.

pub mod engine_api;
pub mod simple;
