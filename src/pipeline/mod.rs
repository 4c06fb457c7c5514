// Request transform pipeline — option partitioning, pooled tasks, URL resolution.

pub mod options;
pub mod preprocess;
pub mod task;
