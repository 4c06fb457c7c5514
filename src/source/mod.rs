// Network fetch abstraction — pluggable transports that download a URL into a destination path.

pub mod http_source;
pub mod traits;
