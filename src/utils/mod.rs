pub mod crypto;
pub mod errors;
pub mod logger;
pub mod metrics;

pub use crypto::BlobCipher;
pub use errors::HubError;
pub use logger::setup_logging;
pub use metrics::HubMetrics;
