pub mod cache;
pub mod fingerprint;
pub mod log;
pub mod output_store;

pub use cache::{ActionCache, CacheStats, CompletionToken, Probe};
pub use fingerprint::{combined_inputs_digest, digest_files, request_fingerprint};
pub use log::{CacheLog, CachedRecord};
pub use output_store::OutputStore;
