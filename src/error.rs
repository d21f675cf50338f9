/*!
 * Error types for Parallax
 */

use thiserror::Error;

use crate::accessor::AccessorError;
use crate::kv::TxnError;

pub type Result<T> = std::result::Result<T, ParallaxError>;

/// Top-level error for checker operations.
///
/// Errors reaching the worker loop are terminal for the current run: the
/// job record is left unfinished so the lease expires and another replica
/// retries. Recoverable conditions (malformed rowset, vault miss, single
/// tablet listing failure) never surface here; they are counted into
/// `num_check_failed` and the scan continues.
#[derive(Debug, Error)]
pub enum ParallaxError {
    /// Transactional KV failure
    #[error("kv error: {0}")]
    Kv(#[from] TxnError),

    /// Object store accessor failure
    #[error("accessor error: {0}")]
    Accessor(#[from] AccessorError),

    /// A KV range scan ended before reaching its end key
    #[error("kv range scan truncated, range begin={begin}")]
    TruncatedScan { begin: String },

    /// A KV value failed to deserialize where the record is load-bearing
    /// (vault descriptors, rowset metas on the inverted path)
    #[error("malformed record, key={key}: {source}")]
    MalformedRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A storage vault could not be constructed at init time
    #[error("storage vault init failed, resource_id={resource_id}: {reason}")]
    VaultInit { resource_id: String, reason: String },

    /// The checker observed its stop flag and aborted
    #[error("checker stopped")]
    Stopped,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl ParallaxError {
    /// Whether retrying on the next scheduler tick may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ParallaxError::Kv(e) => e.is_retryable(),
            ParallaxError::Accessor(_) => true,
            ParallaxError::TruncatedScan { .. } => true,
            ParallaxError::MalformedRecord { .. } => false,
            ParallaxError::VaultInit { .. } => false,
            ParallaxError::Stopped => false,
            ParallaxError::Config(_) => false,
        }
    }
}
