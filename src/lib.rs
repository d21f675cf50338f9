/*!
 * Parallax - metadata/object consistency checker
 *
 * Reconciles the rowset catalog of a cloud-native columnar storage
 * system (held in a transactional KV store) against the objects
 * physically present in per-tenant storage vaults:
 * - Forward check: detects segments the catalog claims but the store lost
 * - Inverted check: detects orphan objects whose rowset is gone
 * - Lifecycle inspection: alarms before bucket expiry outruns checking
 * - Multi-replica coordination through KV lease records, with bounded
 *   renewal and failover
 *
 * The crate is a library; the surrounding daemon owns bootstrap, CLI,
 * and config parsing, and drives [`CheckerCoordinator`] from its tokio
 * runtime.
 */

pub mod accessor;
pub mod checker;
pub mod config;
pub mod error;
pub mod keys;
pub mod kv;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod vault;

// Re-export commonly used types for convenience
pub use checker::{CheckOutcome, CheckerCoordinator, InstanceChecker, LifecycleInspector};
pub use config::CheckerConfig;
pub use error::{ParallaxError, Result};
pub use kv::{MemoryKv, TxnKv};
pub use vault::{StorageVault, VaultRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current time as epoch milliseconds.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
