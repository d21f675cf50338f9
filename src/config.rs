/*!
 * Configuration types for the checker
 */

use serde::{Deserialize, Serialize};

/// Configuration for one checker replica.
///
/// The surrounding daemon owns config-file parsing; this struct only needs
/// to deserialize from whatever format that daemon uses. Every field has a
/// serde default so a partial config section works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerConfig {
    /// Instance ids to check exclusively. When non-empty, every other
    /// instance is skipped and `recycle_blacklist` is ignored.
    #[serde(default)]
    pub recycle_whitelist: Vec<String>,

    /// Instance ids to skip. Only consulted when the whitelist is empty.
    #[serde(default)]
    pub recycle_blacklist: Vec<String>,

    /// Seconds between instance discovery scans (and between lifecycle
    /// inspection sweeps).
    #[serde(default = "default_scan_instances_interval_seconds")]
    pub scan_instances_interval_seconds: u64,

    /// Lease duration used by the renewal loop. Renewal runs at one third
    /// of this period, giving two retries before expiry.
    #[serde(default = "default_recycle_job_lease_expired_ms")]
    pub recycle_job_lease_expired_ms: i64,

    /// Number of concurrent check workers.
    #[serde(default = "default_recycle_concurrency")]
    pub recycle_concurrency: usize,

    /// Minimum seconds between two checks of the same instance. Also the
    /// initial lease span written when a job is acquired.
    #[serde(default = "default_check_object_interval_seconds")]
    pub check_object_interval_seconds: i64,

    /// Days subtracted from the bucket lifecycle when computing the
    /// stalled-check alarm threshold.
    #[serde(default = "default_reserved_buffer_days")]
    pub reserved_buffer_days: i64,

    /// Run the object-store to KV direction as well, flagging orphan
    /// objects whose rowset no longer exists.
    #[serde(default)]
    pub enable_inverted_check: bool,

    /// ip:port identity of this replica, written into job records as the
    /// lease owner.
    #[serde(default = "default_owner_endpoint")]
    pub owner_endpoint: String,
}

fn default_scan_instances_interval_seconds() -> u64 {
    60
}

fn default_recycle_job_lease_expired_ms() -> i64 {
    60_000
}

fn default_recycle_concurrency() -> usize {
    8
}

fn default_check_object_interval_seconds() -> i64 {
    43_200
}

fn default_reserved_buffer_days() -> i64 {
    3
}

fn default_owner_endpoint() -> String {
    "127.0.0.1:5000".to_string()
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            recycle_whitelist: Vec::new(),
            recycle_blacklist: Vec::new(),
            scan_instances_interval_seconds: default_scan_instances_interval_seconds(),
            recycle_job_lease_expired_ms: default_recycle_job_lease_expired_ms(),
            recycle_concurrency: default_recycle_concurrency(),
            check_object_interval_seconds: default_check_object_interval_seconds(),
            reserved_buffer_days: default_reserved_buffer_days(),
            enable_inverted_check: false,
            owner_endpoint: default_owner_endpoint(),
        }
    }
}

impl CheckerConfig {
    /// Validate the configuration, returning a description of the first
    /// problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.recycle_concurrency == 0 {
            return Err("recycle_concurrency must be at least 1".to_string());
        }

        if self.recycle_job_lease_expired_ms < 3_000 {
            return Err("recycle_job_lease_expired_ms must be at least 3000".to_string());
        }

        if self.scan_instances_interval_seconds == 0 {
            return Err("scan_instances_interval_seconds must be greater than 0".to_string());
        }

        if self.check_object_interval_seconds <= 0 {
            return Err("check_object_interval_seconds must be greater than 0".to_string());
        }

        if self.reserved_buffer_days < 0 {
            return Err("reserved_buffer_days must not be negative".to_string());
        }

        if self.owner_endpoint.is_empty() {
            return Err("owner_endpoint must not be empty".to_string());
        }

        Ok(())
    }
}
