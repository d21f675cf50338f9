//! Stalled-check alarm
//!
//! Buckets expire objects after their configured lifecycle; a checker
//! that has not completed within that window can no longer tell data loss
//! from expiry. The inspector compares the time since the last check
//! start against the tightest bucket lifecycle and raises a WARN before
//! the window closes. It writes nothing.

use std::sync::Arc;

use tracing::warn;

use crate::accessor::AccessorFactory;
use crate::checker::instance::InstanceChecker;
use crate::error::Result;
use crate::keys;
use crate::kv::TxnKv;
use crate::metrics::metrics;
use crate::model::{decode, InstanceInfo, JobRecycle};
use crate::now_ms;

const DAY_MS: i64 = 86_400_000;

pub struct LifecycleInspector {
    kv: Arc<dyn TxnKv>,
    factory: Arc<dyn AccessorFactory>,
    reserved_buffer_days: i64,
}

impl LifecycleInspector {
    pub fn new(
        kv: Arc<dyn TxnKv>,
        factory: Arc<dyn AccessorFactory>,
        reserved_buffer_days: i64,
    ) -> Self {
        Self {
            kv,
            factory,
            reserved_buffer_days,
        }
    }

    /// Inspect one instance, returning whether the alarm fired.
    ///
    /// Exactly one WARN is emitted when
    /// `now - last_ctime_ms >= expiration_ms`; instances without any S3
    /// vault are skipped. `last_ctime_ms` falls back to the instance
    /// creation time for tenants never checked before.
    pub async fn do_inspect(&self, instance: &InstanceInfo) -> Result<bool> {
        let job_key = keys::job_check_key(&instance.instance_id);
        let mut txn = self.kv.create_txn().await?;
        let job_value = txn.get(&job_key).await?;

        let checker =
            InstanceChecker::init(self.kv.clone(), self.factory.as_ref(), instance).await?;
        let lifecycle_days = checker.bucket_lifecycle_days().await?;
        if lifecycle_days == i64::MAX {
            // No S3 vault; nothing expires objects behind our back.
            return Ok(false);
        }

        let mut last_ctime_ms = None;
        if let Some(value) = &job_value {
            match decode::<JobRecycle>(value) {
                Ok(job) => {
                    last_ctime_ms = job.last_ctime_ms;
                    if let Some(last_success) = job.last_success_time_ms {
                        metrics()
                            .last_success_time_ms
                            .with_label_values(&[instance.instance_id.as_str()])
                            .set(last_success);
                    }
                }
                Err(e) => {
                    warn!(
                        instance_id = %instance.instance_id,
                        key = %keys::hex(&job_key),
                        error = %e,
                        "check interval alarm: malformed job record"
                    );
                }
            }
        }
        // Instances never checked fall back to their creation time.
        let last_ctime_ms = last_ctime_ms.unwrap_or(instance.ctime_ms);

        let expiration_ms = if lifecycle_days > self.reserved_buffer_days {
            (lifecycle_days - self.reserved_buffer_days) * DAY_MS
        } else {
            lifecycle_days * DAY_MS
        };

        let now = now_ms();
        if now - last_ctime_ms >= expiration_ms {
            warn!(
                instance_id = %instance.instance_id,
                last_ctime_ms,
                lifecycle_days,
                reserved_buffer_days = self.reserved_buffer_days,
                expiration_ms,
                "check interval alarm: check staleness approaching bucket lifecycle"
            );
            return Ok(true);
        }
        Ok(false)
    }
}
