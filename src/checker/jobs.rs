//! Job-record primitives
//!
//! One `JobRecycle` record per instance arbitrates which replica may run
//! that instance's check. All transitions are single KV transactions;
//! optimistic conflicts mean another replica moved first and are never
//! treated as ownership.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ParallaxError, Result};
use crate::keys;
use crate::kv::{FullRangeIter, RangeGetOptions, TxnError, TxnKv, TxnResult};
use crate::model::{decode, encode, InstanceInfo, JobRecycle, JobStatus};
use crate::now_ms;

/// Result of a lease renewal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// Lease extended; the checker keeps running.
    Renewed,
    /// Record gone, owned elsewhere, or stale past the grace window. The
    /// owning checker must stop.
    Lost,
}

/// Try to acquire the check job for an instance.
///
/// Returns `Ok(true)` when this endpoint now owns a busy record with
/// `lease_expiration_ms = now + lease_ms`. Acquisition is refused while
/// another endpoint holds an unexpired busy record, and while an idle
/// record shows a check started less than `lease_ms` ago (one check per
/// interval across the fleet).
pub async fn prepare_instance_check_job(
    kv: &Arc<dyn TxnKv>,
    instance_id: &str,
    owner_endpoint: &str,
    lease_ms: i64,
) -> Result<bool> {
    let key = keys::job_check_key(instance_id);
    let mut txn = kv.create_txn().await?;
    let now = now_ms();

    let job = match txn.get(&key).await? {
        None => JobRecycle {
            instance_id: instance_id.to_string(),
            owner_endpoint: owner_endpoint.to_string(),
            lease_expiration_ms: now + lease_ms,
            status: JobStatus::Busy,
            last_ctime_ms: None,
            last_success_time_ms: None,
        },
        Some(value) => {
            let mut job: JobRecycle = match decode(&value) {
                Ok(job) => job,
                Err(e) => {
                    // A malformed record must not wedge the instance
                    // forever; replace it.
                    warn!(instance_id, error = %e, "malformed job record, rebuilding");
                    JobRecycle {
                        instance_id: instance_id.to_string(),
                        owner_endpoint: String::new(),
                        lease_expiration_ms: 0,
                        status: JobStatus::Idle,
                        last_ctime_ms: None,
                        last_success_time_ms: None,
                    }
                }
            };
            match job.status {
                JobStatus::Busy => {
                    if job.owner_endpoint != owner_endpoint && now < job.lease_expiration_ms {
                        debug!(
                            instance_id,
                            owner = %job.owner_endpoint,
                            "job busy on another endpoint"
                        );
                        return Ok(false);
                    }
                }
                JobStatus::Idle => {
                    if let Some(last_ctime_ms) = job.last_ctime_ms {
                        if now < last_ctime_ms + lease_ms {
                            debug!(instance_id, last_ctime_ms, "job finished recently");
                            return Ok(false);
                        }
                    }
                }
            }
            job.owner_endpoint = owner_endpoint.to_string();
            job.status = JobStatus::Busy;
            job.lease_expiration_ms = now + lease_ms;
            job
        }
    };

    txn.put(&key, encode(&job));
    match txn.commit().await {
        Ok(()) => Ok(true),
        Err(TxnError::Conflict) => {
            debug!(instance_id, "lost job acquisition race");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Extend the lease on a running job.
///
/// Transient KV errors surface as `Err`; the caller leaves the checker
/// running and retries on its next tick.
pub async fn lease_instance_check_job(
    kv: &Arc<dyn TxnKv>,
    instance_id: &str,
    owner_endpoint: &str,
    lease_ms: i64,
) -> Result<LeaseOutcome> {
    let key = keys::job_check_key(instance_id);
    let mut txn = kv.create_txn().await?;
    let now = now_ms();

    let Some(value) = txn.get(&key).await? else {
        warn!(instance_id, "job record vanished while leased");
        return Ok(LeaseOutcome::Lost);
    };
    let mut job: JobRecycle = match decode(&value) {
        Ok(job) => job,
        Err(e) => {
            warn!(instance_id, error = %e, "malformed job record while leased");
            return Ok(LeaseOutcome::Lost);
        }
    };

    if job.status != JobStatus::Busy || job.owner_endpoint != owner_endpoint {
        return Ok(LeaseOutcome::Lost);
    }
    // Renewal runs at a third of the lease period, so an expiry further
    // back than one full period means renewals have been failing long
    // enough that another replica may already own the work.
    if now > job.lease_expiration_ms + lease_ms {
        warn!(instance_id, "lease stale past grace window");
        return Ok(LeaseOutcome::Lost);
    }

    job.lease_expiration_ms = now + lease_ms;
    txn.put(&key, encode(&job));
    txn.commit().await?;
    Ok(LeaseOutcome::Renewed)
}

/// Finalize a finished job.
///
/// Writes `Idle`, releases the lease, and advances `last_ctime_ms`.
/// Skipped silently if ownership was lost in the meantime; the new owner
/// is responsible for the record now.
pub async fn finish_instance_check_job(
    kv: &Arc<dyn TxnKv>,
    instance_id: &str,
    owner_endpoint: &str,
    success: bool,
    ctime_ms: i64,
) -> Result<()> {
    let key = keys::job_check_key(instance_id);
    let mut txn = kv.create_txn().await?;

    let Some(value) = txn.get(&key).await? else {
        warn!(instance_id, "job record missing at finish");
        return Ok(());
    };
    let mut job: JobRecycle = match decode(&value) {
        Ok(job) => job,
        Err(e) => {
            warn!(instance_id, error = %e, "malformed job record at finish");
            return Ok(());
        }
    };
    if job.owner_endpoint != owner_endpoint {
        warn!(
            instance_id,
            owner = %job.owner_endpoint,
            "job reassigned before finish, leaving record untouched"
        );
        return Ok(());
    }

    job.status = JobStatus::Idle;
    job.owner_endpoint = String::new();
    job.lease_expiration_ms = 0;
    job.last_ctime_ms = Some(ctime_ms);
    if success {
        job.last_success_time_ms = Some(now_ms());
    }
    txn.put(&key, encode(&job));
    txn.commit().await?;
    Ok(())
}

/// Probe a single key for existence.
pub async fn key_exists(kv: &Arc<dyn TxnKv>, key: &str) -> TxnResult<bool> {
    let mut txn = kv.create_txn().await?;
    Ok(txn.get(key).await?.is_some())
}

/// Fetch every instance record from the control-plane range.
pub async fn get_all_instances(kv: &Arc<dyn TxnKv>) -> Result<Vec<InstanceInfo>> {
    let (begin, end) = keys::instance_range();
    let mut iter = FullRangeIter::new(kv.clone(), &begin, &end, RangeGetOptions::default());
    let mut instances = Vec::new();
    while let Some((key, value)) = iter.next().await {
        match decode::<InstanceInfo>(&value) {
            Ok(instance) => instances.push(instance),
            Err(e) => {
                warn!(key = %keys::hex(&key), error = %e, "malformed instance record, skipping");
            }
        }
    }
    if !iter.is_valid() {
        return Err(ParallaxError::TruncatedScan { begin });
    }
    Ok(instances)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::model::InstanceStatus;
    use bytes::Bytes;

    fn read_job(raw: &MemoryKv, instance_id: &str) -> JobRecycle {
        decode(&raw.get_raw(&keys::job_check_key(instance_id)).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn prepare_installs_fresh_record() {
        let raw = MemoryKv::new();
        let kv: Arc<dyn TxnKv> = raw.clone();

        assert!(prepare_instance_check_job(&kv, "i1", "host-a:5000", 60_000)
            .await
            .unwrap());

        let job = read_job(&raw, "i1");
        assert_eq!(job.status, JobStatus::Busy);
        assert_eq!(job.owner_endpoint, "host-a:5000");
        assert!(job.lease_expiration_ms > now_ms());
    }

    #[tokio::test]
    async fn prepare_rejects_unexpired_foreign_lease() {
        let raw = MemoryKv::new();
        let kv: Arc<dyn TxnKv> = raw.clone();

        assert!(prepare_instance_check_job(&kv, "i1", "host-a:5000", 60_000)
            .await
            .unwrap());
        assert!(!prepare_instance_check_job(&kv, "i1", "host-b:5000", 60_000)
            .await
            .unwrap());
        // The original owner may re-enter its own record.
        assert!(prepare_instance_check_job(&kv, "i1", "host-a:5000", 60_000)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn prepare_takes_over_expired_lease() {
        let raw = MemoryKv::new();
        let kv: Arc<dyn TxnKv> = raw.clone();

        raw.insert(
            &keys::job_check_key("i1"),
            encode(&JobRecycle {
                instance_id: "i1".to_string(),
                owner_endpoint: "host-a:5000".to_string(),
                lease_expiration_ms: now_ms() - 1_000,
                status: JobStatus::Busy,
                last_ctime_ms: None,
                last_success_time_ms: None,
            }),
        );

        assert!(prepare_instance_check_job(&kv, "i1", "host-b:5000", 60_000)
            .await
            .unwrap());
        assert_eq!(read_job(&raw, "i1").owner_endpoint, "host-b:5000");
    }

    #[tokio::test]
    async fn prepare_skips_recently_finished_job() {
        let raw = MemoryKv::new();
        let kv: Arc<dyn TxnKv> = raw.clone();

        raw.insert(
            &keys::job_check_key("i1"),
            encode(&JobRecycle {
                instance_id: "i1".to_string(),
                owner_endpoint: String::new(),
                lease_expiration_ms: 0,
                status: JobStatus::Idle,
                last_ctime_ms: Some(now_ms() - 1_000),
                last_success_time_ms: Some(now_ms() - 1_000),
            }),
        );

        assert!(!prepare_instance_check_job(&kv, "i1", "host-a:5000", 60_000)
            .await
            .unwrap());
        // Old enough and it is taken again.
        raw.insert(
            &keys::job_check_key("i1"),
            encode(&JobRecycle {
                instance_id: "i1".to_string(),
                owner_endpoint: String::new(),
                lease_expiration_ms: 0,
                status: JobStatus::Idle,
                last_ctime_ms: Some(now_ms() - 120_000),
                last_success_time_ms: None,
            }),
        );
        assert!(prepare_instance_check_job(&kv, "i1", "host-a:5000", 60_000)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn lease_renews_own_busy_record() {
        let raw = MemoryKv::new();
        let kv: Arc<dyn TxnKv> = raw.clone();

        prepare_instance_check_job(&kv, "i1", "host-a:5000", 10_000)
            .await
            .unwrap();
        let before = read_job(&raw, "i1").lease_expiration_ms;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let outcome = lease_instance_check_job(&kv, "i1", "host-a:5000", 10_000)
            .await
            .unwrap();
        assert_eq!(outcome, LeaseOutcome::Renewed);
        assert!(read_job(&raw, "i1").lease_expiration_ms >= before);
    }

    #[tokio::test]
    async fn lease_lost_when_owned_elsewhere_or_missing() {
        let raw = MemoryKv::new();
        let kv: Arc<dyn TxnKv> = raw.clone();

        assert_eq!(
            lease_instance_check_job(&kv, "i1", "host-a:5000", 10_000)
                .await
                .unwrap(),
            LeaseOutcome::Lost
        );

        prepare_instance_check_job(&kv, "i1", "host-b:5000", 10_000)
            .await
            .unwrap();
        assert_eq!(
            lease_instance_check_job(&kv, "i1", "host-a:5000", 10_000)
                .await
                .unwrap(),
            LeaseOutcome::Lost
        );
    }

    #[tokio::test]
    async fn lease_lost_past_grace_window() {
        let raw = MemoryKv::new();
        let kv: Arc<dyn TxnKv> = raw.clone();

        raw.insert(
            &keys::job_check_key("i1"),
            encode(&JobRecycle {
                instance_id: "i1".to_string(),
                owner_endpoint: "host-a:5000".to_string(),
                lease_expiration_ms: now_ms() - 20_001,
                status: JobStatus::Busy,
                last_ctime_ms: None,
                last_success_time_ms: None,
            }),
        );

        assert_eq!(
            lease_instance_check_job(&kv, "i1", "host-a:5000", 20_000)
                .await
                .unwrap(),
            LeaseOutcome::Lost
        );
    }

    #[tokio::test]
    async fn finish_releases_and_records_times() {
        let raw = MemoryKv::new();
        let kv: Arc<dyn TxnKv> = raw.clone();

        prepare_instance_check_job(&kv, "i1", "host-a:5000", 60_000)
            .await
            .unwrap();
        finish_instance_check_job(&kv, "i1", "host-a:5000", true, 123_456)
            .await
            .unwrap();

        let job = read_job(&raw, "i1");
        assert_eq!(job.status, JobStatus::Idle);
        assert!(job.owner_endpoint.is_empty());
        assert_eq!(job.lease_expiration_ms, 0);
        assert_eq!(job.last_ctime_ms, Some(123_456));
        assert!(job.last_success_time_ms.is_some());
    }

    #[tokio::test]
    async fn finish_without_success_keeps_success_time() {
        let raw = MemoryKv::new();
        let kv: Arc<dyn TxnKv> = raw.clone();

        prepare_instance_check_job(&kv, "i1", "host-a:5000", 60_000)
            .await
            .unwrap();
        finish_instance_check_job(&kv, "i1", "host-a:5000", false, 99)
            .await
            .unwrap();

        let job = read_job(&raw, "i1");
        assert_eq!(job.last_ctime_ms, Some(99));
        assert_eq!(job.last_success_time_ms, None);
    }

    #[tokio::test]
    async fn finish_skips_foreign_record() {
        let raw = MemoryKv::new();
        let kv: Arc<dyn TxnKv> = raw.clone();

        prepare_instance_check_job(&kv, "i1", "host-b:5000", 60_000)
            .await
            .unwrap();
        finish_instance_check_job(&kv, "i1", "host-a:5000", true, 1)
            .await
            .unwrap();

        let job = read_job(&raw, "i1");
        assert_eq!(job.status, JobStatus::Busy);
        assert_eq!(job.owner_endpoint, "host-b:5000");
        assert_eq!(job.last_ctime_ms, None);
    }

    #[tokio::test]
    async fn key_exists_distinguishes_presence() {
        let raw = MemoryKv::new();
        let kv: Arc<dyn TxnKv> = raw.clone();
        raw.insert("some/key", Bytes::from_static(b"x"));

        assert!(key_exists(&kv, "some/key").await.unwrap());
        assert!(!key_exists(&kv, "other/key").await.unwrap());
    }

    #[tokio::test]
    async fn get_all_instances_skips_malformed() {
        let raw = MemoryKv::new();
        let kv: Arc<dyn TxnKv> = raw.clone();

        raw.insert(
            &keys::instance_key("a"),
            encode(&InstanceInfo {
                instance_id: "a".to_string(),
                status: InstanceStatus::Normal,
                ctime_ms: 0,
                obj_info: vec![],
                resource_ids: vec![],
            }),
        );
        raw.insert(&keys::instance_key("b"), Bytes::from_static(b"{bad"));

        let instances = get_all_instances(&kv).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].instance_id, "a");
    }

    #[tokio::test]
    async fn get_all_instances_errors_on_truncation() {
        let raw = MemoryKv::new();
        let kv: Arc<dyn TxnKv> = raw.clone();
        raw.insert(&keys::instance_key("a"), Bytes::from_static(b"{}"));
        raw.fail_range_after(0);

        assert!(matches!(
            get_all_instances(&kv).await,
            Err(ParallaxError::TruncatedScan { .. })
        ));
    }

    #[tokio::test]
    async fn transient_create_txn_failure_surfaces() {
        let raw = MemoryKv::new();
        let kv: Arc<dyn TxnKv> = raw.clone();
        raw.fail_next_create_txn();

        assert!(prepare_instance_check_job(&kv, "i1", "host-a:5000", 60_000)
            .await
            .is_err());
    }
}
