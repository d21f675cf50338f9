//! Per-instance reconciliation
//!
//! The forward check walks every committed rowset in KV order and
//! confirms each claimed segment object exists; the inverted check walks
//! every data object and confirms its rowset still exists. Both directions
//! stream, keeping memory bounded by a single-tablet cache. Rowsets of one
//! tablet are adjacent in key order, so each tablet is listed exactly once.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::accessor::{AccessorFactory, AccessorKind};
use crate::checker::jobs::key_exists;
use crate::checker::CheckOutcome;
use crate::error::{ParallaxError, Result};
use crate::keys;
use crate::kv::{FullRangeIter, RangeGetOptions, TxnKv};
use crate::metrics::metrics;
use crate::model::{decode, InstanceInfo, RowsetMeta};
use crate::vault::{parse_segment_path, StorageVault, VaultRegistry};

/// Checks one instance. Shared between the worker running it and the
/// coordinator's working map, so the lease loop can signal stop through
/// the same handle.
pub struct InstanceChecker {
    kv: Arc<dyn TxnKv>,
    instance_id: String,
    registry: VaultRegistry,
    stopped: AtomicBool,
}

/// Counters of one forward run, published on every exit path.
struct CheckStats {
    instance_id: String,
    start: Instant,
    num_scanned: i64,
    num_scanned_with_segment: i64,
    num_check_failed: i64,
    instance_volume: i64,
}

impl CheckStats {
    fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            start: Instant::now(),
            num_scanned: 0,
            num_scanned_with_segment: 0,
            num_check_failed: 0,
            instance_volume: 0,
        }
    }
}

impl Drop for CheckStats {
    fn drop(&mut self) {
        let cost_s = self.start.elapsed().as_secs_f64();
        info!(
            instance_id = %self.instance_id,
            num_scanned = self.num_scanned,
            num_scanned_with_segment = self.num_scanned_with_segment,
            num_check_failed = self.num_check_failed,
            instance_volume = self.instance_volume,
            cost_s,
            "check instance objects finished"
        );
        let m = metrics();
        let id = self.instance_id.as_str();
        m.num_scanned.with_label_values(&[id]).set(self.num_scanned);
        m.num_scanned_with_segment
            .with_label_values(&[id])
            .set(self.num_scanned_with_segment);
        m.num_check_failed
            .with_label_values(&[id])
            .set(self.num_check_failed);
        m.instance_volume
            .with_label_values(&[id])
            .set(self.instance_volume);
        m.check_cost_s
            .with_label_values(&[id])
            .set(cost_s as i64);
    }
}

/// File set of the tablet currently being checked.
struct TabletFiles {
    tablet_id: i64,
    files: HashSet<String>,
    vault: StorageVault,
}

/// Rowset ids of the tablet currently being inverse-checked.
struct TabletRowsets {
    tablet_id: i64,
    rowset_ids: HashSet<String>,
}

impl InstanceChecker {
    /// Build a checker with a fully resolved vault registry. Any vault
    /// that cannot be resolved fails init; scanning with a partial
    /// registry would misreport its rowsets.
    pub async fn init(
        kv: Arc<dyn TxnKv>,
        factory: &dyn AccessorFactory,
        instance: &InstanceInfo,
    ) -> Result<Self> {
        let registry = VaultRegistry::init(kv.clone(), factory, instance).await?;
        Ok(Self {
            kv,
            instance_id: instance.instance_id.clone(),
            registry,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Ask the checker to abort at its next iteration boundary.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Forward reconciliation: KV catalog against vault contents.
    ///
    /// `Ok(Clean)` means every claimed segment was found.
    /// `Ok(Divergent)` means the scan completed but found divergences;
    /// counters carry the details. `Err` is terminal: the scan could not
    /// complete and nothing may be concluded about the instance.
    pub async fn do_check(&self) -> Result<CheckOutcome> {
        info!(instance_id = %self.instance_id, "begin to check instance objects");
        let mut stats = CheckStats::new(&self.instance_id);
        let mut cache: Option<TabletFiles> = None;

        let (begin, end) = keys::meta_rowset_range(&self.instance_id);
        let mut iter = FullRangeIter::new(
            self.kv.clone(),
            &begin,
            &end,
            RangeGetOptions::default(),
        );

        while let Some((key, value)) = iter.next().await {
            if self.stopped() {
                return Err(ParallaxError::Stopped);
            }

            let rowset: RowsetMeta = match decode(&value) {
                Ok(rowset) => rowset,
                Err(e) => {
                    stats.num_check_failed += 1;
                    warn!(
                        instance_id = %self.instance_id,
                        key = %keys::hex(&key),
                        error = %e,
                        "malformed rowset meta"
                    );
                    continue;
                }
            };

            stats.num_scanned += 1;
            if rowset.num_segments == 0 {
                continue;
            }
            stats.num_scanned_with_segment += 1;

            self.check_rowset_objects(&rowset, &key, &mut cache, &mut stats)
                .await?;
        }

        if !iter.is_valid() {
            warn!(instance_id = %self.instance_id, "failed to scan rowset metas");
            return Err(ParallaxError::TruncatedScan { begin });
        }

        if stats.num_check_failed == 0 {
            Ok(CheckOutcome::Clean)
        } else {
            Ok(CheckOutcome::Divergent)
        }
    }

    async fn check_rowset_objects(
        &self,
        rowset: &RowsetMeta,
        key: &str,
        cache: &mut Option<TabletFiles>,
        stats: &mut CheckStats,
    ) -> Result<()> {
        let cached_tablet = cache.as_ref().map(|c| c.tablet_id);
        if cached_tablet != Some(rowset.tablet_id) {
            *cache = None;

            let Some(vault) = self.registry.get(&rowset.resource_id) else {
                // A vault added after init lands here; stale registries
                // are surfaced as failures rather than ignored.
                stats.num_check_failed += 1;
                warn!(
                    instance_id = %self.instance_id,
                    resource_id = %rowset.resource_id,
                    tablet_id = rowset.tablet_id,
                    rowset_id = %rowset.rowset_id_v2,
                    "resource id not found in vault registry"
                );
                return Ok(());
            };

            let tablet_path = vault.tablet_path(rowset.tablet_id);
            let mut list_iter = match vault.accessor().list_directory(&tablet_path).await {
                Ok(list_iter) => list_iter,
                Err(_) => {
                    // The accessor already logged the failure.
                    stats.num_check_failed += 1;
                    return Ok(());
                }
            };

            let mut files = HashSet::new();
            let mut tablet_volume: i64 = 0;
            while let Some(file) = list_iter.next().await {
                if self.stopped() {
                    return Err(ParallaxError::Stopped);
                }
                tablet_volume += file.size as i64;
                files.insert(file.path);
            }
            if !list_iter.is_valid() {
                stats.num_check_failed += 1;
                return Ok(());
            }

            stats.instance_volume += tablet_volume;
            *cache = Some(TabletFiles {
                tablet_id: rowset.tablet_id,
                files,
                vault: vault.clone(),
            });
        }

        let tablet_files = cache.as_ref().expect("tablet cache populated above");

        for seg_idx in 0..rowset.num_segments {
            let path =
                tablet_files
                    .vault
                    .segment_path(rowset.tablet_id, &rowset.rowset_id_v2, seg_idx);
            if tablet_files.files.contains(&path) {
                continue;
            }

            // Not in the listing. The rowset may have been deleted between
            // the listing and now; a re-read of its key disambiguates.
            match key_exists(&self.kv, key).await {
                Ok(false) => continue,
                Ok(true) => {
                    stats.num_check_failed += 1;
                    warn!(
                        instance_id = %self.instance_id,
                        path = %path,
                        key = %keys::hex(key),
                        "object not exist"
                    );
                }
                Err(e) => {
                    stats.num_check_failed += 1;
                    warn!(
                        instance_id = %self.instance_id,
                        path = %path,
                        key = %keys::hex(key),
                        error = %e,
                        "failed to re-read rowset key for missing object"
                    );
                }
            }
        }

        Ok(())
    }

    /// Inverted reconciliation: vault contents against the KV catalog.
    ///
    /// Flags objects whose rowset no longer exists. Unlike the forward
    /// direction, an unparsable path is itself a divergence (an orphan by
    /// definition), while KV and listing failures are terminal.
    pub async fn do_inverted_check(&self) -> Result<CheckOutcome> {
        info!(instance_id = %self.instance_id, "begin to inverted check instance objects");
        let start = Instant::now();
        let mut num_scanned: i64 = 0;
        let mut num_check_failed: i64 = 0;

        let result = self
            .inverted_check_vaults(&mut num_scanned, &mut num_check_failed)
            .await;

        info!(
            instance_id = %self.instance_id,
            num_scanned,
            num_check_failed,
            cost_s = start.elapsed().as_secs_f64(),
            "inverted check instance objects finished"
        );

        result?;
        if num_check_failed == 0 {
            Ok(CheckOutcome::Clean)
        } else {
            Ok(CheckOutcome::Divergent)
        }
    }

    async fn inverted_check_vaults(
        &self,
        num_scanned: &mut i64,
        num_check_failed: &mut i64,
    ) -> Result<()> {
        let mut cache: Option<TabletRowsets> = None;

        for vault in self.registry.iter() {
            let accessor = vault.accessor();
            let mut list_iter = accessor.list_directory("data").await?;

            while let Some(file) = list_iter.next().await {
                if self.stopped() {
                    return Err(ParallaxError::Stopped);
                }
                *num_scanned += 1;
                if !self.segment_file_known(&file.path, &mut cache).await? {
                    *num_check_failed += 1;
                    warn!(
                        instance_id = %self.instance_id,
                        uri = %accessor.uri(),
                        path = %file.path,
                        "orphan or unparsable data object"
                    );
                }
            }

            if !list_iter.is_valid() {
                warn!(
                    instance_id = %self.instance_id,
                    uri = %accessor.uri(),
                    "failed to list data directory"
                );
                return Err(ParallaxError::Accessor(
                    crate::accessor::AccessorError::Backend {
                        backend: "vault",
                        message: format!("listing truncated under {}", accessor.uri()),
                    },
                ));
            }
        }

        Ok(())
    }

    /// Whether a data object's owning rowset still exists in the KV.
    async fn segment_file_known(
        &self,
        path: &str,
        cache: &mut Option<TabletRowsets>,
    ) -> Result<bool> {
        let Some((tablet_id, rowset_id)) = parse_segment_path(path) else {
            return Ok(false);
        };

        if cache.as_ref().map(|c| c.tablet_id) != Some(tablet_id) {
            let (begin, end) = keys::meta_rowset_tablet_range(&self.instance_id, tablet_id);
            let mut iter = FullRangeIter::new(
                self.kv.clone(),
                &begin,
                &end,
                RangeGetOptions::default(),
            );
            let mut rowset_ids = HashSet::new();
            while let Some((key, value)) = iter.next().await {
                let rowset: RowsetMeta =
                    decode(&value).map_err(|source| ParallaxError::MalformedRecord {
                        key: keys::hex(&key),
                        source,
                    })?;
                rowset_ids.insert(rowset.rowset_id_v2);
            }
            if !iter.is_valid() {
                warn!(instance_id = %self.instance_id, tablet_id, "failed to scan tablet rowsets");
                return Err(ParallaxError::TruncatedScan { begin });
            }
            *cache = Some(TabletRowsets {
                tablet_id,
                rowset_ids,
            });
        }

        let tablet_rowsets = cache.as_ref().expect("tablet rowset cache populated above");
        Ok(tablet_rowsets.rowset_ids.contains(&rowset_id))
    }

    /// Minimum bucket lifecycle days across this instance's S3 vaults,
    /// or `i64::MAX` when no S3 vault exists. Versioning must be enabled
    /// on every inspected bucket, otherwise deleted objects would be
    /// unrecoverable regardless of lifecycle headroom.
    pub async fn bucket_lifecycle_days(&self) -> Result<i64> {
        let mut min_days = i64::MAX;
        for vault in self.registry.iter() {
            let accessor = vault.accessor();
            if accessor.kind() != AccessorKind::S3 {
                continue;
            }
            accessor.check_versioning().await?;
            let days = accessor.bucket_lifecycle_days().await?;
            min_days = min_days.min(days);
        }
        Ok(min_days)
    }
}
