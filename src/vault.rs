//! Storage vaults and the per-instance vault registry
//!
//! A vault pairs a path layout with an accessor for the backing store.
//! The registry is built once per checker run from the instance's legacy
//! object store descriptors plus the vault records in the KV; a rowset's
//! `resource_id` then resolves with a single map probe.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::accessor::{Accessor, AccessorFactory};
use crate::error::{ParallaxError, Result};
use crate::keys;
use crate::kv::{FullRangeIter, RangeGetOptions, TxnKv};
use crate::model::{decode, InstanceInfo, StorageVaultDesc};

/// Object path layout of a vault.
///
/// V0 keeps every tablet directly under `data/`. V1 namespaces tablets
/// into fixed shard directories so no single listing prefix grows
/// unbounded. The tail of a path (`{tablet_id}/{rowset_id}_{seg}.dat`) is
/// identical in both, which is what [`parse_segment_path`] relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathLayout {
    V0,
    V1,
}

impl PathLayout {
    fn from_version(version: u8) -> Option<Self> {
        match version {
            0 => Some(PathLayout::V0),
            1 => Some(PathLayout::V1),
            _ => None,
        }
    }
}

const V1_SHARDS: i64 = 1024;

/// A named backing store with its accessor.
#[derive(Clone)]
pub struct StorageVault {
    id: String,
    layout: PathLayout,
    accessor: Arc<dyn Accessor>,
}

impl StorageVault {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn accessor(&self) -> &Arc<dyn Accessor> {
        &self.accessor
    }

    /// Directory holding every segment of one tablet.
    pub fn tablet_path(&self, tablet_id: i64) -> String {
        match self.layout {
            PathLayout::V0 => format!("data/{tablet_id}"),
            PathLayout::V1 => format!("data/{}/{tablet_id}", tablet_id % V1_SHARDS),
        }
    }

    /// Object path of one segment. Always extends
    /// [`tablet_path`](StorageVault::tablet_path) of the same tablet.
    pub fn segment_path(&self, tablet_id: i64, rowset_id: &str, seg_idx: u32) -> String {
        format!(
            "{}/{rowset_id}_{seg_idx}.dat",
            self.tablet_path(tablet_id)
        )
    }
}

/// Resolves `resource_id` to a vault for one instance.
pub struct VaultRegistry {
    vaults: HashMap<String, StorageVault>,
}

impl VaultRegistry {
    /// Build the registry for an instance.
    ///
    /// Any vault that fails to deserialize or construct is fatal, as is a
    /// vault scan that does not complete: operating on a partial registry
    /// would misreport every rowset of the missing vaults.
    pub async fn init(
        kv: Arc<dyn TxnKv>,
        factory: &dyn AccessorFactory,
        instance: &InstanceInfo,
    ) -> Result<Self> {
        let mut vaults = HashMap::new();

        for obj_info in &instance.obj_info {
            let desc = StorageVaultDesc::from(obj_info);
            let vault = Self::build_vault(factory, &desc).await?;
            vaults.insert(desc.id.clone(), vault);
        }

        if !instance.resource_ids.is_empty() {
            let (begin, end) = keys::storage_vault_range(&instance.instance_id);
            let mut iter =
                FullRangeIter::new(kv, &begin, &end, RangeGetOptions::default());
            while let Some((key, value)) = iter.next().await {
                let desc: StorageVaultDesc =
                    decode(&value).map_err(|source| ParallaxError::MalformedRecord {
                        key: keys::hex(&key),
                        source,
                    })?;
                let vault = Self::build_vault(factory, &desc).await?;
                vaults.insert(desc.id.clone(), vault);
            }
            if !iter.is_valid() {
                warn!(
                    instance_id = %instance.instance_id,
                    "failed to scan storage vault records"
                );
                return Err(ParallaxError::TruncatedScan { begin });
            }
        }

        Ok(Self { vaults })
    }

    async fn build_vault(
        factory: &dyn AccessorFactory,
        desc: &StorageVaultDesc,
    ) -> Result<StorageVault> {
        let layout = PathLayout::from_version(desc.path_layout_version).ok_or_else(|| {
            ParallaxError::VaultInit {
                resource_id: desc.id.clone(),
                reason: format!("unknown path layout version {}", desc.path_layout_version),
            }
        })?;
        let accessor =
            factory
                .build(desc)
                .await
                .map_err(|e| ParallaxError::VaultInit {
                    resource_id: desc.id.clone(),
                    reason: e.to_string(),
                })?;
        Ok(StorageVault {
            id: desc.id.clone(),
            layout,
            accessor,
        })
    }

    pub fn get(&self, resource_id: &str) -> Option<&StorageVault> {
        self.vaults.get(resource_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StorageVault> {
        self.vaults.values()
    }

    pub fn len(&self) -> usize {
        self.vaults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }
}

/// Parse `(tablet_id, rowset_id)` out of a data object path.
///
/// Grammar (current layouts): `data/[{shard}/]{tablet_id}/{rowset_id}_{seg}.dat`.
/// The tablet directory and filename are always the last two components,
/// so the parser reads from the tail and tolerates namespacing prefixes.
/// Returns `None` for anything that does not parse; on the inverted check
/// path that is reported as an orphan, never as a terminal error.
pub fn parse_segment_path(path: &str) -> Option<(i64, String)> {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.len() < 3 {
        return None;
    }

    let tablet_id: i64 = parts[parts.len() - 2].parse().ok()?;
    if tablet_id <= 0 {
        return None;
    }

    let file = parts[parts.len() - 1];
    let stem = file.strip_suffix(".dat")?;
    let underscore = stem.rfind('_')?;
    let (rowset_id, seg) = stem.split_at(underscore);
    if rowset_id.is_empty() {
        return None;
    }
    seg[1..].parse::<u32>().ok()?;

    Some((tablet_id, rowset_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::{MockAccessor, MockAccessorFactory};
    use crate::kv::MemoryKv;
    use crate::model::{encode, InstanceStatus, VaultKindDesc};

    fn vault_with_layout(layout: PathLayout) -> StorageVault {
        StorageVault {
            id: "v1".to_string(),
            layout,
            accessor: MockAccessor::new("mock://v1"),
        }
    }

    #[test]
    fn v0_paths_are_flat() {
        let vault = vault_with_layout(PathLayout::V0);
        assert_eq!(vault.tablet_path(10003), "data/10003");
        assert_eq!(
            vault.segment_path(10003, "02000000a1", 1),
            "data/10003/02000000a1_1.dat"
        );
    }

    #[test]
    fn v1_paths_are_sharded_and_nested() {
        let vault = vault_with_layout(PathLayout::V1);
        let tablet = vault.tablet_path(10003);
        let segment = vault.segment_path(10003, "02000000a1", 0);
        assert_eq!(tablet, format!("data/{}/10003", 10003 % 1024));
        assert!(segment.starts_with(&format!("{tablet}/")));
    }

    #[test]
    fn segment_path_extends_tablet_path() {
        for layout in [PathLayout::V0, PathLayout::V1] {
            let vault = vault_with_layout(layout);
            for tablet_id in [1, 77, 4096, 999_983] {
                let prefix = vault.tablet_path(tablet_id);
                let path = vault.segment_path(tablet_id, "rs", 3);
                assert!(path.starts_with(&format!("{prefix}/")));
            }
        }
    }

    #[test]
    fn parse_round_trips_both_layouts() {
        for layout in [PathLayout::V0, PathLayout::V1] {
            let vault = vault_with_layout(layout);
            let path = vault.segment_path(10003, "02000000a1", 7);
            assert_eq!(
                parse_segment_path(&path),
                Some((10003, "02000000a1".to_string()))
            );
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(parse_segment_path("data/10/short"), None);
        assert_eq!(parse_segment_path("loose.dat"), None);
        assert_eq!(parse_segment_path("data/not-a-tablet/r_0.dat"), None);
        assert_eq!(parse_segment_path("data/0/r_0.dat"), None);
        assert_eq!(parse_segment_path("data/10/noseg.dat"), None);
        assert_eq!(parse_segment_path("data/10/r_x.dat"), None);
        assert_eq!(parse_segment_path("data/10/_0.dat"), None);
    }

    #[tokio::test]
    async fn registry_init_builds_from_obj_info_and_kv() {
        let kv = MemoryKv::new();
        let factory = MockAccessorFactory::new();
        factory.register("legacy-1", MockAccessor::new("mock://legacy"));
        factory.register("v1", MockAccessor::new("mock://v1"));

        let instance = InstanceInfo {
            instance_id: "inst".to_string(),
            status: InstanceStatus::Normal,
            ctime_ms: 0,
            obj_info: vec![crate::model::ObjectStoreInfo {
                id: "legacy-1".to_string(),
                bucket: "b".to_string(),
                prefix: String::new(),
                endpoint: None,
                region: None,
                ak: None,
                sk: None,
            }],
            resource_ids: vec!["v1".to_string()],
        };
        kv.insert(
            &keys::storage_vault_key("inst", "v1"),
            encode(&StorageVaultDesc {
                id: "v1".to_string(),
                kind: VaultKindDesc::Hdfs {
                    root: "/mnt".to_string(),
                },
                path_layout_version: 1,
            }),
        );

        let registry = VaultRegistry::init(kv, factory.as_ref(), &instance)
            .await
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get("legacy-1").is_some());
        assert!(registry.get("v1").is_some());
        assert!(registry.get("v2").is_none());
    }

    #[tokio::test]
    async fn registry_init_fails_on_malformed_vault() {
        let kv = MemoryKv::new();
        let factory = MockAccessorFactory::new();

        let instance = InstanceInfo {
            instance_id: "inst".to_string(),
            status: InstanceStatus::Normal,
            ctime_ms: 0,
            obj_info: vec![],
            resource_ids: vec!["v1".to_string()],
        };
        kv.insert(
            &keys::storage_vault_key("inst", "v1"),
            bytes::Bytes::from_static(b"{broken"),
        );

        let result = VaultRegistry::init(kv, factory.as_ref(), &instance).await;
        assert!(matches!(
            result,
            Err(ParallaxError::MalformedRecord { .. })
        ));
    }

    #[tokio::test]
    async fn registry_init_fails_on_truncated_vault_scan() {
        let kv = MemoryKv::new();
        let factory = MockAccessorFactory::new();
        factory.register("v1", MockAccessor::new("mock://v1"));

        let instance = InstanceInfo {
            instance_id: "inst".to_string(),
            status: InstanceStatus::Normal,
            ctime_ms: 0,
            obj_info: vec![],
            resource_ids: vec!["v1".to_string()],
        };
        kv.insert(
            &keys::storage_vault_key("inst", "v1"),
            encode(&StorageVaultDesc {
                id: "v1".to_string(),
                kind: VaultKindDesc::Hdfs {
                    root: "/mnt".to_string(),
                },
                path_layout_version: 0,
            }),
        );
        kv.fail_range_after(0);

        let result = VaultRegistry::init(kv, factory.as_ref(), &instance).await;
        assert!(matches!(result, Err(ParallaxError::TruncatedScan { .. })));
    }
}
