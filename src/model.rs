//! Records stored in the transactional KV
//!
//! The control plane owns every record here except [`JobRecycle`]; the
//! checker reads tenant metadata and only writes job records. Values are
//! JSON. Decoding is always treated as fallible at the call site because
//! a malformed record must never poison a whole scan.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Normal,
    Deleted,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        InstanceStatus::Normal
    }
}

/// Legacy object store descriptor attached directly to an instance.
///
/// Predates named storage vaults; maps to an S3 vault with the flat v0
/// path layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStoreInfo {
    pub id: String,
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub ak: Option<String>,
    #[serde(default)]
    pub sk: Option<String>,
}

/// Identity of a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub ctime_ms: i64,
    #[serde(default)]
    pub obj_info: Vec<ObjectStoreInfo>,
    #[serde(default)]
    pub resource_ids: Vec<String>,
}

/// Backing store variants of a storage vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum VaultKindDesc {
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        ak: Option<String>,
        #[serde(default)]
        sk: Option<String>,
    },
    Hdfs {
        /// Filesystem root the vault's data lives under, reachable through
        /// the gateway mount configured on every checker host.
        root: String,
    },
}

/// A named backing store for one or more instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageVaultDesc {
    pub id: String,
    #[serde(flatten)]
    pub kind: VaultKindDesc,
    /// 0 = legacy flat layout, 1 = namespaced layout.
    #[serde(default)]
    pub path_layout_version: u8,
}

impl From<&ObjectStoreInfo> for StorageVaultDesc {
    fn from(info: &ObjectStoreInfo) -> Self {
        StorageVaultDesc {
            id: info.id.clone(),
            kind: VaultKindDesc::S3 {
                bucket: info.bucket.clone(),
                prefix: info.prefix.clone(),
                endpoint: info.endpoint.clone(),
                region: info.region.clone(),
                ak: info.ak.clone(),
                sk: info.sk.clone(),
            },
            path_layout_version: 0,
        }
    }
}

/// A committed rowset of one tablet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsetMeta {
    pub tablet_id: i64,
    pub rowset_id_v2: String,
    /// Names the vault holding this rowset's segments.
    pub resource_id: String,
    pub num_segments: u32,
    #[serde(default)]
    pub version: i64,
}

/// State of a per-instance job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Idle,
    Busy,
}

/// Coordination record for one instance's check job.
///
/// At most one record exists per instance; all writes go through single
/// KV transactions so the lease transfer is atomic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecycle {
    pub instance_id: String,
    pub owner_endpoint: String,
    pub lease_expiration_ms: i64,
    pub status: JobStatus,
    /// Epoch ms when the current or last job started.
    #[serde(default)]
    pub last_ctime_ms: Option<i64>,
    #[serde(default)]
    pub last_success_time_ms: Option<i64>,
}

/// Decode a KV value.
pub fn decode<T: DeserializeOwned>(value: &[u8]) -> serde_json::Result<T> {
    serde_json::from_slice(value)
}

/// Encode a KV value.
pub fn encode<T: Serialize>(value: &T) -> Bytes {
    Bytes::from(serde_json::to_vec(value).expect("kv record serialization is infallible"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_info_roundtrip() {
        let info = InstanceInfo {
            instance_id: "inst-1".to_string(),
            status: InstanceStatus::Normal,
            ctime_ms: 1_700_000_000_000,
            obj_info: vec![],
            resource_ids: vec!["v1".to_string()],
        };
        let decoded: InstanceInfo = decode(&encode(&info)).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn vault_desc_tagged_by_type() {
        let desc = StorageVaultDesc {
            id: "v1".to_string(),
            kind: VaultKindDesc::Hdfs {
                root: "/mnt/hdfs/warehouse".to_string(),
            },
            path_layout_version: 1,
        };
        let json = String::from_utf8(encode(&desc).to_vec()).unwrap();
        assert!(json.contains("\"type\":\"HDFS\""));
        let decoded: StorageVaultDesc = decode(json.as_bytes()).unwrap();
        assert_eq!(decoded, desc);
    }

    #[test]
    fn legacy_obj_info_maps_to_flat_s3_vault() {
        let info = ObjectStoreInfo {
            id: "legacy-1".to_string(),
            bucket: "warehouse".to_string(),
            prefix: "tenant-a".to_string(),
            endpoint: None,
            region: None,
            ak: None,
            sk: None,
        };
        let desc = StorageVaultDesc::from(&info);
        assert_eq!(desc.id, "legacy-1");
        assert_eq!(desc.path_layout_version, 0);
        assert!(matches!(desc.kind, VaultKindDesc::S3 { .. }));
    }

    #[test]
    fn malformed_record_is_an_error_not_a_panic() {
        assert!(decode::<RowsetMeta>(b"{not json").is_err());
        assert!(decode::<RowsetMeta>(b"{\"tablet_id\": \"nope\"}").is_err());
    }
}
