//! KV key layouts
//!
//! All keys are UTF-8 strings whose lexicographic order is the logical
//! order the scan algorithms rely on. Numeric components are zero-padded
//! to 20 digits so that lexicographic and numeric order agree; in
//! particular, rowset keys of one tablet are consecutive and tablets
//! ascend, which is what makes the per-tablet file cache in the forward
//! check correct.
//!
//! Range ends exploit ASCII ordering: `'/'` (0x2F) sorts immediately
//! before `'0'` (0x30), so replacing a trailing separator with `'0'`
//! yields the tightest exclusive upper bound for a prefix.

/// Width numeric key components are padded to.
const NUM_WIDTH: usize = 20;

/// Key of one instance record: `instance/{instance_id}`
pub fn instance_key(instance_id: &str) -> String {
    format!("instance/{instance_id}")
}

/// Half-open range covering every instance record.
pub fn instance_range() -> (String, String) {
    ("instance/".to_string(), "instance0".to_string())
}

/// Key of one storage vault descriptor:
/// `storage_vault/{instance_id}/{vault_id}`
pub fn storage_vault_key(instance_id: &str, vault_id: &str) -> String {
    format!("storage_vault/{instance_id}/{vault_id}")
}

/// Half-open range covering all vault descriptors of one instance.
pub fn storage_vault_range(instance_id: &str) -> (String, String) {
    (
        format!("storage_vault/{instance_id}/"),
        format!("storage_vault/{instance_id}0"),
    )
}

/// Key of one committed rowset meta:
/// `meta/{instance_id}/rowset/{tablet_id}/{version}`
pub fn meta_rowset_key(instance_id: &str, tablet_id: i64, version: i64) -> String {
    debug_assert!(tablet_id >= 0 && version >= 0);
    format!("meta/{instance_id}/rowset/{tablet_id:0NUM_WIDTH$}/{version:0NUM_WIDTH$}")
}

/// Half-open range covering every rowset meta of one instance.
pub fn meta_rowset_range(instance_id: &str) -> (String, String) {
    (
        meta_rowset_key(instance_id, 0, 0),
        meta_rowset_key(instance_id, i64::MAX, 0),
    )
}

/// Half-open range covering every rowset meta of one tablet.
pub fn meta_rowset_tablet_range(instance_id: &str, tablet_id: i64) -> (String, String) {
    (
        meta_rowset_key(instance_id, tablet_id, 0),
        meta_rowset_key(instance_id, tablet_id, i64::MAX),
    )
}

/// Key of the per-instance check job record: `job/{instance_id}/check`
pub fn job_check_key(instance_id: &str) -> String {
    format!("job/{instance_id}/check")
}

/// Hex rendering of a key for log lines.
pub fn hex(key: &str) -> String {
    key.bytes().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rowset_keys_order_by_tablet_then_version() {
        let a = meta_rowset_key("i1", 2, 900);
        let b = meta_rowset_key("i1", 10, 1);
        let c = meta_rowset_key("i1", 10, 2);
        assert!(a < b, "{a} !< {b}");
        assert!(b < c);
    }

    #[test]
    fn rowset_range_covers_all_tablets() {
        let (begin, end) = meta_rowset_range("i1");
        let key = meta_rowset_key("i1", 123_456_789, i64::MAX - 1);
        assert!(begin <= key && key < end);
    }

    #[test]
    fn tablet_range_excludes_neighbors() {
        let (begin, end) = meta_rowset_tablet_range("i1", 10);
        assert!(meta_rowset_key("i1", 10, 0) >= begin);
        assert!(meta_rowset_key("i1", 10, 55) < end);
        assert!(meta_rowset_key("i1", 9, i64::MAX - 1) < begin);
        assert!(meta_rowset_key("i1", 11, 0) >= end);
    }

    #[test]
    fn instance_range_excludes_other_prefixes() {
        let (begin, end) = instance_range();
        assert!(instance_key("zzz") > begin && instance_key("zzz") < end);
        assert!(storage_vault_key("a", "b") >= end);
    }

    #[test]
    fn vault_range_scoped_to_instance() {
        let (begin, end) = storage_vault_range("inst");
        assert!(storage_vault_key("inst", "v9") < end);
        assert!(storage_vault_key("inst", "v9") > begin);
        assert!(storage_vault_key("instz", "v1") >= end);
    }

    #[test]
    fn hex_is_stable() {
        assert_eq!(hex("ab"), "6162");
    }
}
