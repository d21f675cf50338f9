//! In-memory accessor test double
//!
//! Backs the integration tests: holds a flat path map, counts listings,
//! and can inject latency and failures so tests can hold a check mid-run
//! or drive the truncated-listing paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    dir_prefix, Accessor, AccessorError, AccessorFactory, AccessorKind, AccessorResult, FileMeta,
    ListIter,
};
use crate::model::StorageVaultDesc;

/// In-memory object store.
pub struct MockAccessor {
    kind: AccessorKind,
    uri: String,
    files: Mutex<BTreeMap<String, u64>>,
    list_calls: AtomicU64,
    list_delay: Mutex<Duration>,
    fail_listing: AtomicBool,
    lifecycle_days: Mutex<Option<i64>>,
    versioning_enabled: AtomicBool,
}

impl MockAccessor {
    pub fn new(uri: &str) -> Arc<Self> {
        Arc::new(Self {
            kind: AccessorKind::S3,
            uri: uri.to_string(),
            files: Mutex::new(BTreeMap::new()),
            list_calls: AtomicU64::new(0),
            list_delay: Mutex::new(Duration::ZERO),
            fail_listing: AtomicBool::new(false),
            lifecycle_days: Mutex::new(None),
            versioning_enabled: AtomicBool::new(true),
        })
    }

    pub fn with_kind(uri: &str, kind: AccessorKind) -> Arc<Self> {
        let mut accessor = Self::new(uri);
        Arc::get_mut(&mut accessor).unwrap().kind = kind;
        accessor
    }

    pub fn insert_file(&self, path: &str, size: u64) {
        self.files.lock().unwrap().insert(path.to_string(), size);
    }

    pub fn remove_file(&self, path: &str) {
        self.files.lock().unwrap().remove(path);
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }

    /// Number of `list_directory` calls served so far.
    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Delay every listing, keeping a check in flight long enough for
    /// lease and stop machinery to act on it.
    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = delay;
    }

    /// Make every listing fail until cleared.
    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub fn set_lifecycle_days(&self, days: Option<i64>) {
        *self.lifecycle_days.lock().unwrap() = days;
    }

    pub fn set_versioning_enabled(&self, enabled: bool) {
        self.versioning_enabled.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl Accessor for MockAccessor {
    fn kind(&self) -> AccessorKind {
        self.kind
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    async fn list_directory(&self, prefix: &str) -> AccessorResult<ListIter> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.list_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(AccessorError::Backend {
                backend: "mock",
                message: "injected listing failure".to_string(),
            });
        }

        let wanted = dir_prefix(prefix);
        let files = self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path.starts_with(&wanted))
            .map(|(path, size)| FileMeta {
                path: path.clone(),
                size: *size,
            })
            .collect();
        Ok(ListIter::from_vec(files))
    }

    async fn exists(&self, path: &str) -> AccessorResult<bool> {
        Ok(self.files.lock().unwrap().contains_key(path))
    }

    async fn check_versioning(&self) -> AccessorResult<()> {
        if self.versioning_enabled.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AccessorError::Backend {
                backend: "mock",
                message: "bucket versioning not enabled".to_string(),
            })
        }
    }

    async fn bucket_lifecycle_days(&self) -> AccessorResult<i64> {
        self.lifecycle_days
            .lock()
            .unwrap()
            .ok_or_else(|| AccessorError::Backend {
                backend: "mock",
                message: "no lifecycle rule".to_string(),
            })
    }
}

/// Factory resolving vault ids to pre-registered mock accessors.
pub struct MockAccessorFactory {
    accessors: Mutex<std::collections::HashMap<String, Arc<dyn Accessor>>>,
}

impl MockAccessorFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            accessors: Mutex::new(std::collections::HashMap::new()),
        })
    }

    pub fn register(&self, vault_id: &str, accessor: Arc<dyn Accessor>) {
        self.accessors
            .lock()
            .unwrap()
            .insert(vault_id.to_string(), accessor);
    }
}

#[async_trait]
impl AccessorFactory for MockAccessorFactory {
    async fn build(&self, desc: &StorageVaultDesc) -> AccessorResult<Arc<dyn Accessor>> {
        self.accessors
            .lock()
            .unwrap()
            .get(&desc.id)
            .cloned()
            .ok_or_else(|| AccessorError::Backend {
                backend: "mock",
                message: format!("no accessor registered for vault {}", desc.id),
            })
    }
}
