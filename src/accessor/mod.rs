//! Object store accessors
//!
//! A vault's accessor can list a prefix, probe a single object, and (for
//! S3 vaults) report bucket versioning and lifecycle settings. All paths
//! crossing this interface are vault-root-relative with `/` separators;
//! accessors fold their own bucket/prefix or mount root in and out, so
//! the reconciliation code never sees absolute locations.

pub mod fs;
pub mod mock;
pub mod s3;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tracing::warn;

use crate::model::StorageVaultDesc;

pub use fs::FsAccessor;
pub use mock::{MockAccessor, MockAccessorFactory};
pub use s3::S3Accessor;

pub type AccessorResult<T> = std::result::Result<T, AccessorError>;

/// Errors surfaced by object store accessors.
#[derive(Debug, Error)]
pub enum AccessorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{backend} error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    #[error("operation {op} unsupported by {backend} accessor")]
    Unsupported {
        backend: &'static str,
        op: &'static str,
    },
}

/// Kind of backing store behind an accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessorKind {
    S3,
    Hdfs,
}

/// One object in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Vault-root-relative path.
    pub path: String,
    pub size: u64,
}

/// Streamed listing result.
///
/// Ends early on a mid-stream error; [`is_valid`](ListIter::is_valid)
/// distinguishes a complete listing from a truncated one. The accessor is
/// expected to have logged the underlying failure already, so consumers
/// only decide whether truncation is terminal for them.
pub struct ListIter {
    stream: Pin<Box<dyn Stream<Item = AccessorResult<FileMeta>> + Send>>,
    valid: bool,
}

impl ListIter {
    pub fn new(stream: Pin<Box<dyn Stream<Item = AccessorResult<FileMeta>> + Send>>) -> Self {
        Self {
            stream,
            valid: true,
        }
    }

    /// An already-complete listing.
    pub fn from_vec(files: Vec<FileMeta>) -> Self {
        Self::new(Box::pin(futures::stream::iter(files.into_iter().map(Ok))))
    }

    pub async fn next(&mut self) -> Option<FileMeta> {
        match self.stream.next().await {
            Some(Ok(file)) => Some(file),
            Some(Err(e)) => {
                warn!(error = %e, "listing truncated");
                self.valid = false;
                None
            }
            None => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Client of one backing store.
#[async_trait]
pub trait Accessor: Send + Sync {
    fn kind(&self) -> AccessorKind;

    /// Store location for log annotation, e.g. `s3://bucket/prefix`.
    fn uri(&self) -> &str;

    /// List every object under `prefix` (recursive). A trailing separator
    /// is implied, so `data/10` does not match `data/100/...`.
    async fn list_directory(&self, prefix: &str) -> AccessorResult<ListIter>;

    /// Whether a single object exists.
    async fn exists(&self, path: &str) -> AccessorResult<bool>;

    /// Verify bucket versioning is enabled. S3 only.
    async fn check_versioning(&self) -> AccessorResult<()> {
        Err(AccessorError::Unsupported {
            backend: "generic",
            op: "check_versioning",
        })
    }

    /// Configured object expiration in days. S3 only.
    async fn bucket_lifecycle_days(&self) -> AccessorResult<i64> {
        Err(AccessorError::Unsupported {
            backend: "generic",
            op: "bucket_lifecycle_days",
        })
    }
}

/// Builds accessors from vault descriptors.
///
/// The registry resolves descriptors through this seam so deployments can
/// swap client construction (credentials handling, endpoint overrides)
/// and tests can substitute in-memory stores.
#[async_trait]
pub trait AccessorFactory: Send + Sync {
    async fn build(&self, desc: &StorageVaultDesc) -> AccessorResult<Arc<dyn Accessor>>;
}

/// Normalize a listing prefix to always end in exactly one `/`.
pub(crate) fn dir_prefix(prefix: &str) -> String {
    format!("{}/", prefix.trim_end_matches('/'))
}
