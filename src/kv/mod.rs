//! Consumer interface of the transactional KV store
//!
//! The checker is a pure client of the metadata service's KV: it needs
//! read/write transactions with optimistic conflict detection and ordered
//! range scans. [`MemoryKv`] provides the in-process implementation used
//! by tests and single-node deployments; production deployments plug in a
//! client for their KV service behind the same traits.
//!
//! Key-not-found is expressed as `Ok(None)` from [`Transaction::get`]
//! rather than an error kind, so `?` keeps flowing on the happy path.

pub mod memory;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::warn;

pub use memory::MemoryKv;

pub type TxnResult<T> = std::result::Result<T, TxnError>;

/// Error kinds surfaced by the KV client.
#[derive(Debug, Error)]
pub enum TxnError {
    /// Another transaction committed a conflicting write first. Retryable
    /// on the next scheduler tick.
    #[error("transaction conflict")]
    Conflict,

    /// The KV service could not be reached or failed mid-operation.
    /// Terminal for the current operation.
    #[error("kv transport error: {0}")]
    Transport(String),
}

impl TxnError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TxnError::Conflict)
    }
}

/// A single read/write transaction.
///
/// Writes are buffered locally and become visible atomically at
/// [`commit`](Transaction::commit), which must be called at most once.
#[async_trait]
pub trait Transaction: Send {
    /// Read one key. `Ok(None)` means the key does not exist.
    async fn get(&mut self, key: &str) -> TxnResult<Option<Bytes>>;

    /// Buffer a write.
    fn put(&mut self, key: &str, value: Bytes);

    /// Atomically apply buffered writes, failing with
    /// [`TxnError::Conflict`] if any read key changed since it was read.
    async fn commit(&mut self) -> TxnResult<()>;
}

/// Handle to the KV service.
#[async_trait]
pub trait TxnKv: Send + Sync {
    async fn create_txn(&self) -> TxnResult<Box<dyn Transaction>>;

    /// Fetch up to `limit` pairs from `[begin, end)` in key order.
    /// `more` indicates the range was not exhausted.
    async fn range_get(&self, begin: &str, end: &str, limit: usize) -> TxnResult<RangeBatch>;
}

/// One page of a range scan.
#[derive(Debug, Default)]
pub struct RangeBatch {
    pub entries: Vec<(String, Bytes)>,
    pub more: bool,
}

/// Options for [`FullRangeIter`].
#[derive(Debug, Clone)]
pub struct RangeGetOptions {
    /// Hint that the caller will consume the whole range, allowing the
    /// client to read ahead.
    pub prefetch: bool,
    /// Pairs fetched per page.
    pub batch_limit: usize,
}

impl Default for RangeGetOptions {
    fn default() -> Self {
        Self {
            prefetch: true,
            batch_limit: 1_000,
        }
    }
}

/// Paged iterator over a full key range.
///
/// Yields pairs in key order across page boundaries. When the underlying
/// scan fails mid-range the iterator ends early and [`is_valid`] turns
/// false; callers that require a complete scan must check it after
/// draining. Consuming a partial range as if it were complete is how a
/// checker would silently under-report, so every scan site checks.
///
/// [`is_valid`]: FullRangeIter::is_valid
pub struct FullRangeIter {
    kv: Arc<dyn TxnKv>,
    cursor: String,
    end: String,
    opts: RangeGetOptions,
    buf: VecDeque<(String, Bytes)>,
    exhausted: bool,
    valid: bool,
}

impl FullRangeIter {
    pub fn new(kv: Arc<dyn TxnKv>, begin: &str, end: &str, opts: RangeGetOptions) -> Self {
        Self {
            kv,
            cursor: begin.to_string(),
            end: end.to_string(),
            opts,
            buf: VecDeque::new(),
            exhausted: false,
            valid: true,
        }
    }

    /// Next pair, or `None` at the end of the range (check [`is_valid`]
    /// to distinguish completion from truncation).
    ///
    /// [`is_valid`]: FullRangeIter::is_valid
    pub async fn next(&mut self) -> Option<(String, Bytes)> {
        if self.buf.is_empty() && !self.exhausted {
            self.fill().await;
        }
        self.buf.pop_front()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    async fn fill(&mut self) {
        match self
            .kv
            .range_get(&self.cursor, &self.end, self.opts.batch_limit)
            .await
        {
            Ok(batch) => {
                if let Some((last_key, _)) = batch.entries.last() {
                    // Skip past the last delivered key on the next page.
                    self.cursor = format!("{last_key}\0");
                }
                if !batch.more || batch.entries.is_empty() {
                    self.exhausted = true;
                }
                self.buf.extend(batch.entries);
            }
            Err(e) => {
                warn!(error = %e, cursor = %self.cursor, "range scan failed, iterator truncated");
                self.valid = false;
                self.exhausted = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;

    fn opts(batch_limit: usize) -> RangeGetOptions {
        RangeGetOptions {
            prefetch: true,
            batch_limit,
        }
    }

    #[tokio::test]
    async fn full_range_iter_pages_in_order() {
        let kv = MemoryKv::new();
        for i in 0..7 {
            kv.insert(&format!("k/{i}"), Bytes::from(format!("v{i}")));
        }
        kv.insert("other/0", Bytes::from_static(b"x"));

        let kv: Arc<dyn TxnKv> = kv;
        let mut iter = FullRangeIter::new(kv, "k/", "k0", opts(2));
        let mut keys = Vec::new();
        while let Some((k, _)) = iter.next().await {
            keys.push(k);
        }

        assert!(iter.is_valid());
        assert_eq!(keys.len(), 7);
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[tokio::test]
    async fn truncated_scan_flips_is_valid() {
        let kv = MemoryKv::new();
        for i in 0..10 {
            kv.insert(&format!("k/{i}"), Bytes::from_static(b"v"));
        }
        kv.fail_range_after(2);

        let kv_dyn: Arc<dyn TxnKv> = kv;
        let mut iter = FullRangeIter::new(kv_dyn, "k/", "k0", opts(3));
        let mut n = 0;
        while iter.next().await.is_some() {
            n += 1;
        }

        assert_eq!(n, 6);
        assert!(!iter.is_valid());
    }
}
