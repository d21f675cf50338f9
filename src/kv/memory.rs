//! In-memory transactional KV
//!
//! An ordered map with per-key versions and optimistic concurrency:
//! transactions record the version of every key they read and commit only
//! if none changed. Serves tests and single-node deployments; the fault
//! injectors let tests exercise the transport-error and truncated-scan
//! paths that a real KV service produces under load.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;

use super::{RangeBatch, Transaction, TxnError, TxnKv, TxnResult};

#[derive(Debug, Clone)]
struct Versioned {
    value: Bytes,
    version: u64,
}

/// In-memory ordered KV with OCC transactions.
pub struct MemoryKv {
    map: Mutex<BTreeMap<String, Versioned>>,
    commit_seq: AtomicU64,
    fail_next_txn: AtomicBool,
    // Remaining successful range batches before injected failure; negative
    // disables injection.
    range_budget: AtomicI64,
    // Self-handle so transactions can outlive the borrow of create_txn.
    this: Weak<MemoryKv>,
}

impl MemoryKv {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            map: Mutex::new(BTreeMap::new()),
            commit_seq: AtomicU64::new(1),
            fail_next_txn: AtomicBool::new(false),
            range_budget: AtomicI64::new(-1),
            this: this.clone(),
        })
    }

    /// Insert directly, outside any transaction.
    pub fn insert(&self, key: &str, value: Bytes) {
        let version = self.commit_seq.fetch_add(1, Ordering::SeqCst);
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), Versioned { value, version });
    }

    /// Remove directly, outside any transaction.
    pub fn remove(&self, key: &str) {
        // Bump the sequence so concurrent transactions that read the key
        // conflict on commit.
        self.commit_seq.fetch_add(1, Ordering::SeqCst);
        self.map.lock().unwrap().remove(key);
    }

    pub fn get_raw(&self, key: &str) -> Option<Bytes> {
        self.map.lock().unwrap().get(key).map(|v| v.value.clone())
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next `create_txn` fail with a transport error.
    pub fn fail_next_create_txn(&self) {
        self.fail_next_txn.store(true, Ordering::SeqCst);
    }

    /// Let `n` more range batches succeed, then fail every subsequent one
    /// with a transport error. Pass a negative value to disable.
    pub fn fail_range_after(&self, n: i64) {
        self.range_budget.store(n, Ordering::SeqCst);
    }

    fn version_of(map: &BTreeMap<String, Versioned>, key: &str) -> u64 {
        map.get(key).map(|v| v.version).unwrap_or(0)
    }
}

#[async_trait]
impl TxnKv for MemoryKv {
    async fn create_txn(&self) -> TxnResult<Box<dyn Transaction>> {
        if self.fail_next_txn.swap(false, Ordering::SeqCst) {
            return Err(TxnError::Transport("injected create_txn failure".to_string()));
        }
        let kv = self
            .this
            .upgrade()
            .ok_or_else(|| TxnError::Transport("kv store dropped".to_string()))?;
        Ok(Box::new(MemoryTxn {
            kv,
            reads: Vec::new(),
            writes: Vec::new(),
            committed: false,
        }))
    }

    async fn range_get(&self, begin: &str, end: &str, limit: usize) -> TxnResult<RangeBatch> {
        let budget = self.range_budget.load(Ordering::SeqCst);
        if budget >= 0 {
            if budget == 0 {
                return Err(TxnError::Transport("injected range failure".to_string()));
            }
            self.range_budget.store(budget - 1, Ordering::SeqCst);
        }

        let map = self.map.lock().unwrap();
        let mut entries = Vec::new();
        let mut more = false;
        for (k, v) in map.range(begin.to_string()..end.to_string()) {
            if entries.len() == limit {
                more = true;
                break;
            }
            entries.push((k.clone(), v.value.clone()));
        }
        Ok(RangeBatch { entries, more })
    }
}

struct MemoryTxn {
    kv: Arc<MemoryKv>,
    reads: Vec<(String, u64)>,
    writes: Vec<(String, Bytes)>,
    committed: bool,
}

#[async_trait]
impl Transaction for MemoryTxn {
    async fn get(&mut self, key: &str) -> TxnResult<Option<Bytes>> {
        // Read-your-writes within the transaction.
        if let Some((_, v)) = self.writes.iter().rev().find(|(k, _)| k == key) {
            return Ok(Some(v.clone()));
        }
        let map = self.kv.map.lock().unwrap();
        let version = MemoryKv::version_of(&map, key);
        self.reads.push((key.to_string(), version));
        Ok(map.get(key).map(|v| v.value.clone()))
    }

    fn put(&mut self, key: &str, value: Bytes) {
        self.writes.push((key.to_string(), value));
    }

    async fn commit(&mut self) -> TxnResult<()> {
        assert!(!self.committed, "transaction committed twice");
        let mut map = self.kv.map.lock().unwrap();
        for (key, version) in &self.reads {
            if MemoryKv::version_of(&map, key) != *version {
                return Err(TxnError::Conflict);
            }
        }
        let version = self.kv.commit_seq.fetch_add(1, Ordering::SeqCst);
        for (key, value) in self.writes.drain(..) {
            map.insert(
                key,
                Versioned {
                    value,
                    version,
                },
            );
        }
        self.committed = true;
        Ok(())
    }
}
