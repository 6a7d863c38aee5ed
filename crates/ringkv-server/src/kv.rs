//! Key-value layer over the B-tree.
//!
//! Every user key is stored as `<hash>:<key>` where `<hash>` is the key's
//! ring position in zero-padded hex. Padded hashes sort in numeric order, so
//! all keys of a hash interval are one contiguous range scan. Values are
//! plain strings; an empty value means "delete".

use ringkv_core::{Error, Result};
use ringkv_ring::hashing::to_hex_padded;
use ringkv_ring::{HashAlgorithm, RingRange, SharedHasher};
use ringkv_storage::{StorageConfig, StorageEngine, StorageStats};
use std::path::Path;
use tracing::{debug, trace};

const HASH_SEPARATOR: char = ':';
/// Sorts directly after [`HASH_SEPARATOR`]
const HASH_UPPER_SENTINEL: char = ';';

/// Effect of a [`KvStore::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// New key stored
    Inserted,
    /// Existing key overwritten
    Updated,
    /// Existing key removed
    Deleted,
    /// Delete of a key that was not stored
    Absent,
}

/// String store addressed by user key and searchable by ring position.
///
/// Cloning is cheap; clones share the same engine.
#[derive(Clone)]
pub struct KvStore {
    engine: StorageEngine<String>,
    hasher: SharedHasher,
}

impl KvStore {
    /// Open or create a store under `dir`
    pub fn open(dir: impl AsRef<Path>, config: StorageConfig, hasher: SharedHasher) -> Result<Self> {
        let engine = StorageEngine::open_with_config(dir, config)?;
        Ok(Self::new(engine, hasher))
    }

    /// Wrap an existing engine
    pub fn new(engine: StorageEngine<String>, hasher: SharedHasher) -> Self {
        Self { engine, hasher }
    }

    /// The placement algorithm keys are filed under
    pub fn hasher(&self) -> &SharedHasher {
        &self.hasher
    }

    fn storage_key(&self, key: &str) -> String {
        let hash = self.hasher.hash_key(key);
        format!(
            "{}{}{}",
            to_hex_padded(hash, self.hasher.hex_width()),
            HASH_SEPARATOR,
            key
        )
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.engine.get(&self.storage_key(key))
    }

    /// Store `value` under `key`; `None` or an empty value deletes
    pub fn put(&self, key: &str, value: Option<&str>) -> Result<PutOutcome> {
        let storage_key = self.storage_key(key);
        match value.filter(|value| !value.is_empty()) {
            Some(value) => {
                let previous = self.engine.insert(&storage_key, value.to_string())?;
                trace!(key, updated = previous.is_some(), "Stored key");
                Ok(match previous {
                    Some(_) => PutOutcome::Updated,
                    None => PutOutcome::Inserted,
                })
            }
            None => {
                let removed = self.engine.remove(&storage_key)?;
                trace!(key, removed, "Deleted key");
                Ok(if removed {
                    PutOutcome::Deleted
                } else {
                    PutOutcome::Absent
                })
            }
        }
    }

    /// Remove `key`, returning whether it was stored
    pub fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.put(key, None)? == PutOutcome::Deleted)
    }

    /// Every pair whose key hashes into `range`, in clockwise order
    pub fn scan_hash_range(&self, range: &RingRange) -> Result<Vec<(String, String)>> {
        let width = self.hasher.hex_width();
        let mut pairs = Vec::new();

        for (lo, hi) in range.segments() {
            let lower = to_hex_padded(lo, width);
            let upper = format!("{}{}", to_hex_padded(hi, width), HASH_UPPER_SENTINEL);
            for (storage_key, value) in self.engine.range_scan(&lower, &upper)? {
                let (_, key) = storage_key.split_once(HASH_SEPARATOR).ok_or_else(|| {
                    Error::Corruption(format!("Stored key '{}' has no hash prefix", storage_key))
                })?;
                pairs.push((key.to_string(), value));
            }
        }

        debug!(range = %range, pairs = pairs.len(), "Scanned hash range");
        Ok(pairs)
    }

    pub fn len(&self) -> Result<usize> {
        self.engine.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.engine.is_empty()
    }

    pub fn stats(&self) -> StorageStats {
        self.engine.stats()
    }

    /// Stop accepting operations once in-flight mutations finish
    pub fn close(&self) -> Result<()> {
        self.engine.close()
    }

    pub fn reopen(&self) -> Result<()> {
        self.engine.reopen()
    }
}

/// Run blocking storage work off the async worker threads
pub(crate) async fn blocking<R, F>(work: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::InvalidOperation(format!("Storage task failed: {}", e)))?
}
