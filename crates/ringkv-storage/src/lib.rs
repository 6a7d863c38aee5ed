//! # RingKV Storage Engine
//!
//! Disk-backed B-tree storage engine for a RingKV node.
//!
//! ## ⚠️ Internal Implementation Detail
//!
//! **This crate is an internal implementation detail of RingKV.**
//!
//! Users should depend on the main `ringkv` crate instead, which provides the
//! server, coordinator and client. This crate's API may change without notice
//! between minor versions.
//!
//! ---
//!
//! This crate persists one node's slice of the key space:
//!
//! - **B-tree**: string keys, minimum degree `t`, node pairs stored in
//!   separately addressable chunks loaded on demand
//! - **Journal**: every mutation is a transaction; a fault mid-mutation rolls
//!   the on-disk state back to exactly what it was before
//! - **Recovery**: a store left with an open transaction is rolled back on open
//! - **Drain**: `close()` waits for in-flight mutations and then rejects new
//!   operations until `reopen()`
//!
//! ## Architecture
//!
//! ```text
//! get / range_scan ──read lock──▶ TreeMeta ──▶ chunks (read on demand)
//! insert / remove ──write lock─▶ WorkingSet ──flush──▶ journal ▶ chunks ▶ tree.meta
//! ```

use ringkv_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

pub mod btree;
pub mod codec;
pub mod journal;
pub mod store;

pub use btree::{Entry, NodeMeta, NodeRef, TreeMeta};
pub use store::{ChunkStore, DiskChunkStore, MemoryChunkStore, Slot, SyncMode};

use btree::WorkingSet;
use journal::Transaction;

/// Default minimum degree
const DEFAULT_MINIMUM_DEGREE: usize = 3;

/// Storage engine configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Minimum degree `t` of the B-tree; nodes hold `t-1..=2t-1` pairs
    pub minimum_degree: usize,
    /// Durability of chunk and metadata writes
    pub sync_mode: SyncMode,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            minimum_degree: DEFAULT_MINIMUM_DEGREE,
            sync_mode: SyncMode::Sync,
        }
    }
}

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Number of stored pairs
    pub element_count: usize,
    /// Number of B-tree nodes (and chunks)
    pub node_count: usize,
    /// Levels from root to leaf
    pub height: usize,
    /// Minimum degree in use
    pub minimum_degree: usize,
    /// Number of committed mutations
    pub sequence: u64,
}

struct Tree {
    store: Box<dyn ChunkStore>,
    meta: TreeMeta,
}

struct EngineInner {
    tree: RwLock<Tree>,
    closed: AtomicBool,
}

/// Persistent, thread-safe B-tree map from `String` keys to `V`.
///
/// Cloning is cheap; clones share the same tree.
pub struct StorageEngine<V> {
    inner: Arc<EngineInner>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for StorageEngine<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _value: PhantomData,
        }
    }
}

impl<V> StorageEngine<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    /// Open or create a storage engine at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, StorageConfig::default())
    }

    /// Open or create a storage engine with custom configuration
    pub fn open_with_config(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self> {
        let store = DiskChunkStore::open(path.as_ref(), config.sync_mode)?;
        info!(path = %path.as_ref().display(), "Opening storage engine");
        Self::with_store(store, config)
    }

    /// Open a storage engine over any [`ChunkStore`]
    pub fn with_store(store: impl ChunkStore + 'static, config: StorageConfig) -> Result<Self> {
        if config.minimum_degree < 2 {
            return Err(Error::InvalidOperation(format!(
                "Minimum degree must be at least 2, got {}",
                config.minimum_degree
            )));
        }

        let store: Box<dyn ChunkStore> = Box::new(store);
        let meta = Self::recover(store.as_ref(), config.minimum_degree)?;
        debug!(
            elements = meta.element_count(),
            nodes = meta.nodes.len(),
            "Storage engine ready"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                tree: RwLock::new(Tree { store, meta }),
                closed: AtomicBool::new(false),
            }),
            _value: PhantomData,
        })
    }

    /// Roll back any interrupted transaction and load the tree metadata
    fn recover(store: &dyn ChunkStore, minimum_degree: usize) -> Result<TreeMeta> {
        let tree = journal::rollback(store)?;
        match tree {
            Some(bytes) => {
                let meta = TreeMeta::decode(&bytes)?;
                if meta.minimum_degree != minimum_degree {
                    warn!(
                        stored = meta.minimum_degree,
                        configured = minimum_degree,
                        "Keeping the minimum degree the tree was built with"
                    );
                }
                Ok(meta)
            }
            None => Ok(TreeMeta::new(minimum_degree)),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(Error::ClosedStore)
        } else {
            Ok(())
        }
    }

    /// Retrieve a value by key
    pub fn get(&self, key: &str) -> Result<Option<V>> {
        self.ensure_open()?;
        let tree = self.inner.tree.read().map_err(|_| Error::LockPoisoned)?;
        btree::search(tree.store.as_ref(), &tree.meta, key)
    }

    /// Whether `key` is stored
    pub fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert or replace a value, returning the previous one
    ///
    /// Replacing an existing key only rewrites the chunk holding it; the
    /// shape of the tree does not change.
    pub fn insert(&self, key: &str, value: V) -> Result<Option<V>> {
        self.mutate(|tree| {
            let existing: Option<V> = btree::search(tree.store.as_ref(), &tree.meta, key)?;
            let mode = if existing.is_some() { "replace" } else { "insert" };
            debug!(key, mode, "Writing key");

            Self::transact(tree, move |ws| {
                if existing.is_some() {
                    ws.replace(key, value)
                } else {
                    ws.insert_new(key.to_string(), value).map(|_| None)
                }
            })
        })
    }

    /// Delete a key, returning whether it existed
    ///
    /// Removing an absent key touches nothing on disk.
    pub fn remove(&self, key: &str) -> Result<bool> {
        self.mutate(|tree| {
            let existing: Option<V> = btree::search(tree.store.as_ref(), &tree.meta, key)?;
            if existing.is_none() {
                return Ok(false);
            }
            debug!(key, "Removing key");
            Self::transact(tree, |ws| ws.remove_existing(key))
        })
    }

    /// All pairs with `lower <= key <= upper`, in ascending key order
    pub fn range_scan(&self, lower: &str, upper: &str) -> Result<Vec<(String, V)>> {
        self.ensure_open()?;
        let tree = self.inner.tree.read().map_err(|_| Error::LockPoisoned)?;
        btree::scan(tree.store.as_ref(), &tree.meta, lower, upper)
    }

    /// Stop accepting operations, waiting for in-flight mutations to finish
    pub fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        // Writers hold the lock for their whole mutation.
        let _drained = self.inner.tree.write().map_err(|_| Error::LockPoisoned)?;
        info!("Storage engine closed");
        Ok(())
    }

    /// Resume accepting operations after [`StorageEngine::close`]
    ///
    /// Any transaction left open by a failed rollback is undone first.
    pub fn reopen(&self) -> Result<()> {
        let mut tree = self.inner.tree.write().map_err(|_| Error::LockPoisoned)?;
        let minimum_degree = tree.meta.minimum_degree;
        tree.meta = Self::recover(tree.store.as_ref(), minimum_degree)?;
        self.inner.closed.store(false, Ordering::SeqCst);
        info!("Storage engine reopened");
        Ok(())
    }

    /// Whether [`StorageEngine::close`] is in effect
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of stored pairs
    pub fn len(&self) -> Result<usize> {
        self.ensure_open()?;
        let tree = self.inner.tree.read().map_err(|_| Error::LockPoisoned)?;
        Ok(tree.meta.element_count())
    }

    /// Whether no pairs are stored
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        match self.inner.tree.read() {
            Ok(tree) => StorageStats {
                element_count: tree.meta.element_count(),
                node_count: tree.meta.nodes.len(),
                height: tree.meta.height(),
                minimum_degree: tree.meta.minimum_degree,
                sequence: tree.meta.sequence,
            },
            Err(_) => StorageStats::default(),
        }
    }

    /// Check every structural invariant against the persisted chunks
    pub fn validate(&self) -> Result<()> {
        let tree = self.inner.tree.read().map_err(|_| Error::LockPoisoned)?;
        btree::validate::<V>(tree.store.as_ref(), &tree.meta)
    }

    fn mutate<R>(&self, op: impl FnOnce(&mut Tree) -> Result<R>) -> Result<R> {
        self.ensure_open()?;
        let mut tree = self.inner.tree.write().map_err(|_| Error::LockPoisoned)?;
        // close() may have won the race for the lock.
        self.ensure_open()?;

        let result = op(&mut tree);
        if matches!(result, Err(Error::ClosedStore)) {
            // Rollback failed: only reopen() may touch the tree again.
            self.inner.closed.store(true, Ordering::SeqCst);
        }
        result
    }

    /// Run `op` inside a journaled transaction
    fn transact<R>(
        tree: &mut Tree,
        op: impl FnOnce(&mut WorkingSet<'_, V>) -> Result<R>,
    ) -> Result<R> {
        let sequence = tree.meta.sequence + 1;
        let mut tx = Transaction::begin(tree.store.as_ref(), sequence)?;

        let outcome = {
            let mut ws = WorkingSet::new(tree.store.as_ref(), &mut tree.meta);
            op(&mut ws).and_then(|value| ws.flush(&mut tx).map(|_| value))
        };

        let failure = match outcome {
            Ok(value) => match tx.commit(tree.store.as_ref()) {
                Ok(()) => return Ok(value),
                Err(e) => e,
            },
            Err(e) => e,
        };

        error!(sequence, error = %failure, "Mutation failed, rolling back");
        match journal::rollback(tree.store.as_ref()) {
            Ok(restored) => {
                tree.meta = match restored {
                    Some(bytes) => TreeMeta::decode(&bytes)?,
                    None => TreeMeta::new(tree.meta.minimum_degree),
                };
                Err(match failure {
                    Error::StorageFault(_) => failure,
                    other => Error::StorageFault(other.to_string()),
                })
            }
            Err(rollback_error) => {
                error!(error = %rollback_error, "Rollback failed, closing store");
                Err(Error::ClosedStore)
            }
        }
    }
}
