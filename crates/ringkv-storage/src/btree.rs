//! Persistent B-tree of minimum degree `t`.
//!
//! Structural node data (leaf flag, element count, child ids) lives in the
//! resident [`TreeMeta`]. Key/value pairs live in one chunk per node and are
//! read from the [`ChunkStore`] only while an operation needs them, so
//! resident memory does not grow with the stored data.
//!
//! Mutations go through a [`WorkingSet`]: each chunk is loaded at most once
//! per operation, edited in memory, and written back once when the operation
//! flushes.

use crate::codec::{decode_frame, encode_frame};
use crate::journal::Transaction;
use crate::store::{ChunkStore, Slot};
use ringkv_core::format_version::{chunk_version, magic, tree_version};
use ringkv_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::trace;

/// Id of a node and of the chunk holding its pairs
pub type NodeRef = u64;

/// One key/value pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<V> {
    /// Key
    pub key: String,
    /// Value
    pub value: V,
}

/// Structural data of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// Whether the node has no children
    pub leaf: bool,
    /// Number of pairs in the node's chunk
    pub len: usize,
    /// Child ids, `len + 1` of them for inner nodes
    pub children: Vec<NodeRef>,
}

/// Resident description of the whole tree, persisted in [`Slot::Tree`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMeta {
    /// Minimum degree `t`
    pub minimum_degree: usize,
    /// Root node, `None` while the tree is empty
    pub root: Option<NodeRef>,
    /// Next id handed out to a new node
    pub next_id: NodeRef,
    /// Number of committed mutations
    pub sequence: u64,
    /// Every live node
    pub nodes: BTreeMap<NodeRef, NodeMeta>,
}

impl TreeMeta {
    /// Empty tree
    pub fn new(minimum_degree: usize) -> Self {
        Self {
            minimum_degree,
            root: None,
            next_id: 1,
            sequence: 0,
            nodes: BTreeMap::new(),
        }
    }

    /// Decode the tree slot
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_frame(magic::TREE, &tree_version(), bytes)
    }

    /// Encode for the tree slot
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_frame(magic::TREE, &tree_version(), self)
    }

    /// Largest number of pairs a node may hold
    pub fn max_len(&self) -> usize {
        2 * self.minimum_degree - 1
    }

    /// Total number of stored pairs
    pub fn element_count(&self) -> usize {
        self.nodes.values().map(|node| node.len).sum()
    }

    /// Levels from root to leaf, 0 for an empty tree
    pub fn height(&self) -> usize {
        let mut height = 0;
        let mut cursor = self.root;
        while let Some(id) = cursor {
            height += 1;
            cursor = self
                .nodes
                .get(&id)
                .filter(|node| !node.leaf)
                .and_then(|node| node.children.first().copied());
        }
        height
    }

    pub(crate) fn node(&self, id: NodeRef) -> Result<&NodeMeta> {
        self.nodes
            .get(&id)
            .ok_or_else(|| Error::Corruption(format!("Unknown node {}", id)))
    }

    fn node_mut(&mut self, id: NodeRef) -> Result<&mut NodeMeta> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| Error::Corruption(format!("Unknown node {}", id)))
    }
}

/// Read and decode the pairs of node `id`, clamped to `len` elements
pub fn read_chunk<V: DeserializeOwned>(
    store: &dyn ChunkStore,
    id: NodeRef,
    len: usize,
) -> Result<Vec<Entry<V>>> {
    let bytes = store
        .read(Slot::Chunk(id))?
        .ok_or_else(|| Error::Corruption(format!("Missing chunk {}", id)))?;
    let mut entries: Vec<Entry<V>> = decode_frame(magic::CHUNK, &chunk_version(), &bytes)?;
    entries.truncate(len);
    Ok(entries)
}

/// Look up `key` without modifying anything
pub fn search<V: DeserializeOwned>(
    store: &dyn ChunkStore,
    meta: &TreeMeta,
    key: &str,
) -> Result<Option<V>> {
    let mut cursor = meta.root;
    while let Some(id) = cursor {
        let node = meta.node(id)?;
        let entries: Vec<Entry<V>> = read_chunk(store, id, node.len)?;
        match entries.binary_search_by(|entry| entry.key.as_str().cmp(key)) {
            Ok(idx) => return Ok(entries.into_iter().nth(idx).map(|entry| entry.value)),
            Err(_) if node.leaf => return Ok(None),
            Err(idx) => cursor = node.children.get(idx).copied(),
        }
    }
    Ok(None)
}

/// All pairs with `lo <= key <= hi`, ascending
pub fn scan<V: DeserializeOwned>(
    store: &dyn ChunkStore,
    meta: &TreeMeta,
    lo: &str,
    hi: &str,
) -> Result<Vec<(String, V)>> {
    let mut out = Vec::new();
    if lo > hi {
        return Ok(out);
    }
    if let Some(root) = meta.root {
        scan_node(store, meta, root, lo, hi, &mut out)?;
    }
    Ok(out)
}

fn scan_node<V: DeserializeOwned>(
    store: &dyn ChunkStore,
    meta: &TreeMeta,
    id: NodeRef,
    lo: &str,
    hi: &str,
    out: &mut Vec<(String, V)>,
) -> Result<()> {
    let node = meta.node(id)?;
    let entries: Vec<Entry<V>> = read_chunk(store, id, node.len)?;

    for (i, entry) in entries.into_iter().enumerate() {
        if !node.leaf && lo < entry.key.as_str() {
            scan_node(store, meta, node.children[i], lo, hi, out)?;
        }
        if entry.key.as_str() > hi {
            return Ok(());
        }
        let at_upper = entry.key == hi;
        if entry.key.as_str() >= lo {
            out.push((entry.key, entry.value));
        }
        if at_upper {
            return Ok(());
        }
    }

    if !node.leaf {
        if let Some(last) = node.children.last() {
            scan_node(store, meta, *last, lo, hi, out)?;
        }
    }
    Ok(())
}

/// Chunks loaded and modified during one mutation
pub struct WorkingSet<'a, V> {
    store: &'a dyn ChunkStore,
    meta: &'a mut TreeMeta,
    chunks: HashMap<NodeRef, Vec<Entry<V>>>,
    dirty: BTreeSet<NodeRef>,
    created: BTreeSet<NodeRef>,
    deleted: BTreeSet<NodeRef>,
}

impl<'a, V> WorkingSet<'a, V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    /// Start an operation against `meta`
    pub fn new(store: &'a dyn ChunkStore, meta: &'a mut TreeMeta) -> Self {
        Self {
            store,
            meta,
            chunks: HashMap::new(),
            dirty: BTreeSet::new(),
            created: BTreeSet::new(),
            deleted: BTreeSet::new(),
        }
    }

    fn t(&self) -> usize {
        self.meta.minimum_degree
    }

    fn len(&self, id: NodeRef) -> Result<usize> {
        Ok(self.meta.node(id)?.len)
    }

    fn is_leaf(&self, id: NodeRef) -> Result<bool> {
        Ok(self.meta.node(id)?.leaf)
    }

    fn child(&self, id: NodeRef, idx: usize) -> Result<NodeRef> {
        self.meta
            .node(id)?
            .children
            .get(idx)
            .copied()
            .ok_or_else(|| Error::Corruption(format!("Node {} has no child {}", id, idx)))
    }

    /// Take the pairs of `id` out of the working set for editing
    fn take(&mut self, id: NodeRef) -> Result<Vec<Entry<V>>> {
        if let Some(entries) = self.chunks.remove(&id) {
            return Ok(entries);
        }
        let len = self.len(id)?;
        read_chunk(self.store, id, len)
    }

    /// Return edited pairs of `id` and mark it for writing
    fn put(&mut self, id: NodeRef, entries: Vec<Entry<V>>) -> Result<()> {
        self.meta.node_mut(id)?.len = entries.len();
        self.chunks.insert(id, entries);
        self.dirty.insert(id);
        Ok(())
    }

    fn entry(&mut self, id: NodeRef, idx: usize) -> Result<Entry<V>> {
        let entries = self.take(id)?;
        let entry = entries.get(idx).cloned();
        self.chunks.insert(id, entries);
        entry.ok_or_else(|| Error::Corruption(format!("Node {} has no entry {}", id, idx)))
    }

    fn create(&mut self, leaf: bool) -> NodeRef {
        let id = self.meta.next_id;
        self.meta.next_id += 1;
        self.meta.nodes.insert(
            id,
            NodeMeta {
                leaf,
                len: 0,
                children: Vec::new(),
            },
        );
        self.chunks.insert(id, Vec::new());
        self.created.insert(id);
        self.dirty.insert(id);
        id
    }

    fn delete(&mut self, id: NodeRef) {
        self.meta.nodes.remove(&id);
        self.chunks.remove(&id);
        self.dirty.remove(&id);
        if !self.created.remove(&id) {
            self.deleted.insert(id);
        }
    }

    /// Write every modified chunk and the tree metadata, journaling first
    pub fn flush(mut self, tx: &mut Transaction) -> Result<()> {
        let store = self.store;

        for id in &self.dirty {
            let entries = self
                .chunks
                .get(id)
                .ok_or_else(|| Error::Corruption(format!("Dirty chunk {} not loaded", id)))?;
            let bytes = encode_frame(magic::CHUNK, &chunk_version(), entries)?;
            if self.created.contains(id) {
                tx.record_created(store, *id)?;
            } else {
                tx.record_modified(store, *id)?;
            }
            store.write(Slot::Chunk(*id), &bytes)?;
        }

        for id in &self.deleted {
            tx.record_modified(store, *id)?;
            store.remove(Slot::Chunk(*id))?;
        }

        self.meta.sequence += 1;
        store.write(Slot::Tree, &self.meta.encode()?)?;
        trace!(
            written = self.dirty.len(),
            deleted = self.deleted.len(),
            "Flushed working set"
        );
        Ok(())
    }

    /// Replace the value of an existing key in place
    pub fn replace(&mut self, key: &str, value: V) -> Result<Option<V>> {
        let mut cursor = self.meta.root;
        while let Some(id) = cursor {
            let mut entries = self.take(id)?;
            match entries.binary_search_by(|entry| entry.key.as_str().cmp(key)) {
                Ok(idx) => {
                    let old = std::mem::replace(&mut entries[idx].value, value);
                    self.put(id, entries)?;
                    return Ok(Some(old));
                }
                Err(idx) => {
                    self.chunks.insert(id, entries);
                    cursor = if self.is_leaf(id)? {
                        None
                    } else {
                        Some(self.child(id, idx)?)
                    };
                }
            }
        }
        Ok(None)
    }

    /// Insert a key known to be absent
    pub fn insert_new(&mut self, key: String, value: V) -> Result<()> {
        let entry = Entry { key, value };
        let Some(root) = self.meta.root else {
            let root = self.create(true);
            self.put(root, vec![entry])?;
            self.meta.root = Some(root);
            return Ok(());
        };

        if self.len(root)? == self.meta.max_len() {
            let new_root = self.create(false);
            self.meta.node_mut(new_root)?.children.push(root);
            self.meta.root = Some(new_root);
            self.split_child(new_root, 0)?;
            self.insert_non_full(new_root, entry)
        } else {
            self.insert_non_full(root, entry)
        }
    }

    /// Split the full child `idx` of `parent` around its median
    fn split_child(&mut self, parent: NodeRef, idx: usize) -> Result<()> {
        let t = self.t();
        let full = self.child(parent, idx)?;
        let leaf = self.is_leaf(full)?;
        let sibling = self.create(leaf);

        let mut left = self.take(full)?;
        let right = left.split_off(t);
        let median = left
            .pop()
            .ok_or_else(|| Error::Corruption(format!("Split of short node {}", full)))?;

        if !leaf {
            let moved = self.meta.node_mut(full)?.children.split_off(t);
            self.meta.node_mut(sibling)?.children = moved;
        }

        self.put(full, left)?;
        self.put(sibling, right)?;

        let mut parent_entries = self.take(parent)?;
        parent_entries.insert(idx, median);
        self.meta
            .node_mut(parent)?
            .children
            .insert(idx + 1, sibling);
        self.put(parent, parent_entries)?;

        trace!(node = full, sibling, "Split node");
        Ok(())
    }

    fn insert_non_full(&mut self, start: NodeRef, entry: Entry<V>) -> Result<()> {
        let mut id = start;
        loop {
            let mut entries = self.take(id)?;
            let mut idx = entries.partition_point(|existing| existing.key < entry.key);

            if self.is_leaf(id)? {
                entries.insert(idx, entry);
                return self.put(id, entries);
            }
            self.chunks.insert(id, entries);

            let child = self.child(id, idx)?;
            if self.len(child)? == self.meta.max_len() {
                self.split_child(id, idx)?;
                if self.entry(id, idx)?.key < entry.key {
                    idx += 1;
                }
            }
            id = self.child(id, idx)?;
        }
    }

    /// Delete a key known to be present
    pub fn remove_existing(&mut self, key: &str) -> Result<bool> {
        let Some(root) = self.meta.root else {
            return Ok(false);
        };
        let removed = self.remove_from(root, key)?;

        if self.len(root)? == 0 {
            if self.is_leaf(root)? {
                self.meta.root = None;
            } else {
                self.meta.root = Some(self.child(root, 0)?);
                trace!(old_root = root, "Tree height shrinks");
            }
            self.delete(root);
        }
        Ok(removed)
    }

    fn remove_from(&mut self, id: NodeRef, key: &str) -> Result<bool> {
        let mut entries = self.take(id)?;
        let idx = entries.partition_point(|entry| entry.key.as_str() < key);
        let found = idx < entries.len() && entries[idx].key == key;
        let leaf = self.is_leaf(id)?;

        if found && leaf {
            entries.remove(idx);
            self.put(id, entries)?;
            return Ok(true);
        }
        let len = entries.len();
        self.chunks.insert(id, entries);

        if found {
            return self.remove_from_inner(id, idx);
        }
        if leaf {
            return Ok(false);
        }

        let was_last = idx == len;
        if self.len(self.child(id, idx)?)? < self.t() {
            self.fill(id, idx)?;
        }
        // Filling the last child may have merged it into its left sibling.
        if was_last && idx > self.len(id)? {
            self.remove_from(self.child(id, idx - 1)?, key)
        } else {
            self.remove_from(self.child(id, idx)?, key)
        }
    }

    fn remove_from_inner(&mut self, id: NodeRef, idx: usize) -> Result<bool> {
        let t = self.t();
        let left = self.child(id, idx)?;
        let right = self.child(id, idx + 1)?;
        let key = self.entry(id, idx)?.key;

        if self.len(left)? >= t {
            let pred = self.last_entry_below(left)?;
            let pred_key = pred.key.clone();
            self.set_entry(id, idx, pred)?;
            self.remove_from(left, &pred_key)
        } else if self.len(right)? >= t {
            let succ = self.first_entry_below(right)?;
            let succ_key = succ.key.clone();
            self.set_entry(id, idx, succ)?;
            self.remove_from(right, &succ_key)
        } else {
            self.merge(id, idx)?;
            self.remove_from(left, &key)
        }
    }

    fn set_entry(&mut self, id: NodeRef, idx: usize, entry: Entry<V>) -> Result<()> {
        let mut entries = self.take(id)?;
        entries[idx] = entry;
        self.put(id, entries)
    }

    fn last_entry_below(&mut self, start: NodeRef) -> Result<Entry<V>> {
        let mut id = start;
        while !self.is_leaf(id)? {
            id = self.child(id, self.len(id)?)?;
        }
        let last = self.len(id)?.checked_sub(1).ok_or_else(|| {
            Error::Corruption(format!("Empty leaf {} on predecessor path", id))
        })?;
        self.entry(id, last)
    }

    fn first_entry_below(&mut self, start: NodeRef) -> Result<Entry<V>> {
        let mut id = start;
        while !self.is_leaf(id)? {
            id = self.child(id, 0)?;
        }
        self.entry(id, 0)
    }

    /// Give child `idx` of `id` at least `t` pairs
    fn fill(&mut self, id: NodeRef, idx: usize) -> Result<()> {
        let t = self.t();
        let len = self.len(id)?;

        if idx != 0 && self.len(self.child(id, idx - 1)?)? >= t {
            self.borrow_from_prev(id, idx)
        } else if idx != len && self.len(self.child(id, idx + 1)?)? >= t {
            self.borrow_from_next(id, idx)
        } else if idx != len {
            self.merge(id, idx)
        } else {
            self.merge(id, idx - 1)
        }
    }

    fn borrow_from_prev(&mut self, id: NodeRef, idx: usize) -> Result<()> {
        let child = self.child(id, idx)?;
        let sibling = self.child(id, idx - 1)?;

        let mut parent_entries = self.take(id)?;
        let mut child_entries = self.take(child)?;
        let mut sibling_entries = self.take(sibling)?;

        let lifted = sibling_entries
            .pop()
            .ok_or_else(|| Error::Corruption(format!("Borrow from empty node {}", sibling)))?;
        let lowered = std::mem::replace(&mut parent_entries[idx - 1], lifted);
        child_entries.insert(0, lowered);

        if !self.is_leaf(child)? {
            let moved = self.meta.node_mut(sibling)?.children.pop().ok_or_else(|| {
                Error::Corruption(format!("Inner node {} without children", sibling))
            })?;
            self.meta.node_mut(child)?.children.insert(0, moved);
        }

        self.put(id, parent_entries)?;
        self.put(child, child_entries)?;
        self.put(sibling, sibling_entries)
    }

    fn borrow_from_next(&mut self, id: NodeRef, idx: usize) -> Result<()> {
        let child = self.child(id, idx)?;
        let sibling = self.child(id, idx + 1)?;

        let mut parent_entries = self.take(id)?;
        let mut child_entries = self.take(child)?;
        let mut sibling_entries = self.take(sibling)?;

        if sibling_entries.is_empty() {
            return Err(Error::Corruption(format!(
                "Borrow from empty node {}",
                sibling
            )));
        }
        let lifted = sibling_entries.remove(0);
        let lowered = std::mem::replace(&mut parent_entries[idx], lifted);
        child_entries.push(lowered);

        if !self.is_leaf(child)? {
            let moved = self.meta.node_mut(sibling)?.children.remove(0);
            self.meta.node_mut(child)?.children.push(moved);
        }

        self.put(id, parent_entries)?;
        self.put(child, child_entries)?;
        self.put(sibling, sibling_entries)
    }

    /// Merge child `idx + 1` and the separating pair into child `idx`
    fn merge(&mut self, id: NodeRef, idx: usize) -> Result<()> {
        let child = self.child(id, idx)?;
        let sibling = self.child(id, idx + 1)?;

        let mut parent_entries = self.take(id)?;
        let mut child_entries = self.take(child)?;
        let sibling_entries = self.take(sibling)?;

        child_entries.push(parent_entries.remove(idx));
        child_entries.extend(sibling_entries);

        let moved = std::mem::take(&mut self.meta.node_mut(sibling)?.children);
        self.meta.node_mut(child)?.children.extend(moved);
        self.meta.node_mut(id)?.children.remove(idx + 1);

        self.put(id, parent_entries)?;
        self.put(child, child_entries)?;
        self.delete(sibling);

        trace!(node = child, absorbed = sibling, "Merged nodes");
        Ok(())
    }
}

/// Check every structural invariant of the tree against its chunks
pub fn validate<V: DeserializeOwned>(store: &dyn ChunkStore, meta: &TreeMeta) -> Result<()> {
    let Some(root) = meta.root else {
        if !meta.nodes.is_empty() {
            return Err(Error::Corruption(format!(
                "Empty tree still lists {} nodes",
                meta.nodes.len()
            )));
        }
        return Ok(());
    };

    let mut seen = BTreeSet::new();
    let mut leaf_depth = None;
    validate_node::<V>(
        store,
        meta,
        root,
        true,
        0,
        (None, None),
        &mut seen,
        &mut leaf_depth,
    )?;

    if seen.len() != meta.nodes.len() {
        return Err(Error::Corruption(format!(
            "{} nodes reachable but {} listed",
            seen.len(),
            meta.nodes.len()
        )));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn validate_node<V: DeserializeOwned>(
    store: &dyn ChunkStore,
    meta: &TreeMeta,
    id: NodeRef,
    is_root: bool,
    depth: usize,
    bounds: (Option<&str>, Option<&str>),
    seen: &mut BTreeSet<NodeRef>,
    leaf_depth: &mut Option<usize>,
) -> Result<()> {
    let corrupt = |msg: String| Err(Error::Corruption(format!("Node {}: {}", id, msg)));

    if !seen.insert(id) {
        return corrupt("reachable more than once".to_string());
    }
    let node = meta.node(id)?;
    let t = meta.minimum_degree;
    let min = if is_root { 1 } else { t - 1 };
    if node.len < min || node.len > meta.max_len() {
        return corrupt(format!("{} pairs outside [{}, {}]", node.len, min, meta.max_len()));
    }

    let bytes = store
        .read(Slot::Chunk(id))?
        .ok_or_else(|| Error::Corruption(format!("Missing chunk {}", id)))?;
    let entries: Vec<Entry<V>> = decode_frame(magic::CHUNK, &chunk_version(), &bytes)?;
    if entries.len() != node.len {
        return corrupt(format!(
            "chunk holds {} pairs, node says {}",
            entries.len(),
            node.len
        ));
    }

    for pair in entries.windows(2) {
        if pair[0].key >= pair[1].key {
            return corrupt(format!("keys out of order: '{}' >= '{}'", pair[0].key, pair[1].key));
        }
    }
    if let (Some(lo), Some(first)) = (bounds.0, entries.first()) {
        if first.key.as_str() <= lo {
            return corrupt(format!("key '{}' not above separator '{}'", first.key, lo));
        }
    }
    if let (Some(hi), Some(last)) = (bounds.1, entries.last()) {
        if last.key.as_str() >= hi {
            return corrupt(format!("key '{}' not below separator '{}'", last.key, hi));
        }
    }

    if node.leaf {
        if !node.children.is_empty() {
            return corrupt("leaf with children".to_string());
        }
        match *leaf_depth {
            Some(expected) if expected != depth => {
                return corrupt(format!("leaf at depth {}, expected {}", depth, expected))
            }
            Some(_) => {}
            None => *leaf_depth = Some(depth),
        }
        return Ok(());
    }

    if node.children.len() != node.len + 1 {
        return corrupt(format!(
            "{} children for {} pairs",
            node.children.len(),
            node.len
        ));
    }
    for (i, child) in node.children.iter().enumerate() {
        let lo = if i == 0 {
            bounds.0
        } else {
            Some(entries[i - 1].key.as_str())
        };
        let hi = if i == entries.len() {
            bounds.1
        } else {
            Some(entries[i].key.as_str())
        };
        validate_node::<V>(store, meta, *child, false, depth + 1, (lo, hi), seen, leaf_depth)?;
    }
    Ok(())
}
