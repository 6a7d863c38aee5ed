//! Undo journal bracketing every tree mutation.
//!
//! A transaction starts by writing the journal head, which holds the tree
//! metadata as it was before the mutation. Every pre-existing chunk is copied
//! into the journal before it is first overwritten or deleted, and every new
//! chunk is recorded before it is first written. Removing the head commits.
//!
//! Rolling back restores backed-up chunks, deletes created chunks and puts
//! the old tree metadata back, leaving the store byte-identical to its state
//! before the transaction. The same routine recovers a store whose process
//! died mid-mutation.

use crate::codec::{decode_frame, encode_frame};
use crate::store::{ChunkStore, Slot};
use ringkv_core::format_version::{journal_version, magic};
use ringkv_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Contents of the journal head
#[derive(Debug, Serialize, Deserialize)]
struct JournalHead {
    /// Sequence number of the transaction, for diagnostics
    sequence: u64,
    /// Tree slot bytes before the transaction, `None` for a fresh store
    tree: Option<Vec<u8>>,
}

/// An open transaction.
#[derive(Debug)]
pub struct Transaction {
    sequence: u64,
    backed_up: BTreeSet<u64>,
    created: BTreeSet<u64>,
}

impl Transaction {
    /// Open a transaction, saving the current tree metadata
    pub fn begin(store: &dyn ChunkStore, sequence: u64) -> Result<Self> {
        let tree = store.read(Slot::Tree)?;
        let head = encode_frame(
            magic::JOURNAL,
            &journal_version(),
            &JournalHead { sequence, tree },
        )?;
        store.write(Slot::JournalHead, &head)?;
        debug!(sequence, "Transaction started");

        Ok(Self {
            sequence,
            backed_up: BTreeSet::new(),
            created: BTreeSet::new(),
        })
    }

    /// Record that chunk `id` is about to be written for the first time
    pub fn record_created(&mut self, store: &dyn ChunkStore, id: u64) -> Result<()> {
        if self.created.insert(id) {
            store.write(Slot::JournalCreated(id), &[])?;
        }
        Ok(())
    }

    /// Back up chunk `id` unless this transaction already did or created it
    pub fn record_modified(&mut self, store: &dyn ChunkStore, id: u64) -> Result<()> {
        if self.created.contains(&id) || self.backed_up.contains(&id) {
            return Ok(());
        }
        match store.read(Slot::Chunk(id))? {
            Some(bytes) => {
                store.write(Slot::JournalChunk(id), &bytes)?;
                self.backed_up.insert(id);
            }
            // Nothing on disk to restore: treat it like a new chunk.
            None => self.record_created(store, id)?,
        }
        Ok(())
    }

    /// Chunks touched so far
    pub fn touched(&self) -> usize {
        self.backed_up.len() + self.created.len()
    }

    /// Make the mutation permanent
    pub fn commit(self, store: &dyn ChunkStore) -> Result<()> {
        // Removing the head is the commit point; leftovers are swept on open.
        store.remove(Slot::JournalHead)?;
        for id in &self.backed_up {
            store.remove(Slot::JournalChunk(*id))?;
        }
        for id in &self.created {
            store.remove(Slot::JournalCreated(*id))?;
        }
        debug!(
            sequence = self.sequence,
            chunks = self.backed_up.len() + self.created.len(),
            "Transaction committed"
        );
        Ok(())
    }
}

/// Undo whatever transaction the journal describes.
///
/// Returns the restored tree slot bytes, or `None` if the tree slot is empty
/// afterwards. A journal without a head belongs to a committed transaction
/// and is only swept. Safe to repeat if interrupted.
pub fn rollback(store: &dyn ChunkStore) -> Result<Option<Vec<u8>>> {
    let slots = store.journal_slots()?;
    let head = match store.read(Slot::JournalHead)? {
        Some(bytes) => Some(decode_frame::<JournalHead>(
            magic::JOURNAL,
            &journal_version(),
            &bytes,
        )?),
        None => None,
    };

    let Some(head) = head else {
        if !slots.is_empty() {
            debug!(stale = slots.len(), "Sweeping journal of a committed transaction");
        }
        for slot in slots {
            store.remove(slot)?;
        }
        return store.read(Slot::Tree);
    };

    warn!(sequence = head.sequence, "Rolling back transaction");
    for slot in &slots {
        match *slot {
            Slot::JournalChunk(id) => {
                if let Some(backup) = store.read(*slot)? {
                    store.write(Slot::Chunk(id), &backup)?;
                }
            }
            Slot::JournalCreated(id) => store.remove(Slot::Chunk(id))?,
            _ => {}
        }
    }

    match &head.tree {
        Some(tree) => store.write(Slot::Tree, tree)?,
        None => store.remove(Slot::Tree)?,
    }

    for slot in slots.iter().filter(|slot| **slot != Slot::JournalHead) {
        store.remove(*slot)?;
    }
    store.remove(Slot::JournalHead)?;

    Ok(head.tree)
}
