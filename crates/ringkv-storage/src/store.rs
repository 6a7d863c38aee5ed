//! Byte-level persistence for tree metadata, chunks and the journal.
//!
//! A [`ChunkStore`] knows nothing about B-trees. It maps [`Slot`]s to opaque
//! byte strings; the engine frames and decodes them.

use ringkv_core::{Error, Result};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Tree metadata file name
const TREE_FILE: &str = "tree.meta";
/// Chunk directory
const CHUNK_DIR: &str = "chunks";
/// Journal directory
const JOURNAL_DIR: &str = "journal";
/// Journal head file name
const JOURNAL_HEAD: &str = "head.journal";

const CHUNK_EXT: &str = "chunk";
const BACKUP_EXT: &str = "backup";
const CREATED_EXT: &str = "created";

/// Addressable unit of persistent state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    /// Tree metadata: root pointer, id counter and node table
    Tree,
    /// Key/value pairs of one node
    Chunk(u64),
    /// Open transaction marker holding the pre-transaction tree metadata
    JournalHead,
    /// Pre-transaction copy of a chunk
    JournalChunk(u64),
    /// Marker for a chunk created inside the open transaction
    JournalCreated(u64),
}

impl Slot {
    /// Whether this slot belongs to the journal
    pub fn is_journal(&self) -> bool {
        matches!(
            self,
            Slot::JournalHead | Slot::JournalChunk(_) | Slot::JournalCreated(_)
        )
    }
}

/// Durability of individual slot writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// fsync every file before it replaces the previous version
    Sync,
    /// Leave flushing to the operating system (fastest, unsafe for power loss)
    None,
}

/// Persistent mapping of [`Slot`]s to bytes.
///
/// Writes replace the whole slot atomically. Removing an absent slot is not
/// an error. Failures surface as [`Error::StorageFault`].
pub trait ChunkStore: Send + Sync {
    /// Read a slot, `None` if it was never written or was removed
    fn read(&self, slot: Slot) -> Result<Option<Vec<u8>>>;

    /// Replace the contents of a slot
    fn write(&self, slot: Slot, bytes: &[u8]) -> Result<()>;

    /// Delete a slot
    fn remove(&self, slot: Slot) -> Result<()>;

    /// Every journal slot currently present, in slot order
    fn journal_slots(&self) -> Result<Vec<Slot>>;
}

impl<S: ChunkStore + ?Sized> ChunkStore for Box<S> {
    fn read(&self, slot: Slot) -> Result<Option<Vec<u8>>> {
        (**self).read(slot)
    }

    fn write(&self, slot: Slot, bytes: &[u8]) -> Result<()> {
        (**self).write(slot, bytes)
    }

    fn remove(&self, slot: Slot) -> Result<()> {
        (**self).remove(slot)
    }

    fn journal_slots(&self) -> Result<Vec<Slot>> {
        (**self).journal_slots()
    }
}

/// Directory-backed store.
///
/// ```text
/// <dir>/tree.meta
/// <dir>/chunks/<id>.chunk
/// <dir>/journal/head.journal
/// <dir>/journal/<id>.backup
/// <dir>/journal/<id>.created
/// ```
pub struct DiskChunkStore {
    dir: PathBuf,
    sync_mode: SyncMode,
}

impl DiskChunkStore {
    /// Open or create a store rooted at `dir`
    pub fn open(dir: impl AsRef<Path>, sync_mode: SyncMode) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(CHUNK_DIR)).map_err(|e| fault("create chunk dir", &dir, e))?;
        fs::create_dir_all(dir.join(JOURNAL_DIR))
            .map_err(|e| fault("create journal dir", &dir, e))?;
        Ok(Self { dir, sync_mode })
    }

    /// Root directory of the store
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, slot: Slot) -> PathBuf {
        match slot {
            Slot::Tree => self.dir.join(TREE_FILE),
            Slot::Chunk(id) => self
                .dir
                .join(CHUNK_DIR)
                .join(format!("{:016x}.{}", id, CHUNK_EXT)),
            Slot::JournalHead => self.dir.join(JOURNAL_DIR).join(JOURNAL_HEAD),
            Slot::JournalChunk(id) => self
                .dir
                .join(JOURNAL_DIR)
                .join(format!("{:016x}.{}", id, BACKUP_EXT)),
            Slot::JournalCreated(id) => self
                .dir
                .join(JOURNAL_DIR)
                .join(format!("{:016x}.{}", id, CREATED_EXT)),
        }
    }

    fn sync_dir(&self, path: &Path) -> Result<()> {
        if self.sync_mode == SyncMode::Sync {
            if let Some(parent) = path.parent() {
                // Not every platform can fsync a directory.
                if let Ok(dir) = File::open(parent) {
                    let _ = dir.sync_all();
                }
            }
        }
        Ok(())
    }
}

impl ChunkStore for DiskChunkStore {
    fn read(&self, slot: Slot) -> Result<Option<Vec<u8>>> {
        let path = self.path(slot);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(fault("read", &path, e)),
        }
    }

    fn write(&self, slot: Slot, bytes: &[u8]) -> Result<()> {
        let path = self.path(slot);
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        trace!(path = %path.display(), len = bytes.len(), "Writing slot");

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| fault("create", &tmp, e))?;
        file.write_all(bytes).map_err(|e| fault("write", &tmp, e))?;
        if self.sync_mode == SyncMode::Sync {
            file.sync_all().map_err(|e| fault("sync", &tmp, e))?;
        }
        drop(file);

        fs::rename(&tmp, &path).map_err(|e| fault("rename", &path, e))?;
        self.sync_dir(&path)
    }

    fn remove(&self, slot: Slot) -> Result<()> {
        let path = self.path(slot);
        match fs::remove_file(&path) {
            Ok(()) => self.sync_dir(&path),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(fault("remove", &path, e)),
        }
    }

    fn journal_slots(&self) -> Result<Vec<Slot>> {
        let dir = self.dir.join(JOURNAL_DIR);
        let entries = fs::read_dir(&dir).map_err(|e| fault("list", &dir, e))?;

        let mut slots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| fault("list", &dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name == JOURNAL_HEAD {
                slots.push(Slot::JournalHead);
                continue;
            }
            let Some((stem, ext)) = name.rsplit_once('.') else {
                continue;
            };
            let Ok(id) = u64::from_str_radix(stem, 16) else {
                continue;
            };
            match ext {
                BACKUP_EXT => slots.push(Slot::JournalChunk(id)),
                CREATED_EXT => slots.push(Slot::JournalCreated(id)),
                _ => {}
            }
        }
        slots.sort();
        Ok(slots)
    }
}

fn fault(action: &str, path: &Path, err: std::io::Error) -> Error {
    Error::StorageFault(format!("{} {}: {}", action, path.display(), err))
}

/// In-memory store. Clones share the same contents.
#[derive(Clone, Default)]
pub struct MemoryChunkStore {
    slots: Arc<Mutex<BTreeMap<Slot, Vec<u8>>>>,
}

impl MemoryChunkStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every slot, for comparing persistent state
    pub fn snapshot(&self) -> Result<BTreeMap<Slot, Vec<u8>>> {
        let slots = self.slots.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(slots.clone())
    }
}

impl ChunkStore for MemoryChunkStore {
    fn read(&self, slot: Slot) -> Result<Option<Vec<u8>>> {
        let slots = self.slots.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(slots.get(&slot).cloned())
    }

    fn write(&self, slot: Slot, bytes: &[u8]) -> Result<()> {
        let mut slots = self.slots.lock().map_err(|_| Error::LockPoisoned)?;
        slots.insert(slot, bytes.to_vec());
        Ok(())
    }

    fn remove(&self, slot: Slot) -> Result<()> {
        let mut slots = self.slots.lock().map_err(|_| Error::LockPoisoned)?;
        slots.remove(&slot);
        Ok(())
    }

    fn journal_slots(&self) -> Result<Vec<Slot>> {
        let slots = self.slots.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(slots.keys().filter(|slot| slot.is_journal()).copied().collect())
    }
}
