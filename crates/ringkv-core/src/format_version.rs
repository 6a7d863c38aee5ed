/// File format versions for RingKV
///
/// This module defines version constants for every file the storage engine
/// writes, so a node refuses to load data written by an incompatible build.
/// Chunk format version
pub const CHUNK_FORMAT_VERSION: u16 = 1;

/// Tree metadata format version
pub const TREE_FORMAT_VERSION: u16 = 1;

/// Journal format version
pub const JOURNAL_FORMAT_VERSION: u16 = 1;

/// Magic numbers for file validation
pub mod magic {
    /// Chunk magic: "RKCH" (RingKV CHunk)
    pub const CHUNK: u32 = 0x524B4348;

    /// Tree metadata magic: "RKTR" (RingKV TRee)
    pub const TREE: u32 = 0x524B5452;

    /// Journal magic: "RKJN" (RingKV JourNal)
    pub const JOURNAL: u32 = 0x524B4A4E;
}

/// Version compatibility information
pub struct FormatVersion {
    /// Current version of this format
    pub current: u16,
    /// Minimum supported version for reading
    pub min_read: u16,
    /// Minimum supported version for writing
    pub min_write: u16,
}

impl FormatVersion {
    /// Check if a version can be read
    pub fn can_read(&self, version: u16) -> bool {
        version >= self.min_read && version <= self.current
    }

    /// Check if a version can be written
    pub fn can_write(&self, version: u16) -> bool {
        version >= self.min_write && version <= self.current
    }
}

/// Chunk format version info
pub fn chunk_version() -> FormatVersion {
    FormatVersion {
        current: CHUNK_FORMAT_VERSION,
        min_read: 1,
        min_write: 1,
    }
}

/// Tree metadata format version info
pub fn tree_version() -> FormatVersion {
    FormatVersion {
        current: TREE_FORMAT_VERSION,
        min_read: 1,
        min_write: 1,
    }
}

/// Journal format version info
pub fn journal_version() -> FormatVersion {
    FormatVersion {
        current: JOURNAL_FORMAT_VERSION,
        min_read: 1,
        min_write: 1,
    }
}
