// Common test utilities for storage integration tests

use ringkv_storage::{StorageConfig, StorageEngine, SyncMode};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Test fixture that owns a temporary store directory
pub struct StoreFixture {
    #[allow(dead_code)]
    pub temp_dir: TempDir,
    pub store_path: PathBuf,
}

impl StoreFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store_path = temp_dir.path().join("store");
        Self {
            temp_dir,
            store_path,
        }
    }

    pub fn open(&self, minimum_degree: usize) -> StorageEngine<String> {
        let config = StorageConfig {
            minimum_degree,
            sync_mode: SyncMode::None,
        };
        StorageEngine::open_with_config(&self.store_path, config).expect("Failed to open store")
    }

    #[allow(dead_code)]
    pub fn chunk_files(&self) -> Vec<PathBuf> {
        list(&self.store_path.join("chunks"))
    }

    #[allow(dead_code)]
    pub fn journal_files(&self) -> Vec<PathBuf> {
        list(&self.store_path.join("journal"))
    }
}

impl Default for StoreFixture {
    fn default() -> Self {
        Self::new()
    }
}

fn list(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .expect("Failed to read directory")
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    files.sort();
    files
}
