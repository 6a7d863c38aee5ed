#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use ringkv_storage::{MemoryChunkStore, StorageConfig, StorageEngine, SyncMode};
use std::collections::BTreeMap;

#[derive(Arbitrary, Debug)]
enum TreeOp {
    Insert { key: u8, value: u16 },
    Remove { key: u8 },
    Get { key: u8 },
    Scan { lower: u8, upper: u8 },
}

fuzz_target!(|input: (u8, Vec<TreeOp>)| {
    let (degree, ops) = input;
    let config = StorageConfig {
        minimum_degree: 2 + (degree % 4) as usize,
        sync_mode: SyncMode::None,
    };
    let engine: StorageEngine<u16> = match StorageEngine::with_store(MemoryChunkStore::new(), config) {
        Ok(engine) => engine,
        Err(_) => return,
    };
    let mut model = BTreeMap::new();

    // Limit operations to prevent timeout
    for op in ops.iter().take(500) {
        match op {
            TreeOp::Insert { key, value } => {
                let key = format!("{:03}", key);
                let previous = engine.insert(&key, *value).unwrap();
                assert_eq!(previous, model.insert(key, *value));
            }
            TreeOp::Remove { key } => {
                let key = format!("{:03}", key);
                assert_eq!(engine.remove(&key).unwrap(), model.remove(&key).is_some());
            }
            TreeOp::Get { key } => {
                let key = format!("{:03}", key);
                assert_eq!(engine.get(&key).unwrap(), model.get(&key).copied());
            }
            TreeOp::Scan { lower, upper } => {
                let (lower, upper) = (format!("{:03}", lower), format!("{:03}", upper));
                let expected: Vec<(String, u16)> = if lower <= upper {
                    model
                        .range(lower.clone()..=upper.clone())
                        .map(|(k, v)| (k.clone(), *v))
                        .collect()
                } else {
                    Vec::new()
                };
                assert_eq!(engine.range_scan(&lower, &upper).unwrap(), expected);
            }
        }
    }

    engine.validate().unwrap();
    assert_eq!(engine.len().unwrap(), model.len());
});
