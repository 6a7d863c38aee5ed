#![no_main]

use libfuzzer_sys::fuzz_target;
use ringkv_ring::{DebugHash, HashRing};

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(ring) = HashRing::parse(text, DebugHash::new(u32::MAX as u128)) {
            let again = HashRing::parse(&ring.serialize(), DebugHash::new(u32::MAX as u128))
                .expect("serialized ring failed to parse");
            assert_eq!(again.serialize(), ring.serialize());
        }
    }
});
