#![no_main]

use libfuzzer_sys::fuzz_target;
use ringkv_storage::TreeMeta;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must be rejected cleanly, never panic
    let _ = TreeMeta::decode(data);
});
