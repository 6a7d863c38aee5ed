#![no_main]

use libfuzzer_sys::fuzz_target;
use ringkv::KvMessage;

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        if let Ok(message) = KvMessage::parse(line) {
            // Whatever parses must survive a trip through its wire form
            let reparsed = KvMessage::parse(&message.to_string())
                .expect("formatted message failed to parse");
            assert_eq!(reparsed.status(), message.status());
            assert_eq!(reparsed.key(), message.key());
        }
    }
});
