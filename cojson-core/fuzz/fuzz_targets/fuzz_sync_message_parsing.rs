#![no_main]

use cojson_core::core_sync::SyncMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else { return };
    if let Ok(message) = SyncMessage::from_json(text) {
        // Anything we accept must encode back to something we accept
        let encoded = message.to_json().expect("parsed message re-encodes");
        let again = SyncMessage::from_json(&encoded).expect("re-encoded message parses");
        assert_eq!(again, message);
    }
});
