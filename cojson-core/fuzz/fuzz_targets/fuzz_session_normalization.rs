#![no_main]

use cojson_core::core_covalue::{normalize_authoritative_session_content, SessionChunk};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(chunks) = serde_json::from_slice::<Vec<SessionChunk>>(data) else { return };
    if let Ok(normalized) = normalize_authoritative_session_content(chunks) {
        let mut expected = 0;
        for chunk in &normalized.chunks {
            assert_eq!(chunk.after, expected);
            expected = chunk.end();
        }
        assert_eq!(normalized.transactions.len() as u32, expected);
    }
});
