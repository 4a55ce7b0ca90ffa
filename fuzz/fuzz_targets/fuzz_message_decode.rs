#![no_main]
use libfuzzer_sys::fuzz_target;
use player_sync::sync::{decode, encode};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // Anything that decodes must survive a second trip unchanged.
        if let Some(message) = decode(s) {
            assert_eq!(decode(&encode(&message)), Some(message));
        }
    }
});
