#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // Parse + validate must never panic.
        let _ = player_sync::Config::from_toml(s);
    }
});
