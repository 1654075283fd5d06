//! Fuzz target: notify-callback query decoding.
//!
//! Child processes hit the notification socket with arbitrary query
//! strings; decoding must never panic, only yield an event or drop.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(query) = std::str::from_utf8(data) {
        let _ = warden_supervisor::notify::decode_notify_query(query);
    }
});
