//! Fuzz the bridge frame decoder with arbitrary byte streams.
//!
//! The decoder must never panic, never hand back a body longer than the
//! frame bound, and always resync after garbage.

#![no_main]

use kibblet::bridge::frame::{FrameDecoder, MAX_FRAME_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut decoder = FrameDecoder::new();
    for &byte in data {
        if let Ok(Some(body)) = decoder.push(byte) {
            assert!(body.len() >= 2);
            assert!(body.len() <= MAX_FRAME_SIZE);
        }
    }
});
