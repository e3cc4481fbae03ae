//! Fuzz target: `http::parse_body`
//!
//! HTTP bodies arrive from the network unauthenticated. Any input must be
//! rejected or turned into a packet without panicking, and an accepted
//! packet must always be encodable.
//!
//! cargo fuzz run fuzz_http_body

#![no_main]

use libfuzzer_sys::fuzz_target;
use vgstack::proto::http;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = http::parse_body(data) {
        assert!(packet.encode().is_ok(), "accepted packet must encode");
        let _ = http::reply_body(&packet);
    }
});
