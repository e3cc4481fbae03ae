//! Fuzz target: `FrameDecoder::feed`
//!
//! Drives arbitrary byte sequences into the streaming frame decoder in both
//! directions and checks that:
//! - it never panics
//! - every yielded packet re-encodes to a frame that decodes to itself
//! - feeding the same bytes one at a time yields the same packets
//!
//! cargo fuzz run fuzz_frame_decoder

#![no_main]

use libfuzzer_sys::fuzz_target;
use vgstack::proto::codec::{self, DecodeEvent, FrameDecoder, MAX_PAYLOAD};

fn packets(events: Vec<DecodeEvent>) -> Vec<codec::Packet> {
    events
        .into_iter()
        .filter_map(|ev| match ev {
            DecodeEvent::Packet(p) => Some(p),
            DecodeEvent::ChecksumError { .. } => None,
        })
        .collect()
}

fuzz_target!(|data: &[u8]| {
    for expects_result in [false, true] {
        let mut whole = FrameDecoder::new(expects_result);
        let found = packets(whole.feed(data));

        for p in &found {
            assert!(p.payload.len() <= MAX_PAYLOAD);
            let frame = p.encode().expect("decoded payload fits the length field");
            let again = codec::decode(&frame, expects_result).expect("re-encoded frame decodes");
            assert_eq!(&again, p);
        }

        let mut bytewise = FrameDecoder::new(expects_result);
        let mut split = Vec::new();
        for b in data {
            split.extend(packets(bytewise.feed(core::slice::from_ref(b))));
        }
        assert_eq!(split, found);

        whole.reset();
        assert!(!whole.in_frame());
    }
});
