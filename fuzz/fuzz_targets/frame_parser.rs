//! Fuzz target for frame parsing
//!
//! Feeds arbitrary bytes through the parser as a stream of back-to-back
//! frames. The parser must never panic or consume more than it was given.

#![no_main]

use dmsg::Frame;
use dmsg::frame::HEADER_SIZE;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut rest = data;
    while let Ok((frame, used)) = Frame::parse(rest) {
        assert_eq!(used, HEADER_SIZE + frame.payload().len());
        assert!(used <= rest.len());

        // Re-encoding a parsed frame reproduces its bytes
        assert_eq!(frame.encode(), &rest[..used]);
        rest = &rest[used..];
    }
});
