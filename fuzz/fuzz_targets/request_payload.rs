//! Fuzz target for payload accessors
//!
//! Builds a frame of each type around an arbitrary payload and runs every
//! payload decoder on it, as a relay or client does on untrusted input.

#![no_main]

use arbitrary::Arbitrary;
use dmsg::{Frame, FrameType};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    type_byte: u8,
    circuit_id: u16,
    payload: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let Ok(frame_type) = FrameType::try_from(input.type_byte) else {
        return;
    };
    let Ok(frame) = Frame::new(frame_type, input.circuit_id, input.payload) else {
        return;
    };

    if let Ok((initiator, responder)) = frame.handshake_keys() {
        let rebuilt = Frame::request(frame.circuit_id(), &initiator, &responder);
        assert_eq!(rebuilt.payload(), frame.payload());
    }
    if let Ok((_, data)) = frame.fwd_parts() {
        assert_eq!(data.len() + 2, frame.payload().len());
    }
    let _ = frame.ack_seq();
    let _ = frame.close_reason();
    let _ = frame.with_circuit_id(input.circuit_id ^ 1);
});
