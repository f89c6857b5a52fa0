#![no_main]

use libfuzzer_sys::fuzz_target;
use vlink_fec::wire::{FecHeader, Packet, RtpHeader};

/// Fuzz RTP and FEC header parsing.
///
/// Any datagram off the wire may be handed to these parsers. They must
/// reject short input with an error, never panic.
fuzz_target!(|data: &[u8]| {
    let mut buf = data;
    let _ = RtpHeader::decode(&mut buf);

    let mut buf = data;
    let _ = FecHeader::decode(&mut buf);

    if let Ok(packet) = Packet::from_slice(data) {
        let _ = packet.rtp_header();
        let _ = packet.fec_header();
        let _ = packet.repair_payload();
        let _ = packet.restamped(0xE3, 1, 2);
    }
});
