#![no_main]

use libfuzzer_sys::fuzz_target;
use vlink_fec::arq::requested_sequences;
use vlink_fec::wire::NackPacket;

/// Fuzz generic-NACK decoding and expansion.
///
/// A decoded NACK must re-encode to a prefix of the input, and expanding
/// its items must never panic.
fuzz_target!(|data: &[u8]| {
    if let Ok(nack) = NackPacket::decode(data) {
        let encoded = nack.to_bytes();
        assert!(encoded.len() <= data.len());
        assert_eq!(&encoded[2..], &data[2..encoded.len()]);
        let seqs = requested_sequences(&nack);
        assert!(seqs.len() <= nack.items.len() * 17);
    }
});
