#![no_main]

use libfuzzer_sys::fuzz_target;
use vlink_fec::matrix::{FecMatrix, PacketKind};
use vlink_fec::wire::Packet;

/// Fuzz decoder-side matrix insertion with hostile packets.
///
/// Input layout: `[rows, columns, (len, kind, bytes...)*]`. Every packet is
/// offered to the matrix as media or repair; malformed parity must be
/// rejected with an error and the repair cascade must terminate.
fuzz_target!(|data: &[u8]| {
    let [rows, columns, rest @ ..] = data else {
        return;
    };
    let Ok(mut matrix) = FecMatrix::new(rows % 8 + 1, columns % 8 + 1) else {
        return;
    };

    let mut rest = rest;
    while let [len, kind, tail @ ..] = rest {
        let len = (*len as usize).min(tail.len());
        let (chunk, next) = tail.split_at(len);
        rest = next;

        let Ok(packet) = Packet::from_slice(chunk) else {
            continue;
        };
        let kind = if kind & 1 == 0 {
            PacketKind::Media
        } else {
            PacketKind::Repair
        };
        if kind == PacketKind::Media && !matrix.can_accept(&packet, kind) {
            continue;
        }
        if let Ok(recovered) = matrix.insert_and_try_repair(packet, kind) {
            assert!(recovered.len() <= matrix.rows() * matrix.columns());
        }
        assert!(matrix.filled_cells() <= matrix.rows() * matrix.columns());
        let _ = matrix.unrecoverable_sequences();
    }
});
