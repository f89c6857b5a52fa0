//! # 2-D Parity Matrix
//!
//! A `rows × columns` grid of media packets protected by one XOR parity
//! packet per row and one per column (RFC 8627 style).
//!
//! ## Addressing
//!
//! A media packet with sequence `seq` lives at offset
//! `n = seq - base (mod 2^16)`, i.e. row `n / columns`, column `n % columns`.
//! The encoder and decoder must agree on this mapping exactly.
//!
//! ## Repair
//!
//! A line (row or column) is repairable when exactly one of its cells is
//! empty and its parity packet is present. XOR-ing the parity packet with
//! every present sibling yields the missing packet's header bits, timestamp,
//! payload length and payload; the sequence number comes from the cell
//! position and the SSRC is copied from a sibling.
//!
//! Each recovered packet is placed immediately and its own row and column
//! are queued for another check, so a single arrival can unlock a chain of
//! repairs. The queue is drained iteratively; every successful step fills a
//! cell, so the cascade is bounded by the number of empty cells.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes};
use tracing::{debug, trace, warn};

use crate::error::{FecError, Result};
use crate::seq::SeqRange;
use crate::wire::{FecHeader, Packet, REPAIR_PAYLOAD_OFFSET, RTP_HEADER_LEN};

/// Upper bound on rows and on columns.
pub const MAX_LINES: u8 = 32;

// ─── Types ───────────────────────────────────────────────────────────────────

/// How the decoder should treat an incoming packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Media,
    Repair,
}

impl PacketKind {
    /// Repair packets are recognised solely by payload type.
    pub fn classify(packet: &Packet, repair_payload_type: u8) -> Self {
        if packet.is_repair(repair_payload_type) {
            PacketKind::Repair
        } else {
            PacketKind::Media
        }
    }
}

/// One row or one column of the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    Row(usize),
    Column(usize),
}

// ─── FecMatrix ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FecMatrix {
    rows: usize,
    columns: usize,
    /// Row-major, `rows * columns` cells.
    cells: Vec<Option<Packet>>,
    row_fill: Vec<usize>,
    column_fill: Vec<usize>,
    row_repair: Vec<Option<Packet>>,
    column_repair: Vec<Option<Packet>>,
    range: Option<SeqRange>,
    /// SSRC of the first media packet seen, for lines with no siblings.
    media_ssrc: Option<u32>,
    /// Scratch occupancy for the residual-loss simulation.
    peel: Peel,
}

#[derive(Debug)]
struct Peel {
    present: Vec<bool>,
    row_fill: Vec<usize>,
    column_fill: Vec<usize>,
}

impl FecMatrix {
    pub fn new(rows: u8, columns: u8) -> Result<Self> {
        if rows == 0 || columns == 0 || rows > MAX_LINES || columns > MAX_LINES {
            return Err(FecError::InvalidDimensions {
                rows,
                columns,
                max: MAX_LINES,
            });
        }
        let (rows, columns) = (rows as usize, columns as usize);
        Ok(FecMatrix {
            rows,
            columns,
            cells: vec![None; rows * columns],
            row_fill: vec![0; rows],
            column_fill: vec![0; columns],
            row_repair: vec![None; rows],
            column_repair: vec![None; columns],
            range: None,
            media_ssrc: None,
            peel: Peel {
                present: vec![false; rows * columns],
                row_fill: vec![0; rows],
                column_fill: vec![0; columns],
            },
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Sequence numbers covered by one generation.
    pub fn span(&self) -> u16 {
        (self.rows * self.columns) as u16
    }

    /// Drop every packet and forget the window, keeping allocations.
    pub fn clear(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = None);
        self.row_fill.iter_mut().for_each(|f| *f = 0);
        self.column_fill.iter_mut().for_each(|f| *f = 0);
        self.row_repair.iter_mut().for_each(|r| *r = None);
        self.column_repair.iter_mut().for_each(|r| *r = None);
        self.range = None;
        self.media_ssrc = None;
    }

    /// No window established yet.
    pub fn is_empty(&self) -> bool {
        self.range.is_none()
    }

    pub fn range(&self) -> Option<SeqRange> {
        self.range
    }

    pub fn base_sequence(&self) -> Option<u16> {
        self.range.map(|r| r.base())
    }

    pub fn is_seq_in_range(&self, seq: u16) -> bool {
        self.range.is_some_and(|r| r.contains(seq))
    }

    /// Whether the decoder should route `packet` to this matrix.
    ///
    /// Media must fall inside the window; a repair packet must carry this
    /// matrix's base sequence.
    pub fn can_accept(&self, packet: &Packet, kind: PacketKind) -> bool {
        match kind {
            PacketKind::Media => self.is_seq_in_range(packet.sequence()),
            PacketKind::Repair => match packet.fec_header() {
                Ok(fec) => self.base_sequence() == Some(fec.sn_base),
                Err(_) => false,
            },
        }
    }

    /// `(row, column)` of `seq`, if inside the window.
    pub fn position_of(&self, seq: u16) -> Option<(usize, usize)> {
        let n = self.range?.offset_of(seq)? as usize;
        Some((n / self.columns, n % self.columns))
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<&Packet> {
        self.cells.get(row * self.columns + column)?.as_ref()
    }

    pub fn row_fill(&self, row: usize) -> usize {
        self.row_fill[row]
    }

    pub fn column_fill(&self, column: usize) -> usize {
        self.column_fill[column]
    }

    pub fn has_row_repair(&self, row: usize) -> bool {
        self.row_repair[row].is_some()
    }

    pub fn has_column_repair(&self, column: usize) -> bool {
        self.column_repair[column].is_some()
    }

    /// Number of media cells currently holding a packet.
    pub fn filled_cells(&self) -> usize {
        self.row_fill.iter().sum()
    }

    // ─── Encoder side ────────────────────────────────────────────────────

    /// Insert an outgoing media packet and return any parity packets whose
    /// line it completed.
    ///
    /// A packet outside the current window starts a new generation keyed by
    /// its own sequence number. The returned repairs are unstamped: byte 1,
    /// the sequence number and the SSRC are left zero for the caller.
    pub fn insert_and_repair(&mut self, packet: Packet) -> Result<Vec<Packet>> {
        let seq = packet.sequence();
        if !self.is_seq_in_range(seq) {
            if !self.is_empty() {
                trace!(seq, base = ?self.base_sequence(), "generation exhausted, starting new matrix");
            }
            self.clear();
            self.range = Some(SeqRange::new(seq, self.span()));
        }
        let Some((row, column)) = self.position_of(seq) else {
            return Err(FecError::OutOfRange { seq });
        };
        if !self.place(row, column, packet) {
            return Ok(Vec::new());
        }

        let mut repairs = Vec::new();
        if self.row_fill[row] == self.columns && self.row_repair[row].is_none() {
            let repair = self.synthesize(Line::Row(row))?;
            self.row_repair[row] = Some(repair.clone());
            repairs.push(repair);
        }
        if self.column_fill[column] == self.rows && self.column_repair[column].is_none() {
            let repair = self.synthesize(Line::Column(column))?;
            self.column_repair[column] = Some(repair.clone());
            repairs.push(repair);
        }
        Ok(repairs)
    }

    /// XOR every packet of a complete line into a parity packet.
    fn synthesize(&self, line: Line) -> Result<Packet> {
        let base = self.base_sequence().unwrap_or_default();
        let sources: Vec<&Packet> = self.line_packets(line).collect();
        let max_region = sources
            .iter()
            .map(|p| p.payload_region().len())
            .max()
            .unwrap_or(0);
        let total = REPAIR_PAYLOAD_OFFSET + max_region;

        let mut pxcc = 0u8;
        let mut m_pt = 0u8;
        let mut length = 0u16;
        let mut ts = 0u32;
        for p in &sources {
            pxcc ^= p.flags();
            m_pt ^= p.marker_pt_byte();
            length ^= p.payload_region().len() as u16;
            ts ^= p.timestamp();
        }
        let (l, d) = match line {
            Line::Row(r) => (self.columns as u8 + 1, r as u8 + 1),
            Line::Column(c) => (c as u8 + 1, self.rows as u8 + 1),
        };

        let mut buf = Vec::new();
        buf.try_reserve_exact(total).map_err(|_| FecError::Alloc {
            what: "repair",
            size: total,
        })?;
        buf.put_u8(0x80);
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_u32(ts);
        buf.put_u32(0);
        FecHeader {
            pxcc_recovery: 0x40 | (pxcc & 0x3f),
            m_pt_recovery: m_pt,
            length_recovery: length,
            ts_recovery: ts,
            sn_base: base,
            l,
            d,
        }
        .encode(&mut buf);
        buf.resize(total, 0);
        for p in &sources {
            xor_into(&mut buf[REPAIR_PAYLOAD_OFFSET..], p.payload_region());
        }
        Packet::new(Bytes::from(buf))
    }

    // ─── Decoder side ────────────────────────────────────────────────────

    /// Insert a received media or repair packet and run the repair cascade.
    ///
    /// Returns every packet recovered as a consequence, in recovery order.
    /// Re-inserting a packet whose cell or parity slot is already filled is
    /// a no-op.
    pub fn insert_and_try_repair(
        &mut self,
        packet: Packet,
        kind: PacketKind,
    ) -> Result<Vec<Packet>> {
        let seeds = self.insert_without_repair(packet, kind)?;
        Ok(self.repair_lines(seeds))
    }

    /// Store a received packet without repairing anything.
    ///
    /// Returns the lines worth checking afterwards. Used to place a batch of
    /// packets before a single [`repair_lines`](Self::repair_lines) pass, so
    /// a packet that is about to arrive is never rebuilt from parity.
    pub fn insert_without_repair(&mut self, packet: Packet, kind: PacketKind) -> Result<Vec<Line>> {
        match kind {
            PacketKind::Media => {
                let seq = packet.sequence();
                let Some((row, column)) = self.position_of(seq) else {
                    return Err(FecError::OutOfRange { seq });
                };
                let first_media = self.media_ssrc.is_none();
                if !self.place(row, column, packet) {
                    return Ok(Vec::new());
                }
                if first_media {
                    // Lines with no siblings could not be repaired until an
                    // SSRC was known.
                    Ok(self.all_lines().collect())
                } else {
                    Ok(vec![Line::Row(row), Line::Column(column)])
                }
            }
            PacketKind::Repair => Ok(self.place_repair(packet)?.into_iter().collect()),
        }
    }

    /// Run the repair cascade starting from `lines`.
    ///
    /// Returns every packet recovered, in recovery order.
    pub fn repair_lines(&mut self, lines: Vec<Line>) -> Vec<Packet> {
        self.cascade(lines)
    }

    /// Store a parity packet in its slot. Returns the line it protects, or
    /// `None` if the slot was already filled.
    fn place_repair(&mut self, packet: Packet) -> Result<Option<Line>> {
        let fec = packet.fec_header()?;
        let line = self.locate_repair(&fec)?;
        match self.range {
            None => self.range = Some(SeqRange::new(fec.sn_base, self.span())),
            Some(r) if r.base() != fec.sn_base => {
                return Err(FecError::OutOfRange { seq: fec.sn_base });
            }
            Some(_) => {}
        }

        let slot = match line {
            Line::Row(r) => &mut self.row_repair[r],
            Line::Column(c) => &mut self.column_repair[c],
        };
        if slot.is_some() {
            return Ok(None);
        }
        *slot = Some(packet);
        Ok(Some(line))
    }

    /// Decode the L/D fields of a parity packet into the line it protects.
    pub fn locate_repair(&self, fec: &FecHeader) -> Result<Line> {
        let (Some(column), Some(row)) = (fec.l.checked_sub(1), fec.d.checked_sub(1)) else {
            return Err(FecError::MalformedRepair(format!(
                "zero L/D field (L={}, D={})",
                fec.l, fec.d
            )));
        };
        let (row, column) = (row as usize, column as usize);
        if column == self.columns && row < self.rows {
            Ok(Line::Row(row))
        } else if row == self.rows && column < self.columns {
            Ok(Line::Column(column))
        } else {
            Err(FecError::MalformedRepair(format!(
                "L={} D={} does not address a line of a {}x{} matrix",
                fec.l, fec.d, self.rows, self.columns
            )))
        }
    }

    fn cascade(&mut self, seeds: Vec<Line>) -> Vec<Packet> {
        let mut pending = VecDeque::from(seeds);
        let mut recovered = Vec::new();

        while let Some(line) = pending.pop_front() {
            let Some((row, column)) = self.missing_cell(line) else {
                continue;
            };
            match self.recover(line, row, column) {
                Ok(packet) => {
                    debug!(
                        seq = packet.sequence(),
                        row,
                        column,
                        via = ?line,
                        "recovered packet"
                    );
                    self.place(row, column, packet.clone());
                    recovered.push(packet);
                    pending.push_back(Line::Row(row));
                    pending.push_back(Line::Column(column));
                }
                Err(e) => {
                    warn!(row, column, via = ?line, error = %e, "repair failed");
                }
            }
        }
        recovered
    }

    /// The single empty cell of a repairable line.
    fn missing_cell(&self, line: Line) -> Option<(usize, usize)> {
        match line {
            Line::Row(r) => {
                if self.row_repair[r].is_none() || self.row_fill[r] + 1 != self.columns {
                    return None;
                }
                (0..self.columns)
                    .find(|&c| self.cell(r, c).is_none())
                    .map(|c| (r, c))
            }
            Line::Column(c) => {
                if self.column_repair[c].is_none() || self.column_fill[c] + 1 != self.rows {
                    return None;
                }
                (0..self.rows)
                    .find(|&r| self.cell(r, c).is_none())
                    .map(|r| (r, c))
            }
        }
    }

    /// Rebuild the packet at `(row, column)` from the line's parity packet
    /// and its present siblings.
    fn recover(&self, line: Line, row: usize, column: usize) -> Result<Packet> {
        let repair = match line {
            Line::Row(r) => self.row_repair[r].as_ref(),
            Line::Column(c) => self.column_repair[c].as_ref(),
        }
        .ok_or_else(|| FecError::MalformedRepair("line has no parity packet".into()))?;
        let fec = repair.fec_header()?;

        let mut pxcc = fec.pxcc_recovery;
        let mut m_pt = fec.m_pt_recovery;
        let mut length = fec.length_recovery;
        let mut ts = fec.ts_recovery;
        let mut sibling_ssrc = None;
        for p in self.line_packets(line) {
            pxcc ^= p.flags();
            m_pt ^= p.marker_pt_byte();
            length ^= p.payload_region().len() as u16;
            ts ^= p.timestamp();
            sibling_ssrc.get_or_insert(p.ssrc());
        }

        let length = length as usize;
        let parity = repair.repair_payload();
        if REPAIR_PAYLOAD_OFFSET + length > repair.len() {
            return Err(FecError::MalformedRepair(format!(
                "recovered length {length} exceeds parity payload of {} bytes",
                parity.len()
            )));
        }
        let ssrc = sibling_ssrc.or(self.media_ssrc).ok_or_else(|| {
            FecError::MalformedRepair("no media packet to copy the SSRC from".into())
        })?;
        let seq = self
            .range
            .map(|r| r.seq_at((row * self.columns + column) as u16))
            .ok_or_else(|| FecError::MalformedRepair("matrix has no window".into()))?;

        let total = RTP_HEADER_LEN + length;
        let mut buf = Vec::new();
        buf.try_reserve_exact(total).map_err(|_| FecError::Alloc {
            what: "recovered",
            size: total,
        })?;
        buf.put_u8(0x80 | (pxcc & 0x3f));
        buf.put_u8(m_pt);
        buf.put_u16(seq);
        buf.put_u32(ts);
        buf.put_u32(ssrc);
        buf.extend_from_slice(&parity[..length]);
        for p in self.line_packets(line) {
            xor_into(&mut buf[RTP_HEADER_LEN..], p.payload_region());
        }
        Packet::new(Bytes::from(buf))
    }

    // ─── Residual loss ───────────────────────────────────────────────────

    /// Number of cells that parity alone can never reconstruct from what
    /// this matrix currently holds.
    ///
    /// Runs the repair cascade on an occupancy bitmap without touching any
    /// packet data and without allocating. An empty matrix reports zero.
    pub fn unrecoverable_count(&mut self) -> usize {
        if self.range.is_none() {
            return 0;
        }
        self.simulate_peel();
        self.peel.present.iter().filter(|&&p| !p).count()
    }

    /// Sequence numbers that parity alone can never reconstruct, in matrix
    /// order. See [`unrecoverable_count`](Self::unrecoverable_count).
    pub fn unrecoverable_sequences(&mut self) -> Vec<u16> {
        let Some(range) = self.range else {
            return Vec::new();
        };
        self.simulate_peel();
        self.peel
            .present
            .iter()
            .enumerate()
            .filter(|(_, &p)| !p)
            .map(|(n, _)| range.seq_at(n as u16))
            .collect()
    }

    fn simulate_peel(&mut self) {
        let (rows, columns) = (self.rows, self.columns);
        let peel = &mut self.peel;
        for (dst, cell) in peel.present.iter_mut().zip(&self.cells) {
            *dst = cell.is_some();
        }
        peel.row_fill.copy_from_slice(&self.row_fill);
        peel.column_fill.copy_from_slice(&self.column_fill);

        loop {
            let mut progressed = false;
            for r in 0..rows {
                if self.row_repair[r].is_some() && peel.row_fill[r] + 1 == columns {
                    if let Some(c) = (0..columns).find(|&c| !peel.present[r * columns + c]) {
                        peel.present[r * columns + c] = true;
                        peel.row_fill[r] += 1;
                        peel.column_fill[c] += 1;
                        progressed = true;
                    }
                }
            }
            for c in 0..columns {
                if self.column_repair[c].is_some() && peel.column_fill[c] + 1 == rows {
                    if let Some(r) = (0..rows).find(|&r| !peel.present[r * columns + c]) {
                        peel.present[r * columns + c] = true;
                        peel.row_fill[r] += 1;
                        peel.column_fill[c] += 1;
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
    }

    // ─── Internals ───────────────────────────────────────────────────────

    /// Store a packet in an empty cell. Returns false if it was occupied.
    fn place(&mut self, row: usize, column: usize, packet: Packet) -> bool {
        let cell = &mut self.cells[row * self.columns + column];
        if cell.is_some() {
            return false;
        }
        self.media_ssrc.get_or_insert(packet.ssrc());
        *cell = Some(packet);
        self.row_fill[row] += 1;
        self.column_fill[column] += 1;
        true
    }

    fn all_lines(&self) -> impl Iterator<Item = Line> {
        (0..self.rows)
            .map(Line::Row)
            .chain((0..self.columns).map(Line::Column))
    }

    fn line_packets(&self, line: Line) -> impl Iterator<Item = &Packet> + '_ {
        let (start, step, count) = match line {
            Line::Row(r) => (r * self.columns, 1, self.columns),
            Line::Column(c) => (c, self.columns, self.rows),
        };
        (0..count).filter_map(move |i| self.cells[start + i * step].as_ref())
    }
}

/// XOR `src` into the front of `dst`, stopping at the shorter of the two.
#[inline]
fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RtpHeader;

    const SSRC: u32 = 0xCAFE_F00D;

    fn media(seq: u16, payload: &[u8]) -> Packet {
        Packet::build(
            &RtpHeader::new(96, seq, 90_000 + seq as u32 * 3000, SSRC),
            payload,
        )
        .unwrap()
    }

    fn payload_for(seq: u16) -> Vec<u8> {
        (0..(seq % 7 + 3)).map(|i| (seq as u8).wrapping_mul(31) ^ i as u8).collect()
    }

    /// Encode a full generation and return (media, repairs).
    fn generation(rows: u8, columns: u8, base: u16) -> (Vec<Packet>, Vec<Packet>) {
        let mut enc = FecMatrix::new(rows, columns).unwrap();
        let mut media_out = Vec::new();
        let mut repairs = Vec::new();
        for i in 0..(rows as u16 * columns as u16) {
            let seq = base.wrapping_add(i);
            let p = media(seq, &payload_for(seq));
            repairs.extend(enc.insert_and_repair(p.clone()).unwrap());
            media_out.push(p);
        }
        (media_out, repairs)
    }

    fn assert_fill_invariant(m: &FecMatrix) {
        for r in 0..m.rows() {
            let n = (0..m.columns()).filter(|&c| m.cell(r, c).is_some()).count();
            assert_eq!(m.row_fill(r), n, "row {r}");
        }
        for c in 0..m.columns() {
            let n = (0..m.rows()).filter(|&r| m.cell(r, c).is_some()).count();
            assert_eq!(m.column_fill(c), n, "column {c}");
        }
    }

    // ─── Construction ───────────────────────────────────────────────────

    #[test]
    fn rejects_bad_dimensions() {
        assert!(FecMatrix::new(0, 4).is_err());
        assert!(FecMatrix::new(4, 0).is_err());
        assert!(FecMatrix::new(33, 4).is_err());
        assert!(FecMatrix::new(32, 32).is_ok());
    }

    #[test]
    fn clear_resets_everything() {
        let mut m = FecMatrix::new(2, 2).unwrap();
        m.insert_and_repair(media(10, b"abc")).unwrap();
        m.insert_and_repair(media(11, b"def")).unwrap();
        assert!(m.has_row_repair(0));

        m.clear();
        assert!(m.is_empty());
        assert_eq!(m.filled_cells(), 0);
        assert!(!m.has_row_repair(0));
        assert!(m.unrecoverable_sequences().is_empty());
        assert_eq!(m.unrecoverable_count(), 0);
    }

    // ─── Encoder side ───────────────────────────────────────────────────

    #[test]
    fn encoder_emits_row_then_column_parity() {
        let (_, repairs) = generation(3, 3, 100);
        assert_eq!(repairs.len(), 6);

        let headers: Vec<FecHeader> = repairs.iter().map(|r| r.fec_header().unwrap()).collect();
        // First row completes at seq 102.
        assert_eq!((headers[0].l, headers[0].d), (4, 1));
        // Last packet (108) completes row 2 and column 2.
        let last_row = headers.iter().find(|h| h.d == 3 && h.l == 4).unwrap();
        let last_col = headers.iter().find(|h| h.l == 3 && h.d == 4).unwrap();
        assert_eq!(last_row.sn_base, 100);
        assert_eq!(last_col.sn_base, 100);
    }

    #[test]
    fn repair_layout_fields() {
        let mut m = FecMatrix::new(1, 2).unwrap();
        let mut a = media(7, &[0xAA, 0xBB, 0xCC]).as_bytes().to_vec();
        a[0] = 0x80 | 0x21; // padding + one CSRC bit
        let a = Packet::try_from(a).unwrap();
        let b = media(8, &[0x0F]);
        // One row: every packet also completes its own column.
        assert_eq!(m.insert_and_repair(a.clone()).unwrap().len(), 1);
        let repairs = m.insert_and_repair(b.clone()).unwrap();
        assert_eq!(repairs.len(), 2);
        let r = &repairs[0];

        assert_eq!(r.flags(), 0x80);
        let ts = a.timestamp() ^ b.timestamp();
        assert_eq!(r.timestamp(), ts);
        let fec = r.fec_header().unwrap();
        assert_eq!(fec.pxcc_recovery, 0x40 | 0x21);
        assert_eq!(fec.m_pt_recovery, 96 ^ 96);
        assert_eq!(fec.length_recovery, 3 ^ 1);
        assert_eq!(fec.ts_recovery, ts);
        assert_eq!(fec.sn_base, 7);
        assert_eq!((fec.l, fec.d), (3, 1));
        assert_eq!(r.len(), REPAIR_PAYLOAD_OFFSET + 3);
        assert_eq!(r.repair_payload(), &[0xAA ^ 0x0F, 0xBB, 0xCC]);
    }

    #[test]
    fn encoder_out_of_range_starts_new_generation() {
        let mut m = FecMatrix::new(2, 2).unwrap();
        m.insert_and_repair(media(100, b"a")).unwrap();
        assert_eq!(m.base_sequence(), Some(100));
        m.insert_and_repair(media(104, b"b")).unwrap();
        assert_eq!(m.base_sequence(), Some(104));
        assert_eq!(m.filled_cells(), 1);
    }

    #[test]
    fn encoder_duplicate_is_noop() {
        let mut m = FecMatrix::new(2, 2).unwrap();
        m.insert_and_repair(media(1, b"a")).unwrap();
        assert_eq!(m.insert_and_repair(media(2, b"b")).unwrap().len(), 1);
        assert!(m.insert_and_repair(media(2, b"b")).unwrap().is_empty());
        assert_eq!(m.filled_cells(), 2);
    }

    // ─── Decoder side ───────────────────────────────────────────────────

    #[test]
    fn recovers_single_loss_in_row() {
        let (media_pkts, repairs) = generation(3, 3, 100);
        let mut dec = FecMatrix::new(3, 3).unwrap();
        dec.insert_and_try_repair(repairs[0].clone(), PacketKind::Repair)
            .unwrap();
        let mut recovered = Vec::new();
        for p in media_pkts.iter().filter(|p| p.sequence() != 101) {
            if dec.can_accept(p, PacketKind::Media) {
                recovered.extend(dec.insert_and_try_repair(p.clone(), PacketKind::Media).unwrap());
            }
        }
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0], media_pkts[1]);
        assert_fill_invariant(&dec);
    }

    #[test]
    fn media_before_any_repair_is_out_of_range() {
        let mut dec = FecMatrix::new(2, 2).unwrap();
        let err = dec
            .insert_and_try_repair(media(5, b"x"), PacketKind::Media)
            .unwrap_err();
        assert!(matches!(err, FecError::OutOfRange { seq: 5 }));
    }

    #[test]
    fn repair_with_other_base_is_rejected() {
        let (_, a) = generation(2, 2, 0);
        let (_, b) = generation(2, 2, 4);
        let mut dec = FecMatrix::new(2, 2).unwrap();
        dec.insert_and_try_repair(a[0].clone(), PacketKind::Repair)
            .unwrap();
        assert!(!dec.can_accept(&b[0], PacketKind::Repair));
        assert!(dec
            .insert_and_try_repair(b[0].clone(), PacketKind::Repair)
            .is_err());
    }

    #[test]
    fn zero_or_out_of_bounds_ld_is_malformed() {
        let (_, repairs) = generation(2, 2, 0);
        for (l, d) in [(0, 1), (1, 0), (5, 1), (3, 3), (2, 2)] {
            let mut raw = repairs[0].as_bytes().to_vec();
            raw[22] = l;
            raw[23] = d;
            let mut dec = FecMatrix::new(2, 2).unwrap();
            let err = dec
                .insert_and_try_repair(Packet::try_from(raw).unwrap(), PacketKind::Repair)
                .unwrap_err();
            assert!(matches!(err, FecError::MalformedRepair(_)), "L={l} D={d}");
        }
    }

    #[test]
    fn truncated_parity_is_not_used() {
        let (media_pkts, repairs) = generation(1, 2, 0);
        let mut raw = repairs[0].as_bytes().to_vec();
        raw.truncate(REPAIR_PAYLOAD_OFFSET + 1);
        let mut dec = FecMatrix::new(1, 2).unwrap();
        dec.insert_and_try_repair(Packet::try_from(raw).unwrap(), PacketKind::Repair)
            .unwrap();
        let out = dec
            .insert_and_try_repair(media_pkts[0].clone(), PacketKind::Media)
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(dec.filled_cells(), 1);
    }

    #[test]
    fn cascade_recovers_through_columns() {
        // 2x2: lose 500 and 501 (whole first row). Column parities repair both.
        let (media_pkts, repairs) = generation(2, 2, 500);
        let mut dec = FecMatrix::new(2, 2).unwrap();
        for r in repairs.iter().filter(|r| r.fec_header().unwrap().d == 3) {
            dec.insert_and_try_repair(r.clone(), PacketKind::Repair)
                .unwrap();
        }
        let mut recovered = Vec::new();
        for p in &media_pkts[2..] {
            recovered.extend(dec.insert_and_try_repair(p.clone(), PacketKind::Media).unwrap());
        }
        recovered.sort_by_key(|p| p.sequence());
        assert_eq!(recovered, media_pkts[..2].to_vec());
        assert_eq!(dec.filled_cells(), 4);
    }

    #[test]
    fn cascade_chains_row_into_column() {
        // 3x3, missing 0 and 3: row 1 repairs 3, then column 0 repairs 0.
        let (media_pkts, repairs) = generation(3, 3, 0);
        let mut dec = FecMatrix::new(3, 3).unwrap();
        let col0 = repairs
            .iter()
            .find(|r| r.fec_header().unwrap().l == 1)
            .unwrap();
        let row1 = repairs
            .iter()
            .find(|r| r.fec_header().unwrap().d == 2)
            .unwrap();
        dec.insert_and_try_repair(col0.clone(), PacketKind::Repair)
            .unwrap();
        for p in media_pkts.iter().filter(|p| ![0, 3].contains(&p.sequence())) {
            assert!(dec
                .insert_and_try_repair(p.clone(), PacketKind::Media)
                .unwrap()
                .is_empty());
        }
        let recovered = dec
            .insert_and_try_repair(row1.clone(), PacketKind::Repair)
            .unwrap();
        let seqs: Vec<u16> = recovered.iter().map(Packet::sequence).collect();
        assert_eq!(seqs, vec![3, 0]);
        assert_eq!(recovered[1], media_pkts[0]);
    }

    #[test]
    fn wraparound_window_positions_both_sides() {
        let (media_pkts, repairs) = generation(3, 3, 65532);
        let mut dec = FecMatrix::new(3, 3).unwrap();
        dec.insert_and_try_repair(repairs[0].clone(), PacketKind::Repair)
            .unwrap();
        assert!(dec.is_seq_in_range(65535));
        assert!(dec.is_seq_in_range(0));
        assert!(dec.is_seq_in_range(4));
        assert!(!dec.is_seq_in_range(5));
        assert_eq!(dec.position_of(65535), Some((1, 0)));
        assert_eq!(dec.position_of(0), Some((1, 1)));

        // Seq 0 (row 1) is lost. Row 0 parity is already held, so 65534
        // is rebuilt before it arrives, across the wrap.
        let row1 = repairs
            .iter()
            .find(|r| r.fec_header().unwrap().d == 2)
            .unwrap();
        dec.insert_and_try_repair(row1.clone(), PacketKind::Repair)
            .unwrap();
        let mut recovered = Vec::new();
        for p in media_pkts.iter().filter(|p| p.sequence() != 0) {
            recovered.extend(dec.insert_and_try_repair(p.clone(), PacketKind::Media).unwrap());
        }
        let seqs: Vec<u16> = recovered.iter().map(Packet::sequence).collect();
        assert_eq!(seqs, vec![65534, 0]);
        assert_eq!(recovered[0], media_pkts[2]);
        assert_eq!(recovered[1], media_pkts[4]);
        assert_eq!(dec.filled_cells(), 9);
        assert_fill_invariant(&dec);
    }

    #[test]
    fn batch_placement_repairs_only_what_is_missing() {
        let (media_pkts, repairs) = generation(3, 3, 200);
        let mut dec = FecMatrix::new(3, 3).unwrap();
        let mut lines = dec
            .insert_without_repair(repairs[0].clone(), PacketKind::Repair)
            .unwrap();
        assert_eq!(lines, vec![Line::Row(0)]);
        // Row 0 complete before any repair runs; 204 is the only loss.
        for p in media_pkts.iter().filter(|p| p.sequence() != 204) {
            lines.extend(dec.insert_without_repair(p.clone(), PacketKind::Media).unwrap());
        }
        assert_eq!(dec.filled_cells(), 8);
        assert!(dec.repair_lines(lines).is_empty());

        let row1 = repairs
            .iter()
            .find(|r| r.fec_header().unwrap().d == 2)
            .unwrap();
        let lines = dec
            .insert_without_repair(row1.clone(), PacketKind::Repair)
            .unwrap();
        assert_eq!(dec.repair_lines(lines), vec![media_pkts[4].clone()]);
        assert!(dec
            .insert_without_repair(media_pkts[4].clone(), PacketKind::Media)
            .unwrap()
            .is_empty());
        assert_fill_invariant(&dec);
    }

    #[test]
    fn single_column_matrix_waits_for_an_ssrc() {
        // 2x1: a row parity is a copy of its single packet.
        let (media_pkts, repairs) = generation(2, 1, 40);
        let row1 = repairs
            .iter()
            .find(|r| {
                let h = r.fec_header().unwrap();
                h.l == 2 && h.d == 2
            })
            .unwrap();
        let mut dec = FecMatrix::new(2, 1).unwrap();
        let out = dec
            .insert_and_try_repair(row1.clone(), PacketKind::Repair)
            .unwrap();
        // No media yet: nothing to copy the SSRC from.
        assert!(out.is_empty());
        assert_eq!(dec.filled_cells(), 0);

        let out = dec
            .insert_and_try_repair(media_pkts[0].clone(), PacketKind::Media)
            .unwrap();
        assert_eq!(out, vec![media_pkts[1].clone()]);
        assert!(dec.unrecoverable_sequences().is_empty());
    }

    #[test]
    fn duplicate_media_and_repair_are_noops() {
        let (media_pkts, repairs) = generation(2, 2, 0);
        let mut dec = FecMatrix::new(2, 2).unwrap();
        dec.insert_and_try_repair(repairs[0].clone(), PacketKind::Repair)
            .unwrap();
        assert!(dec
            .insert_and_try_repair(repairs[0].clone(), PacketKind::Repair)
            .unwrap()
            .is_empty());
        dec.insert_and_try_repair(media_pkts[3].clone(), PacketKind::Media)
            .unwrap();
        dec.insert_and_try_repair(media_pkts[3].clone(), PacketKind::Media)
            .unwrap();
        assert_eq!(dec.filled_cells(), 1);
        assert_fill_invariant(&dec);
    }

    // ─── Residual loss ──────────────────────────────────────────────────

    #[test]
    fn unrecoverable_reports_stuck_cells() {
        // 2x2 with no parity and only seq 0 present.
        let (media_pkts, repairs) = generation(2, 2, 10);
        let mut dec = FecMatrix::new(2, 2).unwrap();
        let row0 = repairs
            .iter()
            .find(|r| r.fec_header().unwrap().d == 1)
            .unwrap();
        dec.insert_and_try_repair(row0.clone(), PacketKind::Repair)
            .unwrap();
        dec.insert_and_try_repair(media_pkts[0].clone(), PacketKind::Media)
            .unwrap();
        // Seq 11 recovered by row 0; 12 and 13 have no parity.
        assert_eq!(dec.filled_cells(), 2);
        assert_eq!(dec.unrecoverable_sequences(), vec![12, 13]);
        assert_eq!(dec.unrecoverable_count(), 2);
        // Filling the stuck cells clears the count.
        for p in &media_pkts[2..] {
            dec.insert_and_try_repair(p.clone(), PacketKind::Media)
                .unwrap();
        }
        assert_eq!(dec.unrecoverable_count(), 0);
    }
}
