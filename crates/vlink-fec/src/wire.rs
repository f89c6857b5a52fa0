//! # Wire Shapes
//!
//! One owned byte buffer, [`Packet`], carries every layout the FEC layer
//! touches. Named decoders validate length before reading any offset.
//!
//! ## Media packet (RTP, RFC 3550)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! ## Repair packet (RTP header + 12-byte FEC header, RFC 8627 style)
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0|1|P|X|  CC   |M| PT recovery |        Length recovery        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          TS recovery                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            SN base            |       L       |       D       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     XOR of payload regions                    |
//! ```
//!
//! ## Generic NACK (RTCP RTPFB, RFC 4585)
//!
//! `0x81 0xcd len(16) sender_ssrc(32) media_ssrc(32)` followed by
//! `len - 2` items of `PID(16) BLP(16)`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FecError, Result};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Fixed RTP header size (no CSRCs).
pub const RTP_HEADER_LEN: usize = 12;

/// FEC header size following the RTP header of a repair packet.
pub const FEC_HEADER_LEN: usize = 12;

/// Offset of the XOR payload inside a repair packet.
pub const REPAIR_PAYLOAD_OFFSET: usize = RTP_HEADER_LEN + FEC_HEADER_LEN;

/// RTCP header + sender SSRC + media SSRC.
pub const NACK_HEADER_LEN: usize = 12;

/// Size of a single (PID, BLP) item.
pub const NACK_ITEM_LEN: usize = 4;

/// `V=2, P=0, FMT=1` (generic NACK).
pub const NACK_FIRST_BYTE: u8 = 0x81;

/// RTCP packet type 205: transport-layer feedback.
pub const RTCP_RTPFB: u8 = 0xcd;

/// Highest valid 7-bit RTP payload type.
pub const MAX_PAYLOAD_TYPE: u8 = 0x7f;

/// Largest packet whose payload-region length still fits the 16-bit
/// length-recovery field of a repair header.
pub const MAX_PACKET_LEN: usize = u16::MAX as usize;

// ─── RTP Header ──────────────────────────────────────────────────────────────

/// Decoded fixed RTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Byte 0 verbatim: version, padding, extension, CSRC count.
    pub flags: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Version 2 header with no padding, extension or CSRCs.
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        RtpHeader {
            flags: 0x80,
            marker: false,
            payload_type: payload_type & MAX_PAYLOAD_TYPE,
            sequence,
            timestamp,
            ssrc,
        }
    }

    pub fn with_marker(mut self) -> Self {
        self.marker = true;
        self
    }

    pub fn version(&self) -> u8 {
        self.flags >> 6
    }

    pub fn padding(&self) -> bool {
        self.flags & 0x20 != 0
    }

    pub fn extension(&self) -> bool {
        self.flags & 0x10 != 0
    }

    pub fn csrc_count(&self) -> u8 {
        self.flags & 0x0f
    }

    /// Byte 1: marker bit and payload type.
    pub fn marker_pt_byte(&self) -> u8 {
        ((self.marker as u8) << 7) | (self.payload_type & MAX_PAYLOAD_TYPE)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flags);
        buf.put_u8(self.marker_pt_byte());
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < RTP_HEADER_LEN {
            return None;
        }
        let flags = buf.get_u8();
        let m_pt = buf.get_u8();
        Some(RtpHeader {
            flags,
            marker: m_pt & 0x80 != 0,
            payload_type: m_pt & MAX_PAYLOAD_TYPE,
            sequence: buf.get_u16(),
            timestamp: buf.get_u32(),
            ssrc: buf.get_u32(),
        })
    }
}

// ─── FEC Header ──────────────────────────────────────────────────────────────

/// The 12-byte FEC header carried at bytes 12..24 of a repair packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecHeader {
    /// `0x40 | (XOR of source P/X/CC bits)`.
    pub pxcc_recovery: u8,
    /// XOR of source marker + payload-type bytes.
    pub m_pt_recovery: u8,
    /// XOR of source payload-region lengths.
    pub length_recovery: u16,
    /// XOR of source timestamps.
    pub ts_recovery: u32,
    /// First media sequence number of the protected matrix.
    pub sn_base: u16,
    /// Column index + 1, or `columns + 1` for a row parity packet.
    pub l: u8,
    /// Row index + 1, or `rows + 1` for a column parity packet.
    pub d: u8,
}

impl FecHeader {
    pub const ENCODED_LEN: usize = FEC_HEADER_LEN;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.pxcc_recovery);
        buf.put_u8(self.m_pt_recovery);
        buf.put_u16(self.length_recovery);
        buf.put_u32(self.ts_recovery);
        buf.put_u16(self.sn_base);
        buf.put_u8(self.l);
        buf.put_u8(self.d);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        Some(FecHeader {
            pxcc_recovery: buf.get_u8(),
            m_pt_recovery: buf.get_u8(),
            length_recovery: buf.get_u16(),
            ts_recovery: buf.get_u32(),
            sn_base: buf.get_u16(),
            l: buf.get_u8(),
            d: buf.get_u8(),
        })
    }
}

// ─── Packet ──────────────────────────────────────────────────────────────────

/// An owned, cheaply clonable RTP-shaped buffer.
///
/// Construction guarantees at least [`RTP_HEADER_LEN`] bytes, so the fixed
/// header accessors never go out of bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Bytes,
}

impl Packet {
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < RTP_HEADER_LEN {
            return Err(FecError::Truncated {
                what: "RTP packet",
                len: data.len(),
                min: RTP_HEADER_LEN,
            });
        }
        if data.len() > MAX_PACKET_LEN {
            return Err(FecError::Oversized {
                len: data.len(),
                max: MAX_PACKET_LEN,
            });
        }
        Ok(Packet { data })
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Self::new(Bytes::copy_from_slice(data))
    }

    /// Assemble a media packet from a header and payload.
    pub fn build(header: &RtpHeader, payload: &[u8]) -> Result<Self> {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + payload.len());
        header.encode(&mut buf);
        buf.put_slice(payload);
        Self::new(buf.freeze())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn rtp_header(&self) -> RtpHeader {
        RtpHeader {
            flags: self.flags(),
            marker: self.data[1] & 0x80 != 0,
            payload_type: self.payload_type(),
            sequence: self.sequence(),
            timestamp: self.timestamp(),
            ssrc: self.ssrc(),
        }
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.data[0]
    }

    #[inline]
    pub fn marker_pt_byte(&self) -> u8 {
        self.data[1]
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.data[1] & MAX_PAYLOAD_TYPE
    }

    #[inline]
    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    /// Everything after the fixed RTP header (CSRCs, extension, payload, padding).
    pub fn payload_region(&self) -> &[u8] {
        &self.data[RTP_HEADER_LEN..]
    }

    /// Whether this packet carries the given repair payload type.
    pub fn is_repair(&self, repair_payload_type: u8) -> bool {
        self.payload_type() == repair_payload_type
    }

    /// Decode the FEC header of a repair packet.
    pub fn fec_header(&self) -> Result<FecHeader> {
        let mut view = self.data.get(RTP_HEADER_LEN..).unwrap_or_default();
        FecHeader::decode(&mut view).ok_or(FecError::Truncated {
            what: "repair packet",
            len: self.data.len(),
            min: REPAIR_PAYLOAD_OFFSET,
        })
    }

    /// XOR payload of a repair packet (empty if the packet is too short).
    pub fn repair_payload(&self) -> &[u8] {
        self.data.get(REPAIR_PAYLOAD_OFFSET..).unwrap_or_default()
    }

    /// Copy of this packet with the RTP marker/PT byte, sequence number and
    /// SSRC overwritten. Used to stamp synthesised repair packets.
    pub fn restamped(&self, marker_pt: u8, sequence: u16, ssrc: u32) -> Result<Packet> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(self.data.len())
            .map_err(|_| FecError::Alloc {
                what: "repair",
                size: self.data.len(),
            })?;
        buf.extend_from_slice(&self.data);
        buf[1] = marker_pt;
        buf[2..4].copy_from_slice(&sequence.to_be_bytes());
        buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
        Ok(Packet {
            data: Bytes::from(buf),
        })
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl TryFrom<Vec<u8>> for Packet {
    type Error = FecError;

    fn try_from(value: Vec<u8>) -> Result<Self> {
        Packet::new(Bytes::from(value))
    }
}

// ─── NACK ────────────────────────────────────────────────────────────────────

/// One generic-NACK item: a lost packet id plus a bitmask of the 16
/// sequence numbers that follow it (bit `i` set ⇒ `pid + i + 1` lost).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NackItem {
    pub pid: u16,
    pub blp: u16,
}

impl NackItem {
    pub fn new(pid: u16) -> Self {
        NackItem { pid, blp: 0 }
    }

    /// Mark `pid + offset` lost. `offset` must be in `1..=16`.
    pub fn mark(&mut self, offset: u16) {
        debug_assert!((1..=16).contains(&offset));
        self.blp |= 1 << (offset - 1);
    }

    /// Every sequence number this item reports lost, PID first.
    pub fn lost_sequences(&self) -> impl Iterator<Item = u16> + '_ {
        std::iter::once(self.pid).chain(
            (0..16u16)
                .filter(move |bit| self.blp & (1 << bit) != 0)
                .map(move |bit| self.pid.wrapping_add(bit + 1)),
        )
    }
}

/// RTCP generic NACK (RFC 4585 §6.2.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackPacket {
    pub sender_ssrc: u32,
    /// Reserved; written as zero.
    pub media_ssrc: u32,
    pub items: Vec<NackItem>,
}

impl NackPacket {
    pub fn new(sender_ssrc: u32, items: Vec<NackItem>) -> Self {
        NackPacket {
            sender_ssrc,
            media_ssrc: 0,
            items,
        }
    }

    pub fn encoded_len(&self) -> usize {
        NACK_HEADER_LEN + self.items.len() * NACK_ITEM_LEN
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(NACK_FIRST_BYTE);
        buf.put_u8(RTCP_RTPFB);
        buf.put_u16((self.items.len() + 2) as u16);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        for item in &self.items {
            buf.put_u16(item.pid);
            buf.put_u16(item.blp);
        }
    }

    /// Encode into a standalone buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < NACK_HEADER_LEN {
            return Err(FecError::Truncated {
                what: "NACK packet",
                len: data.len(),
                min: NACK_HEADER_LEN,
            });
        }
        let mut buf = data;
        let _first = buf.get_u8();
        let packet_type = buf.get_u8();
        if packet_type != RTCP_RTPFB {
            return Err(FecError::MalformedNack(format!(
                "packet type {packet_type} is not RTPFB"
            )));
        }
        let length = buf.get_u16() as usize;
        let Some(item_count) = length.checked_sub(2) else {
            return Err(FecError::MalformedNack(format!(
                "length field {length} below header size"
            )));
        };
        let needed = NACK_HEADER_LEN + item_count * NACK_ITEM_LEN;
        if data.len() < needed {
            return Err(FecError::MalformedNack(format!(
                "{item_count} items declared, {} bytes present (need {needed})",
                data.len()
            )));
        }
        let sender_ssrc = buf.get_u32();
        let media_ssrc = buf.get_u32();
        let items = (0..item_count)
            .map(|_| NackItem {
                pid: buf.get_u16(),
                blp: buf.get_u16(),
            })
            .collect();
        Ok(NackPacket {
            sender_ssrc,
            media_ssrc,
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Packet ─────────────────────────────────────────────────────────

    #[test]
    fn packet_rejects_short_buffer() {
        let err = Packet::from_slice(&[0x80; 11]).unwrap_err();
        assert!(matches!(err, FecError::Truncated { len: 11, min: 12, .. }));
    }

    #[test]
    fn packet_header_accessors() {
        let header = RtpHeader::new(96, 0xBEEF, 0x0102_0304, 0xAABB_CCDD).with_marker();
        let pkt = Packet::build(&header, b"payload").unwrap();

        assert_eq!(pkt.len(), 19);
        assert_eq!(pkt.sequence(), 0xBEEF);
        assert_eq!(pkt.timestamp(), 0x0102_0304);
        assert_eq!(pkt.ssrc(), 0xAABB_CCDD);
        assert_eq!(pkt.payload_type(), 96);
        assert_eq!(pkt.marker_pt_byte(), 0x80 | 96);
        assert_eq!(pkt.payload_region(), b"payload");
        assert_eq!(pkt.rtp_header(), header);
    }

    #[test]
    fn rtp_header_flag_bits() {
        let mut header = RtpHeader::new(0, 0, 0, 0);
        header.flags = 0x80 | 0x20 | 0x10 | 0x03;
        assert_eq!(header.version(), 2);
        assert!(header.padding());
        assert!(header.extension());
        assert_eq!(header.csrc_count(), 3);
    }

    #[test]
    fn fec_header_requires_24_bytes() {
        let pkt = Packet::from_slice(&[0x80; 20]).unwrap();
        assert!(pkt.fec_header().is_err());
        assert!(pkt.repair_payload().is_empty());
    }

    #[test]
    fn fec_header_decodes_fields() {
        let mut buf = BytesMut::new();
        RtpHeader::new(99, 1, 0, 0).encode(&mut buf);
        FecHeader {
            pxcc_recovery: 0x41,
            m_pt_recovery: 0x60,
            length_recovery: 0x0123,
            ts_recovery: 0xDEAD_BEEF,
            sn_base: 65530,
            l: 4,
            d: 2,
        }
        .encode(&mut buf);
        buf.put_slice(&[1, 2, 3]);
        let pkt = Packet::new(buf.freeze()).unwrap();

        let fec = pkt.fec_header().unwrap();
        assert_eq!(fec.length_recovery, 0x0123);
        assert_eq!(fec.ts_recovery, 0xDEAD_BEEF);
        assert_eq!(fec.sn_base, 65530);
        assert_eq!((fec.l, fec.d), (4, 2));
        assert_eq!(pkt.repair_payload(), &[1, 2, 3]);
    }

    #[test]
    fn restamp_overwrites_only_stamped_fields() {
        let pkt = Packet::build(&RtpHeader::new(10, 5, 777, 1), b"abc").unwrap();
        let stamped = pkt.restamped(0x80 | 99, 42, 0x5566_7788).unwrap();
        assert_eq!(stamped.payload_type(), 99);
        assert_eq!(stamped.sequence(), 42);
        assert_eq!(stamped.ssrc(), 0x5566_7788);
        assert_eq!(stamped.timestamp(), 777);
        assert_eq!(stamped.payload_region(), b"abc");
        // Original untouched.
        assert_eq!(pkt.sequence(), 5);
    }

    // ─── NACK ───────────────────────────────────────────────────────────

    #[test]
    fn nack_layout_matches_rtcp() {
        let nack = NackPacket::new(0x3344_5566, vec![NackItem { pid: 102, blp: 1 }]);
        let bytes = nack.to_bytes();
        assert_eq!(
            &bytes[..],
            &[0x81, 0xcd, 0x00, 0x03, 0x33, 0x44, 0x55, 0x66, 0, 0, 0, 0, 0x00, 102, 0x00, 0x01]
        );
        assert_eq!(NackPacket::decode(&bytes).unwrap(), nack);
    }

    #[test]
    fn nack_item_count_must_fit_length() {
        let mut bytes = NackPacket::new(1, vec![NackItem::new(7)]).to_bytes().to_vec();
        // Claim three items while carrying one.
        bytes[3] = 5;
        let err = NackPacket::decode(&bytes).unwrap_err();
        assert!(matches!(err, FecError::MalformedNack(_)));
    }

    #[test]
    fn nack_rejects_wrong_packet_type() {
        let mut bytes = NackPacket::new(1, vec![]).to_bytes().to_vec();
        bytes[1] = 0xc8;
        assert!(NackPacket::decode(&bytes).is_err());
    }

    #[test]
    fn nack_rejects_length_below_header() {
        let mut bytes = NackPacket::new(1, vec![]).to_bytes().to_vec();
        bytes[3] = 1;
        assert!(NackPacket::decode(&bytes).is_err());
    }

    #[test]
    fn nack_item_expands_bitmask() {
        let mut item = NackItem::new(65534);
        item.mark(1);
        item.mark(3);
        item.mark(16);
        let lost: Vec<u16> = item.lost_sequences().collect();
        assert_eq!(lost, vec![65534, 65535, 1, 14]);
    }
}
