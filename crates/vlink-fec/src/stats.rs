//! # FEC Statistics
//!
//! Counter snapshots for the encoder and decoder. Serializable so the
//! embedding pipeline can log or export them as JSON.

use serde::Serialize;

// ─── Encoder Stats ──────────────────────────────────────────────────────────

/// Aggregate encoder-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EncoderStats {
    /// Media packets forwarded downstream (first transmission only).
    pub media_packets: u64,
    /// Parity packets synthesised and forwarded.
    pub repair_packets: u64,
    /// NACK packets received.
    pub nacks_received: u64,
    /// NACK packets rejected as malformed.
    pub malformed_nacks: u64,
    /// Cached packets re-sent in reply to NACKs.
    pub retransmissions: u64,
    /// Requested sequences no longer (or never) in the cache.
    pub retransmit_misses: u64,
    /// Packets evicted from the retransmission cache.
    pub cache_evictions: u64,
}

impl EncoderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parity overhead relative to media.
    pub fn repair_ratio(&self) -> f64 {
        if self.media_packets == 0 {
            0.0
        } else {
            self.repair_packets as f64 / self.media_packets as f64
        }
    }
}

// ─── Decoder Stats ──────────────────────────────────────────────────────────

/// Aggregate decoder-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DecoderStats {
    pub media_received: u64,
    pub repairs_received: u64,
    /// Media packets whose slot was already filled.
    pub duplicates: u64,
    /// Media packets that arrived after their slot was emitted or skipped.
    pub late_packets: u64,
    /// Packets reconstructed from parity.
    pub packets_recovered: u64,
    /// Packets handed to the output callback.
    pub packets_delivered: u64,
    /// Sequences the output scheduler gave up on.
    pub sequences_skipped: u64,
    pub nacks_sent: u64,
    /// Media packets dropped from a full cache list.
    pub cache_overflows: u64,
    /// Matrices cleared to make room for a new generation.
    pub generations_recycled: u64,
    /// Sequences an evicted generation could never have repaired.
    pub unrecoverable_sequences: u64,
    /// Packets rejected as malformed.
    pub malformed_packets: u64,
    /// Reorder buffer restarts after a large sequence jump.
    pub stream_resyncs: u64,
}

impl DecoderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of losses repaired by FEC.
    pub fn recovery_ratio(&self) -> f64 {
        let lost = self.packets_recovered + self.sequences_skipped;
        if lost == 0 {
            0.0
        } else {
            self.packets_recovered as f64 / lost as f64
        }
    }

    /// Residual loss seen by the consumer.
    pub fn loss_ratio(&self) -> f64 {
        let total = self.packets_delivered + self.sequences_skipped;
        if total == 0 {
            0.0
        } else {
            self.sequences_skipped as f64 / total as f64
        }
    }
}
