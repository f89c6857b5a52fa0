//! # FEC Encoder
//!
//! Sits in the send path. Every outgoing media packet is forwarded
//! unchanged, cached for retransmission and fed into a single
//! [`FecMatrix`]; whenever a row or column completes, the synthesised
//! parity packet is stamped with the encoder's own payload type, sequence
//! counter and SSRC, then forwarded through the same callback.
//!
//! NACKs from the far end are answered from the retransmission cache with
//! the original media packets.
//!
//! All methods take `&self`, so one encoder can be shared between the media
//! producer and the feedback receiver behind an `Arc`.

use std::sync::Mutex;

use tracing::{debug, trace, warn};

use crate::arq::{requested_sequences, RetransmitCache};
use crate::config::EncoderConfig;
use crate::error::{FecError, Result};
use crate::matrix::FecMatrix;
use crate::stats::EncoderStats;
use crate::util::lock_or_recover;
use crate::wire::{NackPacket, Packet};

/// Downstream sender for media, parity and retransmitted packets.
pub type SendCallback = Box<dyn Fn(Packet) + Send + Sync>;

struct EncoderState {
    matrix: FecMatrix,
    next_repair_seq: u16,
}

pub struct FecEncoder {
    config: EncoderConfig,
    state: Mutex<EncoderState>,
    cache: Mutex<RetransmitCache>,
    stats: Mutex<EncoderStats>,
    on_packet: SendCallback,
}

// ─── Builder ─────────────────────────────────────────────────────────────────

pub struct FecEncoderBuilder {
    config: EncoderConfig,
    on_packet: Option<SendCallback>,
}

impl FecEncoderBuilder {
    /// Payload type for parity packets (0..=127).
    pub fn payload_type(mut self, payload_type: u8) -> Self {
        self.config.payload_type = payload_type;
        self
    }

    /// SSRC for parity packets.
    pub fn ssrc(mut self, ssrc: u32) -> Self {
        self.config.ssrc = ssrc;
        self
    }

    pub fn on_packet<F>(mut self, f: F) -> Self
    where
        F: Fn(Packet) + Send + Sync + 'static,
    {
        self.on_packet = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Result<FecEncoder> {
        self.config.validate()?;
        let on_packet = self.on_packet.ok_or(FecError::MissingCallback("packet"))?;
        let matrix = FecMatrix::new(self.config.matrix.rows, self.config.matrix.columns)?;
        debug!(
            rows = self.config.matrix.rows,
            columns = self.config.matrix.columns,
            payload_type = self.config.payload_type,
            ssrc = self.config.ssrc,
            "FEC encoder ready"
        );
        Ok(FecEncoder {
            cache: Mutex::new(RetransmitCache::new(self.config.retransmit_capacity)),
            state: Mutex::new(EncoderState {
                matrix,
                next_repair_seq: 0,
            }),
            stats: Mutex::new(EncoderStats::new()),
            config: self.config,
            on_packet,
        })
    }
}

// ─── Encoder ─────────────────────────────────────────────────────────────────

impl FecEncoder {
    pub fn builder(config: EncoderConfig) -> FecEncoderBuilder {
        FecEncoderBuilder {
            config,
            on_packet: None,
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Forward a media packet, cache it and emit any parity it completes.
    ///
    /// The media packet always goes out first. An error means parity for
    /// this generation could not be produced; the stream itself is unharmed.
    pub fn recv_rtp_packet(&self, packet: Packet) -> Result<()> {
        (self.on_packet)(packet.clone());

        let evicted = lock_or_recover(&self.cache).insert(packet.clone());

        let repairs = {
            let mut state = lock_or_recover(&self.state);
            let raw = match state.matrix.insert_and_repair(packet) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "parity generation failed");
                    return Err(e);
                }
            };
            let marker_pt = 0x80 | self.config.payload_type;
            let mut stamped = Vec::with_capacity(raw.len());
            for repair in raw {
                let seq = state.next_repair_seq;
                state.next_repair_seq = seq.wrapping_add(1);
                stamped.push(repair.restamped(marker_pt, seq, self.config.ssrc)?);
            }
            stamped
        };

        {
            let mut stats = lock_or_recover(&self.stats);
            stats.media_packets += 1;
            stats.repair_packets += repairs.len() as u64;
            if evicted.is_some() {
                stats.cache_evictions += 1;
            }
        }

        for repair in repairs {
            trace!(seq = repair.sequence(), len = repair.len(), "emitting parity packet");
            (self.on_packet)(repair);
        }
        Ok(())
    }

    /// Answer a generic NACK with cached originals.
    ///
    /// Returns how many packets were re-sent. A malformed NACK is rejected
    /// before anything is sent.
    pub fn recv_nack_packet(&self, data: &[u8]) -> Result<usize> {
        let nack = match NackPacket::decode(data) {
            Ok(nack) => nack,
            Err(e) => {
                warn!(len = data.len(), error = %e, "dropping malformed NACK");
                lock_or_recover(&self.stats).malformed_nacks += 1;
                return Err(e);
            }
        };

        let wanted = requested_sequences(&nack);
        let found: Vec<Packet> = {
            let cache = lock_or_recover(&self.cache);
            wanted
                .iter()
                .filter_map(|&seq| cache.get(seq).cloned())
                .collect()
        };
        let misses = wanted.len() - found.len();
        debug!(
            requested = wanted.len(),
            resent = found.len(),
            misses,
            "NACK received"
        );

        {
            let mut stats = lock_or_recover(&self.stats);
            stats.nacks_received += 1;
            stats.retransmissions += found.len() as u64;
            stats.retransmit_misses += misses as u64;
        }

        let resent = found.len();
        for packet in found {
            (self.on_packet)(packet);
        }
        Ok(resent)
    }

    pub fn stats(&self) -> EncoderStats {
        lock_or_recover(&self.stats).clone()
    }
}
