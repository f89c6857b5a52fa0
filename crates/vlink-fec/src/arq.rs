//! # ARQ: NACK-driven retransmission
//!
//! Receiver side: turn a list of missing sequence numbers into generic-NACK
//! items (PID + 16-bit BLP). Sender side: keep a bounded FIFO of recently
//! sent media packets and answer NACKs with the *original* packets.
//!
//! ## Key design decisions
//!
//! - **Plain retransmission**: a NACK is answered with the cached media
//!   packet, never with a parity packet
//! - **Bounded memory**: the cache evicts oldest-first and never holds more
//!   than half the sequence space, so a sequence number is unambiguous
//! - **Deduplicated replies**: a sequence listed twice in one NACK is
//!   re-sent once

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::trace;

use crate::seq::seq_distance;
use crate::wire::{NackItem, NackPacket, Packet};

/// Largest retransmission cache that keeps sequence numbers unique.
pub const MAX_RETRANSMIT_CAPACITY: usize = 1 << 15;

// ─── Retransmit Cache (Sender-Side) ─────────────────────────────────────────

/// Recently sent media packets, keyed by sequence number.
#[derive(Debug)]
pub struct RetransmitCache {
    /// Insertion order, oldest first.
    order: VecDeque<u16>,
    packets: HashMap<u16, Packet>,
    capacity: usize,
}

impl RetransmitCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_RETRANSMIT_CAPACITY);
        RetransmitCache {
            order: VecDeque::with_capacity(capacity),
            packets: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Cache a sent packet. Returns the sequence evicted to make room, if any.
    ///
    /// A packet whose sequence is already cached is ignored; the first copy
    /// wins.
    pub fn insert(&mut self, packet: Packet) -> Option<u16> {
        let seq = packet.sequence();
        if self.packets.contains_key(&seq) {
            trace!(seq, "retransmit cache already holds sequence");
            return None;
        }
        let evicted = if self.order.len() >= self.capacity {
            let oldest = self.order.pop_front();
            if let Some(old) = oldest {
                self.packets.remove(&old);
                trace!(seq = old, "evicted from retransmit cache");
            }
            oldest
        } else {
            None
        };
        self.order.push_back(seq);
        self.packets.insert(seq, packet);
        evicted
    }

    pub fn get(&self, seq: u16) -> Option<&Packet> {
        self.packets.get(&seq)
    }

    pub fn contains(&self, seq: u16) -> bool {
        self.packets.contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Pack missing sequence numbers (ascending, modular order) into NACK items.
///
/// Each item's PID is the first sequence it covers; any of the following 16
/// sequences that are also missing set the corresponding BLP bit.
pub fn build_nack_items(missing: &[u16]) -> Vec<NackItem> {
    let mut items = Vec::new();
    let mut current: Option<NackItem> = None;

    for &seq in missing {
        match current.as_mut() {
            Some(item) => {
                let offset = seq_distance(item.pid, seq);
                if (1..=16).contains(&offset) {
                    item.mark(offset);
                    continue;
                }
                items.push(*item);
                current = Some(NackItem::new(seq));
            }
            None => current = Some(NackItem::new(seq)),
        }
    }
    items.extend(current);
    items
}

/// Every sequence a NACK asks for, first occurrence order, duplicates removed.
pub fn requested_sequences(nack: &NackPacket) -> Vec<u16> {
    let mut seen = HashSet::new();
    nack.items
        .iter()
        .flat_map(NackItem::lost_sequences)
        .filter(|seq| seen.insert(*seq))
        .collect()
}
