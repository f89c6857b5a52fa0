//! # Reorder Buffer
//!
//! A 65536-slot circular array indexed directly by RTP sequence number.
//! Packets (received or recovered) wait here until the output scheduler
//! releases them in sequence order.
//!
//! ## Cursors
//!
//! - `last_received`: newest sequence stored so far (only moves forward)
//! - `expected`: next sequence the scheduler wants to emit
//! - `last_output`: last sequence actually emitted
//!
//! Occupied slots always lie in `expected ..= last_received`. Anything the
//! scheduler gives up on is skipped over, so a stale packet can never be
//! emitted one wrap later.
//!
//! A packet more than `tolerated_jump` sequence numbers ahead of
//! `last_received`, or behind `expected`, is taken as a stream restart:
//! the buffer is emptied and the cursors restart at that packet.

use tracing::info;

use crate::arq::build_nack_items;
use crate::error::{FecError, Result};
use crate::seq::{seq_distance, seq_is_newer, SEQ_SPACE};
use crate::wire::{NackPacket, Packet};

pub const DEFAULT_TOLERATED_JUMP: u16 = 100;

/// What `insert` did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored,
    /// Slot already occupied.
    Duplicate,
    /// Behind `expected` (already emitted or given up); dropped.
    Late,
    /// Discontinuity beyond the tolerated jump; buffer restarted here.
    Resync,
}

/// Result of a forced forward skip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipOutcome {
    /// Emitted the first present packet within the skip bound.
    Emitted { packet: Packet, skipped: u16 },
    /// Nothing within the bound; `expected` moved to `resume_at`.
    Snapped { resume_at: u16, skipped: u16 },
    /// No known gap: `expected` is already past `last_received`.
    CaughtUp,
}

pub struct ReorderBuffer {
    slots: Vec<Option<Packet>>,
    started: bool,
    last_received: u16,
    expected: u16,
    last_output: u16,
    tolerated_jump: u16,
    held: usize,
}

impl ReorderBuffer {
    pub fn new(tolerated_jump: u16) -> Result<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(SEQ_SPACE)
            .map_err(|_| FecError::Alloc {
                what: "reorder buffer",
                size: SEQ_SPACE * std::mem::size_of::<Option<Packet>>(),
            })?;
        slots.resize(SEQ_SPACE, None);
        Ok(ReorderBuffer {
            slots,
            started: false,
            last_received: 0,
            expected: 0,
            last_output: 0,
            tolerated_jump: tolerated_jump.max(1),
            held: 0,
        })
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn last_received(&self) -> u16 {
        self.last_received
    }

    pub fn expected(&self) -> u16 {
        self.expected
    }

    pub fn last_output(&self) -> u16 {
        self.last_output
    }

    /// Nothing is known to be missing: `expected` is past `last_received`.
    pub fn is_caught_up(&self) -> bool {
        !self.started || seq_is_newer(self.expected, self.last_received)
    }

    /// Packets currently waiting for output.
    pub fn held(&self) -> usize {
        self.held
    }

    pub fn insert(&mut self, packet: Packet) -> InsertOutcome {
        let seq = packet.sequence();
        if !self.started {
            self.restart_at(seq);
            self.store(packet);
            return InsertOutcome::Stored;
        }

        if seq_is_newer(seq, self.last_received) {
            if seq_distance(self.last_received, seq) > self.tolerated_jump {
                return self.resync(packet);
            }
            self.last_received = seq;
        } else if seq != self.expected && !seq_is_newer(seq, self.expected) {
            if seq_distance(seq, self.expected) <= self.tolerated_jump {
                return InsertOutcome::Late;
            }
            return self.resync(packet);
        }

        if self.slots[seq as usize].is_some() {
            return InsertOutcome::Duplicate;
        }
        self.store(packet);
        InsertOutcome::Stored
    }

    /// Take the packet at `expected`, if it is here.
    pub fn pop_next(&mut self) -> Option<Packet> {
        if !self.started {
            return None;
        }
        let packet = self.slots[self.expected as usize].take()?;
        self.held -= 1;
        self.last_output = self.expected;
        self.expected = self.expected.wrapping_add(1);
        Some(packet)
    }

    /// Give up on the sequence at `expected` and move on.
    ///
    /// The first present packet within `max_skip` slots is emitted. Beyond
    /// that bound, `expected` snaps to the next present slot without
    /// emitting it, rather than to `last_received + 1`, so packets already
    /// held after the gap are still delivered on the following polls. Only
    /// when nothing is held does `expected` move just past `last_received`.
    pub fn skip_forward(&mut self, max_skip: u16) -> SkipOutcome {
        if self.is_caught_up() {
            return SkipOutcome::CaughtUp;
        }
        let gap = seq_distance(self.expected, self.last_received);
        let next = (1..=gap).find(|&k| {
            self.slots[self.expected.wrapping_add(k) as usize].is_some()
        });

        match next {
            Some(k) if k <= max_skip => {
                let seq = self.expected.wrapping_add(k);
                match self.slots[seq as usize].take() {
                    Some(packet) => {
                        self.held -= 1;
                        self.last_output = seq;
                        self.expected = seq.wrapping_add(1);
                        SkipOutcome::Emitted { packet, skipped: k }
                    }
                    None => SkipOutcome::CaughtUp,
                }
            }
            Some(k) => {
                self.expected = self.expected.wrapping_add(k);
                SkipOutcome::Snapped {
                    resume_at: self.expected,
                    skipped: k,
                }
            }
            None => {
                let skipped = gap.wrapping_add(1);
                self.expected = self.last_received.wrapping_add(1);
                SkipOutcome::Snapped {
                    resume_at: self.expected,
                    skipped,
                }
            }
        }
    }

    /// Sequences between `expected` and `last_received` still missing.
    ///
    /// Empty when there is no gap or when the gap exceeds the tolerated jump.
    pub fn missing(&self) -> Vec<u16> {
        if self.is_caught_up() {
            return Vec::new();
        }
        let gap = seq_distance(self.expected, self.last_received);
        if gap == 0 || gap > self.tolerated_jump {
            return Vec::new();
        }
        (0..gap)
            .map(|k| self.expected.wrapping_add(k))
            .filter(|&seq| self.slots[seq as usize].is_none())
            .collect()
    }

    /// A generic NACK for every missing sequence, if there are any.
    pub fn build_nack(&self, sender_ssrc: u32) -> Option<NackPacket> {
        let missing = self.missing();
        if missing.is_empty() {
            return None;
        }
        Some(NackPacket::new(sender_ssrc, build_nack_items(&missing)))
    }

    /// Forget every packet and wait for a new first packet.
    pub fn reset(&mut self) {
        self.clear_window();
        self.started = false;
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn store(&mut self, packet: Packet) {
        let seq = packet.sequence() as usize;
        self.slots[seq] = Some(packet);
        self.held += 1;
    }

    fn restart_at(&mut self, seq: u16) {
        self.started = true;
        self.last_received = seq;
        self.expected = seq;
        self.last_output = seq.wrapping_sub(1);
    }

    fn resync(&mut self, packet: Packet) -> InsertOutcome {
        let seq = packet.sequence();
        info!(
            seq,
            expected = self.expected,
            last_received = self.last_received,
            "sequence discontinuity, restarting reorder buffer"
        );
        self.clear_window();
        self.restart_at(seq);
        self.store(packet);
        InsertOutcome::Resync
    }

    /// Empty every slot that can be occupied.
    fn clear_window(&mut self) {
        if self.held == 0 {
            return;
        }
        if seq_is_newer(self.expected, self.last_received) {
            self.slots.iter_mut().for_each(|s| *s = None);
        } else {
            let gap = seq_distance(self.expected, self.last_received);
            for k in 0..=gap {
                self.slots[self.expected.wrapping_add(k) as usize] = None;
            }
        }
        self.held = 0;
    }
}

impl std::fmt::Debug for ReorderBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReorderBuffer")
            .field("started", &self.started)
            .field("last_received", &self.last_received)
            .field("expected", &self.expected)
            .field("last_output", &self.last_output)
            .field("held", &self.held)
            .finish()
    }
}
