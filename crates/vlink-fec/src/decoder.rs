//! # FEC Decoder
//!
//! Sits in the receive path. Packets from the network are routed to a pool
//! of matrix generations, repaired where parity allows, and re-sequenced in
//! a [`ReorderBuffer`] before a background thread hands them to the
//! consumer in order.
//!
//! ## Routing
//!
//! 1. Media is stored in the reorder buffer first.
//! 2. The pool is searched most-recently-used first for a matrix that
//!    accepts the packet. A hit is touched, the packet inserted, and any
//!    cached media now inside its window drained into it.
//! 3. A repair packet no matrix accepts opens a new generation in the
//!    least-recently-used matrix.
//! 4. Media no matrix accepts waits in a bounded cache list.
//!
//! Recovered packets go to the reorder buffer and are routed again through
//! step 2 via a work queue, so a cascade never recurses.
//!
//! ## Output thread
//!
//! ```text
//!  waiting ──first packet──▶ draining
//!                              │ packet at expected  → emit, reset wait
//!                              │ waited > max_wait   → skip forward
//!                              │ every nack_interval → NACK the gap
//!                              └ otherwise           → sleep poll_interval
//! ```
//!
//! The reorder buffer is the only state shared with the output thread.
//! Callbacks run on the output thread outside the lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use bytes::Bytes;
use quanta::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::DecoderConfig;
use crate::error::{FecError, Result};
use crate::matrix::PacketKind;
use crate::pool::MatrixPool;
use crate::reorder::{InsertOutcome, ReorderBuffer, SkipOutcome};
use crate::stats::DecoderStats;
use crate::util::lock_or_recover;
use crate::wire::Packet;

/// Receives decoded media packets in sequence order.
pub type OutputCallback = Box<dyn FnMut(Packet) + Send>;

/// Receives encoded generic-NACK packets.
pub type NackCallback = Box<dyn FnMut(Bytes) + Send>;

struct Shared {
    reorder: Mutex<ReorderBuffer>,
    stats: Mutex<DecoderStats>,
    running: AtomicBool,
}

pub struct FecDecoder {
    config: DecoderConfig,
    pool: MatrixPool,
    /// Media that arrived before any generation covered it.
    cache_list: VecDeque<Packet>,
    shared: Arc<Shared>,
    output: Option<thread::JoinHandle<()>>,
}

// ─── Builder ─────────────────────────────────────────────────────────────────

pub struct FecDecoderBuilder {
    config: DecoderConfig,
    on_packet: Option<OutputCallback>,
    on_nack: Option<NackCallback>,
}

impl FecDecoderBuilder {
    /// Payload type that identifies repair packets (0..=127).
    pub fn payload_type(mut self, payload_type: u8) -> Self {
        self.config.payload_type = payload_type;
        self
    }

    /// Sender SSRC written into generated NACKs.
    pub fn ssrc(mut self, ssrc: u32) -> Self {
        self.config.ssrc = ssrc;
        self
    }

    pub fn on_packet<F>(mut self, f: F) -> Self
    where
        F: FnMut(Packet) + Send + 'static,
    {
        self.on_packet = Some(Box::new(f));
        self
    }

    pub fn on_nack<F>(mut self, f: F) -> Self
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        self.on_nack = Some(Box::new(f));
        self
    }

    /// Validate, allocate and start the output thread.
    ///
    /// Both callbacks are required. Nothing is allocated or spawned if any
    /// precondition fails.
    pub fn start(self) -> Result<FecDecoder> {
        self.config.validate()?;
        let on_packet = self.on_packet.ok_or(FecError::MissingCallback("packet"))?;
        let on_nack = self.on_nack.ok_or(FecError::MissingCallback("NACK"))?;

        let config = self.config;
        let pool = MatrixPool::new(config.pool_size, config.matrix.rows, config.matrix.columns)?;
        let shared = Arc::new(Shared {
            reorder: Mutex::new(ReorderBuffer::new(config.tolerated_jump)?),
            stats: Mutex::new(DecoderStats::new()),
            running: AtomicBool::new(true),
        });

        let worker = OutputWorker {
            shared: shared.clone(),
            config: config.clone(),
            on_packet,
            on_nack,
        };
        let output = thread::Builder::new()
            .name("fec-output".into())
            .spawn(move || worker.run())?;

        info!(
            rows = config.matrix.rows,
            columns = config.matrix.columns,
            pool = config.pool_size,
            payload_type = config.payload_type,
            "FEC decoder started"
        );
        Ok(FecDecoder {
            cache_list: VecDeque::with_capacity(config.cache_list_capacity),
            config,
            pool,
            shared,
            output: Some(output),
        })
    }
}

// ─── Decoder ─────────────────────────────────────────────────────────────────

impl FecDecoder {
    pub fn builder(config: DecoderConfig) -> FecDecoderBuilder {
        FecDecoderBuilder {
            config,
            on_packet: None,
            on_nack: None,
        }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Handle one packet from the network.
    ///
    /// An error means this packet was malformed and dropped; packets already
    /// buffered are unaffected.
    pub fn recv_packet(&mut self, packet: Packet) -> Result<()> {
        let kind = PacketKind::classify(&packet, self.config.payload_type);
        match kind {
            PacketKind::Media => {
                lock_or_recover(&self.shared.stats).media_received += 1;
                self.store_for_output(packet.clone(), true);
            }
            PacketKind::Repair => {
                lock_or_recover(&self.shared.stats).repairs_received += 1;
            }
        }

        let recovered = match self.route(packet, kind) {
            Ok(recovered) => recovered,
            Err(e) => {
                warn!(?kind, error = %e, "dropping malformed packet");
                lock_or_recover(&self.shared.stats).malformed_packets += 1;
                return Err(e);
            }
        };

        let mut pending: VecDeque<Packet> = recovered.into();
        while let Some(packet) = pending.pop_front() {
            lock_or_recover(&self.shared.stats).packets_recovered += 1;
            self.store_for_output(packet.clone(), false);
            match self.route(packet, PacketKind::Media) {
                Ok(more) => pending.extend(more),
                Err(e) => warn!(error = %e, "re-routing recovered packet failed"),
            }
        }
        Ok(())
    }

    /// Convenience wrapper for raw datagrams.
    pub fn recv_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.recv_packet(Packet::from_slice(data)?)
    }

    pub fn stats(&self) -> DecoderStats {
        lock_or_recover(&self.shared.stats).clone()
    }

    /// Media packets waiting for a generation to cover them.
    pub fn cached_media(&self) -> usize {
        self.cache_list.len()
    }

    /// Stop the output thread and drop every packet still held. Safe to
    /// call more than once.
    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.output.take() {
            if handle.join().is_err() {
                warn!("FEC output thread panicked");
            }
            let mut reorder = lock_or_recover(&self.shared.reorder);
            let undelivered = reorder.held();
            reorder.reset();
            self.cache_list.clear();
            info!(undelivered, "FEC decoder stopped");
        }
    }

    // ─── Routing ─────────────────────────────────────────────────────────

    fn route(&mut self, packet: Packet, kind: PacketKind) -> Result<Vec<Packet>> {
        if let Some(index) = self.pool.find(&packet, kind) {
            self.pool.touch(index);
            return self.insert_into(index, packet, kind);
        }

        match kind {
            PacketKind::Repair => {
                // Reject garbage before it can evict a live generation.
                let fec = packet.fec_header()?;
                if let Some(matrix) = self.pool.iter_mru().next() {
                    matrix.locate_repair(&fec)?;
                }
                let Some(recycled) = self.pool.recycle_lru() else {
                    return Ok(Vec::new());
                };
                if let Some(base) = recycled.previous_base {
                    debug!(
                        base,
                        new_base = fec.sn_base,
                        unrecoverable = recycled.unrecoverable,
                        "recycling generation"
                    );
                    let mut stats = lock_or_recover(&self.shared.stats);
                    stats.generations_recycled += 1;
                    stats.unrecoverable_sequences += recycled.unrecoverable as u64;
                }
                self.insert_into(recycled.index, packet, kind)
            }
            PacketKind::Media => {
                self.cache_list.push_back(packet);
                if self.cache_list.len() > self.config.cache_list_capacity {
                    if let Some(dropped) = self.cache_list.pop_front() {
                        warn!(
                            seq = dropped.sequence(),
                            capacity = self.config.cache_list_capacity,
                            "cache list full, dropping oldest media packet"
                        );
                        lock_or_recover(&self.shared.stats).cache_overflows += 1;
                    }
                }
                Ok(Vec::new())
            }
        }
    }

    /// Store the packet and any cached media the matrix now covers, then
    /// repair once over every line they touched.
    fn insert_into(&mut self, index: usize, packet: Packet, kind: PacketKind) -> Result<Vec<Packet>> {
        let Some(matrix) = self.pool.get_mut(index) else {
            return Ok(Vec::new());
        };
        let mut lines = matrix.insert_without_repair(packet, kind)?;
        self.cache_list.retain(|cached| {
            if !matrix.is_seq_in_range(cached.sequence()) {
                return true;
            }
            match matrix.insert_without_repair(cached.clone(), PacketKind::Media) {
                Ok(touched) => lines.extend(touched),
                Err(e) => warn!(seq = cached.sequence(), error = %e, "cached packet rejected"),
            }
            false
        });
        Ok(matrix.repair_lines(lines))
    }

    fn store_for_output(&self, packet: Packet, direct: bool) {
        let seq = packet.sequence();
        let outcome = lock_or_recover(&self.shared.reorder).insert(packet);
        let mut stats = lock_or_recover(&self.shared.stats);
        match outcome {
            InsertOutcome::Stored => {}
            InsertOutcome::Duplicate if direct => {
                trace!(seq, "duplicate packet");
                stats.duplicates += 1;
            }
            InsertOutcome::Late if direct => {
                trace!(seq, "late packet");
                stats.late_packets += 1;
            }
            InsertOutcome::Duplicate | InsertOutcome::Late => {}
            InsertOutcome::Resync => stats.stream_resyncs += 1,
        }
    }
}

impl Drop for FecDecoder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Output Thread ───────────────────────────────────────────────────────────

struct OutputWorker {
    shared: Arc<Shared>,
    config: DecoderConfig,
    on_packet: OutputCallback,
    on_nack: NackCallback,
}

enum Step {
    Emit(Packet),
    /// `after` is the last sequence emitted before the gap.
    Skip { after: u16, outcome: SkipOutcome },
    Idle,
}

impl OutputWorker {
    fn running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn run(mut self) {
        while self.running() && !lock_or_recover(&self.shared.reorder).is_started() {
            thread::sleep(self.config.poll_interval);
        }

        let mut waiting_since = Instant::now();
        let mut last_nack = Instant::now();

        while self.running() {
            let now = Instant::now();
            let (step, nack) = {
                let mut reorder = lock_or_recover(&self.shared.reorder);
                let step = if let Some(packet) = reorder.pop_next() {
                    Step::Emit(packet)
                } else if reorder.is_caught_up() {
                    waiting_since = now;
                    Step::Idle
                } else if now.duration_since(waiting_since) > self.config.max_wait {
                    waiting_since = now;
                    let after = reorder.last_output();
                    Step::Skip {
                        after,
                        outcome: reorder.skip_forward(self.config.max_skip),
                    }
                } else {
                    Step::Idle
                };
                let nack = if now.duration_since(last_nack) >= self.config.nack_interval {
                    last_nack = now;
                    reorder.build_nack(self.config.ssrc)
                } else {
                    None
                };
                (step, nack)
            };

            if let Some(nack) = nack {
                trace!(items = nack.items.len(), "sending NACK");
                lock_or_recover(&self.shared.stats).nacks_sent += 1;
                (self.on_nack)(nack.to_bytes());
            }

            match step {
                Step::Emit(packet) => {
                    waiting_since = now;
                    self.deliver(packet);
                }
                Step::Skip {
                    after,
                    outcome: SkipOutcome::Emitted { packet, skipped },
                } => {
                    warn!(
                        after,
                        skipped,
                        resume = packet.sequence(),
                        "gave up on missing packets"
                    );
                    lock_or_recover(&self.shared.stats).sequences_skipped += skipped as u64;
                    self.deliver(packet);
                }
                Step::Skip {
                    after,
                    outcome: SkipOutcome::Snapped { resume_at, skipped },
                } => {
                    warn!(
                        after,
                        skipped,
                        resume = resume_at,
                        "gave up on missing packets beyond skip window"
                    );
                    lock_or_recover(&self.shared.stats).sequences_skipped += skipped as u64;
                }
                Step::Skip {
                    outcome: SkipOutcome::CaughtUp,
                    ..
                }
                | Step::Idle => {
                    thread::sleep(self.config.poll_interval);
                }
            }
        }
    }

    fn deliver(&mut self, packet: Packet) {
        lock_or_recover(&self.shared.stats).packets_delivered += 1;
        (self.on_packet)(packet);
    }
}
