//! # FEC Loopback
//!
//! Runs an encoder and a decoder back to back over a simulated lossy link
//! and reports how much of the stream FEC and NACK retransmission
//! recovered. Useful for tuning matrix dimensions and timing against a
//! known loss rate.
//!
//! ## Usage
//!
//! ```bash
//! # 5 % random loss, 10k packets, default 4x4 matrix
//! vlink-fec-loopback --loss 5
//!
//! # Custom matrix and timing from TOML, reproducible seed
//! vlink-fec-loopback --config fec.toml --loss 10 --seed 42 --packets 50000
//! ```

use std::time::Duration;

use crossbeam_channel::unbounded;
use quanta::Instant;
use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;

use vlink_fec::{FecConfig, FecDecoder, FecEncoder, Packet, RtpHeader};

struct Args {
    config: Option<String>,
    packets: u32,
    loss_percent: f64,
    payload_size: usize,
    rate_pps: u32,
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("reading {path}: {e}"))?;
            FecConfig::from_toml_str(&text)?
        }
        None => FecConfig::default(),
    };

    tracing::info!(
        packets = args.packets,
        loss_percent = args.loss_percent,
        payload = args.payload_size,
        rate_pps = args.rate_pps,
        seed = args.seed,
        rows = config.encoder.matrix.rows,
        columns = config.encoder.matrix.columns,
        "vlink-fec-loopback starting"
    );

    // ── Pipeline ────────────────────────────────────────────────
    let (net_tx, net_rx) = unbounded::<Packet>();
    let (out_tx, out_rx) = unbounded::<Packet>();
    let (nack_tx, nack_rx) = unbounded();

    let encoder = FecEncoder::builder(config.encoder.clone())
        .on_packet(move |p| {
            let _ = net_tx.send(p);
        })
        .build()?;
    let mut decoder = FecDecoder::builder(config.decoder.clone())
        .on_packet(move |p| {
            let _ = out_tx.send(p);
        })
        .on_nack(move |n| {
            let _ = nack_tx.send(n);
        })
        .start()?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let loss = args.loss_percent / 100.0;
    let media_pt = if config.encoder.payload_type == 96 { 97 } else { 96 };
    let payload: Vec<u8> = (0..args.payload_size).map(|i| i as u8).collect();
    let interval = Duration::from_secs_f64(1.0 / args.rate_pps.max(1) as f64);

    let start = Instant::now();
    let mut last_report = Instant::now();
    let mut dropped = 0u64;
    let mut nacks_lost = 0u64;

    for n in 0..args.packets {
        let seq = n as u16;
        let header = RtpHeader::new(media_pt, seq, n.wrapping_mul(3000), 0x1020_3040);
        encoder.recv_rtp_packet(Packet::build(&header, &payload)?)?;

        // Deliver whatever crossed the link, media and parity alike.
        for pkt in net_rx.try_iter() {
            if rng.random::<f64>() < loss {
                dropped += 1;
                continue;
            }
            if let Err(e) = decoder.recv_packet(pkt) {
                tracing::warn!(error = %e, "decoder rejected packet");
            }
        }
        // Feedback path shares the same loss.
        for nack in nack_rx.try_iter() {
            if rng.random::<f64>() < loss {
                nacks_lost += 1;
                continue;
            }
            if let Err(e) = encoder.recv_nack_packet(&nack) {
                tracing::warn!(error = %e, "encoder rejected NACK");
            }
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            let s = decoder.stats();
            tracing::info!(
                sent = n + 1,
                delivered = s.packets_delivered,
                recovered = s.packets_recovered,
                skipped = s.sequences_skipped,
                "progress"
            );
            last_report = Instant::now();
        }

        let due = interval * (n + 1);
        let elapsed = start.elapsed();
        if due > elapsed {
            std::thread::sleep(due - elapsed);
        }
    }

    // ── Drain ───────────────────────────────────────────────────
    let settle = config.decoder.max_wait * 4 + Duration::from_millis(100);
    std::thread::sleep(settle);
    for pkt in net_rx.try_iter() {
        let _ = decoder.recv_packet(pkt);
    }
    std::thread::sleep(settle);
    decoder.shutdown();

    let delivered: Vec<u16> = out_rx.try_iter().map(|p| p.sequence()).collect();
    let out_of_order = delivered
        .windows(2)
        .filter(|w| w[1].wrapping_sub(w[0]) >= 0x8000)
        .count();

    let enc = encoder.stats();
    let dec = decoder.stats();
    tracing::info!(
        media = enc.media_packets,
        repairs = enc.repair_packets,
        retransmissions = enc.retransmissions,
        link_drops = dropped,
        nacks_lost,
        "encoder summary"
    );
    tracing::info!(
        delivered = delivered.len(),
        recovered = dec.packets_recovered,
        skipped = dec.sequences_skipped,
        nacks_sent = dec.nacks_sent,
        recovery_ratio = format!("{:.3}", dec.recovery_ratio()),
        loss_ratio = format!("{:.4}", dec.loss_ratio()),
        out_of_order,
        "decoder summary"
    );
    Ok(())
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = None;
    let mut packets = 10_000u32;
    let mut loss_percent = 5.0f64;
    let mut payload_size = 1200usize;
    let mut rate_pps = 2000u32;
    let mut seed = 1u64;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
        };
        match flag {
            "--config" | "-c" => config = Some(value()?),
            "--packets" | "-n" => {
                let val = value()?;
                packets = val
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid packet count '{val}': {e}"))?;
            }
            "--loss" | "-l" => {
                let val = value()?;
                loss_percent = val
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid loss '{val}': {e}"))?;
            }
            "--payload" | "-p" => {
                let val = value()?;
                payload_size = val
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid payload size '{val}': {e}"))?;
            }
            "--rate" | "-r" => {
                let val = value()?;
                rate_pps = val
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid rate '{val}': {e}"))?;
            }
            "--seed" | "-s" => {
                let val = value()?;
                seed = val
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid seed '{val}': {e}"))?;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nRun with --help for usage.");
            }
        }
        i += 1;
    }

    // Fallback: env vars
    if config.is_none() {
        config = std::env::var("FEC_CONFIG").ok();
    }
    if let Ok(val) = std::env::var("LOSS_PERCENT") {
        loss_percent = val.parse().unwrap_or(loss_percent);
    }
    if let Ok(val) = std::env::var("SEED") {
        seed = val.parse().unwrap_or(seed);
    }

    if !(0.0..=100.0).contains(&loss_percent) {
        anyhow::bail!("loss must be between 0 and 100 percent");
    }
    if payload_size > 1400 {
        anyhow::bail!("payload size {payload_size} exceeds 1400 bytes");
    }

    Ok(Args {
        config,
        packets,
        loss_percent,
        payload_size,
        rate_pps,
        seed,
    })
}

fn print_help() {
    eprintln!(
        r#"vlink-fec-loopback: FEC encoder/decoder over a simulated lossy link

USAGE:
  vlink-fec-loopback [OPTIONS]

OPTIONS:
  --config, -c <path>     TOML configuration ([matrix], [encoder], [decoder])
  --packets, -n <count>   Media packets to send (default: 10000)
  --loss, -l <percent>    Random loss applied to every packet (default: 5)
  --payload, -p <bytes>   Media payload size, at most 1400 (default: 1200)
  --rate, -r <pps>        Media packets per second (default: 2000)
  --seed, -s <n>          Loss pattern seed (default: 1)
  --help, -h              Show this help

ENVIRONMENT VARIABLES:
  FEC_CONFIG     Configuration path (fallback for --config)
  LOSS_PERCENT   Loss percentage (overrides the default)
  SEED           Loss pattern seed (overrides the default)
  RUST_LOG       Log level filter (e.g. info, vlink_fec=debug)
"#
    );
}
