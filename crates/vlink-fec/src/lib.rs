//! # vlink-fec
//!
//! Loss protection for the RTP video path of a remote vehicle link.
//!
//! Two-dimensional XOR parity (RFC 8627 style) over a `rows × columns`
//! matrix of media packets, with NACK-driven retransmission for what parity
//! cannot repair, and an in-order output scheduler with bounded wait and
//! skip on the receive side.
//!
//! ## Crate structure
//!
//! - [`seq`]: 16-bit wraparound sequence arithmetic
//! - [`wire`]: RTP, FEC-header and generic-NACK byte layouts
//! - [`matrix`]: Parity synthesis, repair and cascade for one generation
//! - [`pool`]: Most-recently-used arena of matrix generations
//! - [`arq`]: Retransmission cache and NACK item packing
//! - [`reorder`]: 65536-slot reorder buffer and skip logic
//! - [`encoder`]: Send-side FEC encoder
//! - [`decoder`]: Receive-side FEC decoder and output thread
//! - [`config`]: TOML configuration
//! - [`stats`]: Encoder and decoder counters

pub mod arq;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod matrix;
pub mod pool;
pub mod reorder;
pub mod seq;
pub mod stats;
pub mod wire;

mod util;

pub use config::{DecoderConfig, EncoderConfig, FecConfig, MatrixConfig};
pub use decoder::{FecDecoder, FecDecoderBuilder};
pub use encoder::{FecEncoder, FecEncoderBuilder};
pub use error::{FecError, Result};
pub use matrix::FecMatrix;
pub use wire::{NackItem, NackPacket, Packet, RtpHeader};
