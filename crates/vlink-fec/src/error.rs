//! Error type shared by every FEC component.
//!
//! Nothing here is fatal to the process: each variant degrades to "this
//! packet or repair is unrecoverable", which the output scheduler already
//! tolerates through its skip logic.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FecError {
    /// Reserving a buffer for a repair or recovered packet failed.
    #[error("failed to allocate {size} bytes for a {what} packet")]
    Alloc { what: &'static str, size: usize },

    /// Buffer shorter than the wire shape being read.
    #[error("{what} too short: {len} bytes, need at least {min}")]
    Truncated {
        what: &'static str,
        len: usize,
        min: usize,
    },

    #[error("packet of {len} bytes exceeds the {max}-byte limit")]
    Oversized { len: usize, max: usize },

    #[error("malformed repair packet: {0}")]
    MalformedRepair(String),

    #[error("malformed NACK packet: {0}")]
    MalformedNack(String),

    /// A media packet that no longer (or not yet) fits the matrix window.
    #[error("sequence {seq} is outside the matrix window")]
    OutOfRange { seq: u16 },

    #[error("invalid matrix dimensions {rows}x{columns} (each must be 1..={max})")]
    InvalidDimensions { rows: u8, columns: u8, max: u8 },

    /// `start()`/`build()` called before a required callback was registered.
    #[error("missing {0} callback")]
    MissingCallback(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to spawn output thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FecError>;
