use std::time::Duration;

use serde::Deserialize;

use crate::arq::MAX_RETRANSMIT_CAPACITY;
use crate::error::FecError;
use crate::matrix::MAX_LINES;
use crate::reorder::DEFAULT_TOLERATED_JUMP;
use crate::wire::MAX_PAYLOAD_TYPE;

pub const CONFIG_VERSION: u32 = 1;

pub const DEFAULT_PAYLOAD_TYPE: u8 = 99;
pub const DEFAULT_ENCODER_SSRC: u32 = 0x5566_7788;
pub const DEFAULT_DECODER_SSRC: u32 = 0x3344_5566;

// ─── Input (TOML) ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FecConfigInput {
    pub version: u32,
    pub matrix: MatrixConfigInput,
    pub encoder: EncoderConfigInput,
    pub decoder: DecoderConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MatrixConfigInput {
    pub rows: Option<u32>,
    pub columns: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EncoderConfigInput {
    pub payload_type: Option<u32>,
    pub ssrc: Option<u32>,
    pub retransmit_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DecoderConfigInput {
    pub payload_type: Option<u32>,
    pub ssrc: Option<u32>,
    pub pool_size: Option<usize>,
    pub cache_list_capacity: Option<usize>,
    pub max_wait_ms: Option<u64>,
    pub max_skip: Option<u32>,
    pub nack_interval_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub tolerated_jump: Option<u32>,
}

// ─── Resolved ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixConfig {
    pub rows: u8,
    pub columns: u8,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            rows: 4,
            columns: 4,
        }
    }
}

impl MatrixConfig {
    pub fn validate(&self) -> Result<(), FecError> {
        let ok = |n: u8| (1..=MAX_LINES).contains(&n);
        if !ok(self.rows) || !ok(self.columns) {
            return Err(FecError::InvalidDimensions {
                rows: self.rows,
                columns: self.columns,
                max: MAX_LINES,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    pub matrix: MatrixConfig,
    /// Payload type stamped on repair packets.
    pub payload_type: u8,
    /// SSRC stamped on repair packets.
    pub ssrc: u32,
    /// Sent media packets kept for NACK replies.
    pub retransmit_capacity: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            matrix: MatrixConfig::default(),
            payload_type: DEFAULT_PAYLOAD_TYPE,
            ssrc: DEFAULT_ENCODER_SSRC,
            retransmit_capacity: 200,
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<(), FecError> {
        self.matrix.validate()?;
        validate_payload_type(self.payload_type as u32)?;
        if !(1..=MAX_RETRANSMIT_CAPACITY).contains(&self.retransmit_capacity) {
            return Err(FecError::Config(format!(
                "retransmit_capacity {} must be in 1..={MAX_RETRANSMIT_CAPACITY}",
                self.retransmit_capacity
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    pub matrix: MatrixConfig,
    /// Payload type that marks a packet as repair rather than media.
    pub payload_type: u8,
    /// Sender SSRC written into generated NACKs.
    pub ssrc: u32,
    /// Number of matrix generations held at once.
    pub pool_size: usize,
    /// Media packets held while no generation covers them.
    pub cache_list_capacity: usize,
    /// How long the output waits on a missing sequence before skipping.
    pub max_wait: Duration,
    /// Slots scanned ahead when skipping.
    pub max_skip: u16,
    pub nack_interval: Duration,
    /// Output thread sleep when there is nothing to emit.
    pub poll_interval: Duration,
    /// Largest sequence jump treated as loss rather than a stream restart.
    pub tolerated_jump: u16,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            matrix: MatrixConfig::default(),
            payload_type: DEFAULT_PAYLOAD_TYPE,
            ssrc: DEFAULT_DECODER_SSRC,
            pool_size: 5,
            cache_list_capacity: 50,
            max_wait: Duration::from_millis(40),
            max_skip: 10,
            nack_interval: Duration::from_millis(5),
            poll_interval: Duration::from_millis(1),
            tolerated_jump: DEFAULT_TOLERATED_JUMP,
        }
    }
}

impl DecoderConfig {
    pub fn validate(&self) -> Result<(), FecError> {
        self.matrix.validate()?;
        validate_payload_type(self.payload_type as u32)?;
        if self.pool_size == 0 {
            return Err(FecError::Config("pool_size must be at least 1".into()));
        }
        if self.cache_list_capacity == 0 {
            return Err(FecError::Config(
                "cache_list_capacity must be at least 1".into(),
            ));
        }
        if self.max_skip == 0 {
            return Err(FecError::Config("max_skip must be at least 1".into()));
        }
        if self.tolerated_jump == 0 || self.tolerated_jump >= 0x8000 {
            return Err(FecError::Config(format!(
                "tolerated_jump {} must be in 1..32768",
                self.tolerated_jump
            )));
        }
        for (name, d) in [
            ("max_wait", self.max_wait),
            ("nack_interval", self.nack_interval),
            ("poll_interval", self.poll_interval),
        ] {
            if d.is_zero() {
                return Err(FecError::Config(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecConfig {
    pub version: u32,
    pub encoder: EncoderConfig,
    pub decoder: DecoderConfig,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            encoder: EncoderConfig::default(),
            decoder: DecoderConfig::default(),
        }
    }
}

fn validate_payload_type(pt: u32) -> Result<u8, FecError> {
    if pt > MAX_PAYLOAD_TYPE as u32 {
        return Err(FecError::Config(format!(
            "payload type {pt} exceeds {MAX_PAYLOAD_TYPE}"
        )));
    }
    Ok(pt as u8)
}

fn narrow<T: TryFrom<u32>>(name: &str, value: u32) -> Result<T, FecError> {
    T::try_from(value).map_err(|_| FecError::Config(format!("{name} {value} out of range")))
}

impl FecConfigInput {
    pub fn resolve(self) -> Result<FecConfig, FecError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(FecError::Config(format!(
                "unsupported config version {version}"
            )));
        }

        let matrix_defaults = MatrixConfig::default();
        let matrix = MatrixConfig {
            rows: narrow(
                "rows",
                self.matrix.rows.unwrap_or(matrix_defaults.rows as u32),
            )?,
            columns: narrow(
                "columns",
                self.matrix.columns.unwrap_or(matrix_defaults.columns as u32),
            )?,
        };

        let enc_defaults = EncoderConfig::default();
        let encoder = EncoderConfig {
            matrix,
            payload_type: validate_payload_type(
                self.encoder
                    .payload_type
                    .unwrap_or(enc_defaults.payload_type as u32),
            )?,
            ssrc: self.encoder.ssrc.unwrap_or(enc_defaults.ssrc),
            retransmit_capacity: self
                .encoder
                .retransmit_capacity
                .unwrap_or(enc_defaults.retransmit_capacity),
        };
        encoder.validate()?;

        let dec_defaults = DecoderConfig::default();
        let d = self.decoder;
        let decoder = DecoderConfig {
            matrix,
            payload_type: validate_payload_type(
                d.payload_type.unwrap_or(dec_defaults.payload_type as u32),
            )?,
            ssrc: d.ssrc.unwrap_or(dec_defaults.ssrc),
            pool_size: d.pool_size.unwrap_or(dec_defaults.pool_size),
            cache_list_capacity: d
                .cache_list_capacity
                .unwrap_or(dec_defaults.cache_list_capacity),
            max_wait: d
                .max_wait_ms
                .map(Duration::from_millis)
                .unwrap_or(dec_defaults.max_wait),
            max_skip: narrow(
                "max_skip",
                d.max_skip.unwrap_or(dec_defaults.max_skip as u32),
            )?,
            nack_interval: d
                .nack_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(dec_defaults.nack_interval),
            poll_interval: d
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(dec_defaults.poll_interval),
            tolerated_jump: narrow(
                "tolerated_jump",
                d.tolerated_jump
                    .unwrap_or(dec_defaults.tolerated_jump as u32),
            )?,
        };
        decoder.validate()?;

        Ok(FecConfig {
            version,
            encoder,
            decoder,
        })
    }
}

impl FecConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, FecError> {
        if input.trim().is_empty() {
            return Ok(FecConfig::default());
        }
        let parsed: FecConfigInput = toml::from_str(input)
            .map_err(|e| FecError::Config(format!("invalid config TOML: {e}")))?;
        parsed.resolve()
    }
}
