//! Per-engine transfer settings.
//!
//! A [`TransferConfig`] is copied when a transfer starts; changes made while
//! a transfer runs apply to the next one.

use std::time::Duration;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use speedprobe_http::{CodecError, ProxyAddress};

use crate::{DEFAULT_DOWNLOAD_BUFFER_SIZE, DEFAULT_SOCKET_TIMEOUT_MS, DEFAULT_UPLOAD_CHUNK_SIZE};

/// Default number of fractional digits kept on decimal rates.
const DEFAULT_SCALE: u32 = 4;

/// Largest scale a [`Decimal`] can represent.
const MAX_SCALE: u32 = 28;

/// Errors produced when validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid proxy address: {0}")]
    InvalidProxy(#[from] CodecError),

    #[error("upload chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("download buffer size must be greater than zero")]
    ZeroBufferSize,

    #[error("decimal scale {0} exceeds the maximum of {MAX_SCALE}")]
    ScaleTooLarge(u32),

    #[error("report interval must be greater than zero")]
    ZeroReportInterval,
}

/// Where upload payloads are kept while they are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStorage {
    /// Generate the whole payload in memory.
    #[default]
    Ram,
    /// Stream the payload through a temporary file.
    TempFile,
}

/// Rounding applied when rates are exposed as decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    Up,
    Down,
    Ceiling,
    Floor,
    HalfUp,
    HalfDown,
    #[default]
    HalfEven,
}

impl RoundingMode {
    fn strategy(self) -> RoundingStrategy {
        match self {
            Self::Up => RoundingStrategy::AwayFromZero,
            Self::Down => RoundingStrategy::ToZero,
            Self::Ceiling => RoundingStrategy::ToPositiveInfinity,
            Self::Floor => RoundingStrategy::ToNegativeInfinity,
            Self::HalfUp => RoundingStrategy::MidpointAwayFromZero,
            Self::HalfDown => RoundingStrategy::MidpointTowardZero,
            Self::HalfEven => RoundingStrategy::MidpointNearestEven,
        }
    }
}

/// Scale and rounding mode for decimal rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePrecision {
    #[serde(default = "default_scale")]
    pub scale: u32,
    #[serde(default)]
    pub rounding: RoundingMode,
}

impl Default for RatePrecision {
    fn default() -> Self {
        Self {
            scale: DEFAULT_SCALE,
            rounding: RoundingMode::default(),
        }
    }
}

impl RatePrecision {
    /// Converts `value` to a decimal rounded to this precision.
    ///
    /// Non-finite values map to zero.
    pub fn apply(&self, value: f64) -> Decimal {
        Decimal::from_f64(value)
            .unwrap_or_default()
            .round_dp_with_strategy(self.scale, self.rounding.strategy())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.scale > MAX_SCALE {
            return Err(ConfigError::ScaleTooLarge(self.scale));
        }
        Ok(())
    }
}

/// Settings frozen at the start of every transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Connect and read timeout in milliseconds; 0 disables it.
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    #[serde(default = "default_upload_chunk_size")]
    pub upload_chunk_size: usize,
    #[serde(default = "default_download_buffer_size")]
    pub download_buffer_size: usize,
    #[serde(default)]
    pub upload_storage: UploadStorage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyAddress>,
    #[serde(default)]
    pub precision: RatePrecision,
}

fn default_socket_timeout_ms() -> u64 {
    DEFAULT_SOCKET_TIMEOUT_MS
}

fn default_upload_chunk_size() -> usize {
    DEFAULT_UPLOAD_CHUNK_SIZE
}

fn default_download_buffer_size() -> usize {
    DEFAULT_DOWNLOAD_BUFFER_SIZE
}

fn default_scale() -> u32 {
    DEFAULT_SCALE
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            socket_timeout_ms: default_socket_timeout_ms(),
            upload_chunk_size: default_upload_chunk_size(),
            download_buffer_size: default_download_buffer_size(),
            upload_storage: UploadStorage::default(),
            proxy: None,
            precision: RatePrecision::default(),
        }
    }
}

impl TransferConfig {
    /// Socket timeout, or `None` when disabled.
    pub fn socket_timeout(&self) -> Option<Duration> {
        (self.socket_timeout_ms > 0).then(|| Duration::from_millis(self.socket_timeout_ms))
    }

    /// Sets the socket timeout; [`Duration::ZERO`] disables it.
    pub fn set_socket_timeout(&mut self, timeout: Duration) {
        self.socket_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    }

    /// Parses and installs a proxy address.
    pub fn set_proxy(&mut self, address: &str) -> Result<(), ConfigError> {
        self.proxy = Some(ProxyAddress::parse(address)?);
        Ok(())
    }

    /// Checks every field that has a constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload_chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.download_buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        self.precision.validate()
    }
}
