use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::RatePrecision;
use crate::types::TransferMode;

/// Snapshot of one transfer's progress, rate and timing.
///
/// A new report is built for every sample; reports are never updated in
/// place.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TransferReport {
    pub mode: TransferMode,
    /// 0.0 to 100.0.
    pub progress_percent: f64,
    pub rate_bytes_per_sec: f64,
    pub rate_bits_per_sec: f64,
    pub bytes_transferred: u64,
    /// Content length for downloads, payload size for uploads. Zero while
    /// unknown.
    pub total_bytes: u64,
    /// Epoch milliseconds at which timing started.
    pub start_time_millis: i64,
    /// Epoch milliseconds at which this sample was taken.
    pub sample_time_millis: i64,
    pub request_seq: u64,
    /// Connect and request-flush latency.
    pub setup_time: Duration,
    /// Time the rate was computed over.
    pub elapsed: Duration,
    /// Set only on the final report of a cancelled transfer.
    pub cancelled: bool,
    pub precision: RatePrecision,
}

impl TransferReport {
    /// Bit rate rounded to the configured precision.
    pub fn rate_bits_decimal(&self) -> Decimal {
        self.precision.apply(self.rate_bits_per_sec)
    }

    /// Byte rate rounded to the configured precision.
    pub fn rate_bytes_decimal(&self) -> Decimal {
        self.precision.apply(self.rate_bytes_per_sec)
    }
}

/// Returns `(bytes_per_sec, bits_per_sec)` for `bytes` moved in `elapsed`.
///
/// Both are zero when no time has passed.
pub(crate) fn rates(bytes: u64, elapsed: Duration) -> (f64, f64) {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return (0.0, 0.0);
    }
    let per_sec = bytes as f64 / secs;
    (per_sec, per_sec * 8.0)
}

/// Maps monotonic instants onto wall-clock epoch milliseconds.
///
/// Anchoring once keeps sample times ordered even if the system clock moves.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WallClock {
    origin: Instant,
    origin_millis: i64,
}

impl WallClock {
    pub(crate) fn now() -> Self {
        Self {
            origin: Instant::now(),
            origin_millis: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub(crate) fn millis_at(&self, at: Instant) -> i64 {
        let offset = at.saturating_duration_since(self.origin).as_millis();
        self.origin_millis
            .saturating_add(i64::try_from(offset).unwrap_or(i64::MAX))
    }
}
