//! Throughput measurement over raw HTTP transactions.
//!
//! [`TransferEngine`] runs one download or upload at a time against a remote
//! host and pushes [`TransferReport`] snapshots to registered
//! [`TransferListener`]s. [`RepeatController`] chains transfers over a time
//! window and folds them into a running-average report.

mod config;
mod engine;
mod listener;
mod payload;
mod repeat;
mod report;
mod session;
mod types;

#[cfg(test)]
mod test_server;

pub use config::{ConfigError, RatePrecision, RoundingMode, TransferConfig, UploadStorage};
pub use engine::TransferEngine;
pub use listener::{
    CallbackListener, ErrorCallback, ListenerId, ListenerRegistry, ReportCallback, TransferListener,
};
pub use payload::{Payload, PayloadFile, PayloadGenerator, TEMP_FILE_PREFIX, TEMP_FILE_SUFFIX};
pub use repeat::{RepeatConfig, RepeatController, RepeatHandle, RepeatRequest, WindowPolicy};
pub use report::TransferReport;
pub use types::{ErrorKind, TransferMode, TransferState};

pub use speedprobe_http::{CodecError, ProxyAddress};

/// Default upload chunk size in bytes.
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 65_535;

/// Default download read buffer size in bytes.
pub const DEFAULT_DOWNLOAD_BUFFER_SIZE: usize = 65_535;

/// Default socket timeout in milliseconds.
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 10_000;

/// Largest slice the payload generator fills or writes at once.
pub const GENERATION_CHUNK_SIZE: usize = 65_535;

/// Errors returned synchronously when a transfer cannot be started.
///
/// Failures after a transfer has started are delivered to listeners as an
/// [`ErrorKind`] instead.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("a transfer is already in progress")]
    AlreadyActive,

    #[error("invalid target: {0}")]
    InvalidTarget(#[from] CodecError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to prepare upload payload: {0}")]
    Payload(#[from] std::io::Error),
}
