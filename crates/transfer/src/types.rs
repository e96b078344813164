use std::fmt;

use serde::Serialize;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Nothing has been started yet.
    #[default]
    None,
    Download,
    Upload,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Download => "download",
            Self::Upload => "upload",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a [`TransferEngine`](crate::TransferEngine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    #[default]
    Idle,
    Connecting,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    /// Returns true once the transfer has ended, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true while a transfer owns the engine.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Transferring)
    }
}

/// Reason a transfer ended abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The TCP connection could not be established in time.
    ConnectionError,
    /// Read or write fault, including a premature end of stream.
    SocketError,
    /// No data arrived within the socket timeout.
    SocketTimeout,
    /// The server answered with something other than a usable response.
    InvalidServerResponse,
    /// Stopped by the caller. Reported through completion, never as an error.
    UserCancelled,
}

impl ErrorKind {
    /// Returns true for kinds delivered through `on_error`.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::UserCancelled)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ConnectionError => "connection error",
            Self::SocketError => "socket error",
            Self::SocketTimeout => "socket timeout",
            Self::InvalidServerResponse => "invalid server response",
            Self::UserCancelled => "cancelled by user",
        };
        f.write_str(s)
    }
}
