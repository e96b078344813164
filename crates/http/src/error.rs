//! Error types for the HTTP codec.

/// Errors produced while parsing targets or decoding responses.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed before the response head was complete")]
    UnexpectedEof,

    #[error("response head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("malformed status line: {0}")]
    InvalidStatusLine(String),

    #[error("malformed header: {0}")]
    InvalidHeader(String),

    #[error("invalid URI: {0}")]
    InvalidUri(String),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
}

impl CodecError {
    /// Returns `true` when the failure came from the transport rather than
    /// from the bytes the server sent.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::UnexpectedEof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        let io = CodecError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(io.is_transport());
        assert!(CodecError::UnexpectedEof.is_transport());
        assert!(!CodecError::InvalidStatusLine("garbage".into()).is_transport());
        assert!(!CodecError::HeadTooLarge(16).is_transport());
    }
}
