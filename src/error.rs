//! Error types for panel calls and the client handshake

use thiserror::Error;

/// Errors returned by panel API calls
#[derive(Debug, Error)]
pub enum PanelError {
    /// Network failure or TLS error while talking to the panel
    #[error("panel request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The panel answered with a non-success status
    #[error("panel returned {status} for {path}")]
    Status { status: u16, path: String },
    /// The panel answered with a body we could not decode
    #[error("malformed panel response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl PanelError {
    /// Stable code for log fields
    pub fn as_code(&self) -> &'static str {
        match self {
            PanelError::Request(_) => "PANEL_UNREACHABLE",
            PanelError::Status { .. } => "PANEL_BAD_STATUS",
            PanelError::Decode(_) => "PANEL_BAD_RESPONSE",
        }
    }

    /// HTTP status of the panel answer, if there was one
    pub fn status(&self) -> Option<u16> {
        match self {
            PanelError::Status { status, .. } => Some(*status),
            PanelError::Request(e) => e.status().map(|s| s.as_u16()),
            PanelError::Decode(_) => None,
        }
    }
}

/// Errors raised while decoding or encoding game protocol packets
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("VarInt is longer than 5 bytes")]
    VarIntTooLong,
    #[error("packet length {0} is out of range")]
    BadLength(i32),
    #[error("packet ended unexpectedly")]
    UnexpectedEof,
    #[error("unexpected packet id {0:#04x}")]
    UnexpectedPacket(i32),
    #[error("invalid string field")]
    InvalidString,
    #[error("timed out waiting for the peer")]
    Timeout,
    #[error("malformed status payload: {0}")]
    Status(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Stable code for log fields
    pub fn as_code(&self) -> &'static str {
        match self {
            ProtocolError::Io(_) => "IO",
            ProtocolError::VarIntTooLong => "VARINT_TOO_LONG",
            ProtocolError::BadLength(_) => "BAD_LENGTH",
            ProtocolError::UnexpectedEof => "UNEXPECTED_EOF",
            ProtocolError::UnexpectedPacket(_) => "UNEXPECTED_PACKET",
            ProtocolError::InvalidString => "INVALID_STRING",
            ProtocolError::Timeout => "TIMEOUT",
            ProtocolError::Status(_) => "BAD_STATUS_PAYLOAD",
        }
    }

    /// True when the peer simply hung up, which is routine for status pings
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            ProtocolError::UnexpectedEof => true,
            _ => false,
        }
    }
}

impl From<tokio::time::error::Elapsed> for ProtocolError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProtocolError::Timeout
    }
}
