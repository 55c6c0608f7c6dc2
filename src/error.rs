//! Error types for the server engine.
//!
//! The taxonomy separates transport failures (logged, connection closed),
//! protocol parse failures (connection closed immediately), handshake and
//! extension rejections (fall through to a normal HTTP response or close),
//! and data-source failures (converted into a write-failure completion).
//! None of these cross the thread boundary as errors; they are resolved
//! into connection closure on the background thread.

use std::io;

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error types.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying socket or listener.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Malformed HTTP input.
    #[error("invalid http: {0}")]
    Http(&'static str),
    /// WebSocket protocol violation.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// Undecodable frame header.
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    /// Upgrade handshake could not be validated.
    #[error("handshake failed: {0}")]
    Handshake(&'static str),
    /// A second request started before the prior response completed.
    #[error("pipelined request")]
    Pipelined,
    /// Frame payload exceeds the configured limit.
    #[error("frame too large")]
    FrameTooLarge,
    /// Reassembled message exceeds the configured limit.
    #[error("message too large")]
    MessageTooLarge,
    /// Request body exceeds the configured limit.
    #[error("body too large")]
    BodyTooLarge,
    /// Peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,
    /// A data source failed to produce its next chunk.
    #[error("data source error: {0}")]
    Source(io::Error),
    /// DEFLATE codec failure.
    #[error("compression error: {0}")]
    Compression(String),
    /// Close frame carried a code outside the RFC 6455 ranges.
    #[error("invalid close code: {0}")]
    InvalidCloseCode(u16),
}

/// Close frame reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code.
    pub code: u16,
    /// Optional reason string.
    pub reason: String,
}

impl CloseReason {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data.
    pub const UNSUPPORTED: u16 = 1003;
    /// Invalid frame payload.
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation.
    pub const POLICY: u16 = 1008;
    /// Message too big.
    pub const TOO_BIG: u16 = 1009;
    /// Internal server error.
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if the close code is valid per RFC 6455.
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}
