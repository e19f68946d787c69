//! Error types for record framing and splitting.

use std::io;

use thiserror::Error;

/// Errors raised while reading or writing TLS records.
#[derive(Debug, Error)]
pub enum RecordError {
    /// Underlying stream error, including a short read at EOF.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The read deadline expired before the record was complete.
    #[error("timed out waiting for record")]
    TimedOut,

    /// The declared record length exceeds the configured cap.
    #[error("record too large: declared {length} bytes, limit {limit}")]
    TooLarge { length: usize, limit: usize },

    /// A payload that cannot be framed in a single record.
    #[error("record payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

impl RecordError {
    /// True when the peer closed the stream before a full record arrived.
    pub fn is_eof(&self) -> bool {
        matches!(self, RecordError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Reasons a record cannot be split as a ClientHello.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SplitError {
    /// The record content type is not Handshake.
    #[error("record is not a handshake (content type {0:#04x})")]
    NotHandshake(u8),

    /// The payload cannot hold a handshake header.
    #[error("handshake record too short: {0} bytes")]
    HandshakeTooShort(usize),

    /// The handshake message is not a ClientHello.
    #[error("handshake is not a ClientHello (message type {0:#04x})")]
    NotClientHello(u8),

    /// The 24-bit body length disagrees with the record payload.
    #[error("handshake length mismatch: header={declared} payload={actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

impl SplitError {
    /// Whether the record is simply something other than a ClientHello,
    /// as opposed to a malformed handshake.
    pub fn is_protocol_mismatch(&self) -> bool {
        matches!(
            self,
            SplitError::NotHandshake(_) | SplitError::NotClientHello(_)
        )
    }
}

/// Invalid inter-record gap range.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GapRangeError {
    /// The value is not `min,max`.
    #[error("gap must be formatted as min,max")]
    Format,

    /// A bound is not a non-negative integer.
    #[error("gap {bound} must be a non-negative integer: {value:?}")]
    NotInteger { bound: &'static str, value: String },

    /// Lower bound above upper bound.
    #[error("gap min {min}ms must not exceed gap max {max}ms")]
    Inverted { min: u64, max: u64 },
}
