//! TLS record representation and ClientHello splitting.
//!
//! Record layout on the wire:
//! - byte 0: content type (0x16 = Handshake)
//! - bytes 1-2: version (opaque, echoed unchanged)
//! - bytes 3-4: payload length
//! - bytes 5+: payload
//!
//! Handshake payload header:
//! - byte 0: message type (0x01 = ClientHello)
//! - bytes 1-3: body length (24-bit big-endian)

use crate::error::{RecordError, SplitError};

/// Length of the record header.
pub const RECORD_HEADER_LEN: usize = 5;

/// Length of the handshake message header inside a record payload.
pub const HANDSHAKE_HEADER_LEN: usize = 4;

/// Largest payload a record length field can describe.
pub const MAX_RECORD_PAYLOAD: usize = 0xFFFF;

/// Record content type for handshake messages.
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type for ClientHello.
pub const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

/// A single TLS record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Record content type.
    pub content_type: u8,
    /// Protocol version field, never interpreted.
    pub version: u16,
    /// Record payload.
    pub payload: Vec<u8>,
}

impl Record {
    /// Create a record from its parts.
    pub fn new(content_type: u8, version: u16, payload: Vec<u8>) -> Self {
        Self {
            content_type,
            version,
            payload,
        }
    }

    /// Encode the 5-byte record header for this payload.
    pub fn header(&self) -> Result<[u8; RECORD_HEADER_LEN], RecordError> {
        let length = self.payload.len();
        if length > MAX_RECORD_PAYLOAD {
            return Err(RecordError::PayloadTooLarge(length));
        }
        let [v0, v1] = self.version.to_be_bytes();
        let [l0, l1] = (length as u16).to_be_bytes();
        Ok([self.content_type, v0, v1, l0, l1])
    }

    /// Encode header and payload into one contiguous buffer.
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        let header = self.header()?;
        let mut out = Vec::with_capacity(RECORD_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parse the handshake header at the start of the payload.
    ///
    /// Returns the message type and the declared 24-bit body length.
    pub fn handshake_header(&self) -> Result<(u8, usize), SplitError> {
        if self.content_type != CONTENT_TYPE_HANDSHAKE {
            return Err(SplitError::NotHandshake(self.content_type));
        }
        if self.payload.len() < HANDSHAKE_HEADER_LEN {
            return Err(SplitError::HandshakeTooShort(self.payload.len()));
        }
        let p = &self.payload;
        let body_length = (p[1] as usize) << 16 | (p[2] as usize) << 8 | p[3] as usize;
        Ok((p[0], body_length))
    }

    /// Split a ClientHello record into one or two records.
    ///
    /// With `first` of zero or at least the payload length the result is a
    /// single copy of this record. Otherwise the payload is cut at `first`
    /// and both halves keep the original content type and version.
    pub fn split_client_hello(&self, first: usize) -> Result<Vec<Record>, SplitError> {
        let (msg_type, body_length) = self.handshake_header()?;
        if msg_type != HANDSHAKE_TYPE_CLIENT_HELLO {
            return Err(SplitError::NotClientHello(msg_type));
        }

        let len = self.payload.len();
        if body_length + HANDSHAKE_HEADER_LEN != len {
            return Err(SplitError::LengthMismatch {
                declared: body_length,
                actual: len - HANDSHAKE_HEADER_LEN,
            });
        }

        if first == 0 || first >= len {
            return Ok(vec![self.with_payload(self.payload.to_vec())]);
        }

        let (head, tail) = self.payload.split_at(first);
        Ok(vec![
            self.with_payload(head.to_vec()),
            self.with_payload(tail.to_vec()),
        ])
    }

    fn with_payload(&self, payload: Vec<u8>) -> Record {
        Record::new(self.content_type, self.version, payload)
    }
}
