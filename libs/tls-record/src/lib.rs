//! # terasu-tls-record
//!
//! TLS record framing for the splitting proxy.
//!
//! This library provides:
//! - Parsing of the first record of a stream, keeping the raw bytes read
//! - Splitting a ClientHello record into two records
//! - Writing records with a randomized pause between the first two
//!
//! Nothing here decrypts or validates TLS. Only the record header and the
//! handshake header of the first record are inspected.

mod error;
mod gap;
mod io;
mod record;

pub use error::{GapRangeError, RecordError, SplitError};
pub use gap::GapRange;
pub use io::{read_initial_record, write_record, write_records, InitialRead};
pub use record::{
    Record, CONTENT_TYPE_HANDSHAKE, HANDSHAKE_HEADER_LEN, HANDSHAKE_TYPE_CLIENT_HELLO,
    MAX_RECORD_PAYLOAD, RECORD_HEADER_LEN,
};
