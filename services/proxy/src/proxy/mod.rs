//! Transparent TLS record-splitting proxy.
//!
//! This module provides:
//! - Transparent TCP listener setup (IP_TRANSPARENT, dual stack)
//! - Upstream dialing with SO_MARK
//! - Per-connection sessions that split the ClientHello record
//! - Bidirectional relaying with half-close
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Session -> read first record -> split -> write (with gap) -> Upstream
//!                          |                                                            ^
//!                          +---- on any parse failure: forward captured bytes ----------+
//!                          |
//!                          +---- Relay (both directions) until EOF
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::Listener;
//!
//! let listener = Listener::bind(&config)?;
//! listener.run(cancel_token).await?;
//! ```

mod dialer;
mod listener;
mod relay;
mod session;

pub use dialer::{DialError, MarkedDialer};
pub use listener::{bind_transparent, Listener, ListenerConfig, ProxyStats, DEFAULT_BACKLOG};
pub use relay::{relay, HalfClose, RelayStats};
pub use session::{
    handle_connection, AbandonReason, ForwardReason, Session, SessionOptions, SessionOutcome,
};
