//! Per-connection handling.
//!
//! A session reads the first record from the client, splits it if it is a
//! ClientHello, writes the result upstream and then relays bytes both ways.
//! Any failure to parse falls back to forwarding the captured bytes
//! verbatim, so every byte read from the client reaches upstream exactly
//! once and in order.

use std::net::SocketAddr;
use std::time::Duration;

use terasu_tls_record::{read_initial_record, write_records, GapRange};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::{
    Config, DEFAULT_FIRST_FRAGMENT, DEFAULT_MAX_RECORD_SIZE, DEFAULT_READ_TIMEOUT,
};

use super::dialer::{DialError, MarkedDialer};
use super::relay::{relay, HalfClose, RelayStats};

/// Per-connection settings taken from [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Bytes in the first ClientHello record (0 = no split).
    pub first_fragment: usize,
    /// Pause between the first and second record.
    pub gap: GapRange,
    /// Deadline for the first record.
    pub read_timeout: Duration,
    /// Largest first-record payload to buffer.
    pub max_record_size: usize,
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            first_fragment: config.first_fragment,
            gap: config.gap,
            read_timeout: config.read_timeout,
            max_record_size: config.max_record_size,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            first_fragment: DEFAULT_FIRST_FRAGMENT,
            gap: GapRange::NONE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
        }
    }
}

/// Why captured bytes were forwarded without splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardReason {
    /// The first record could not be read completely.
    ReadFailed,
    /// The first record is not a ClientHello handshake.
    NotClientHello,
    /// The first record claims to be a ClientHello but is malformed.
    MalformedHandshake,
}

/// Why a session ended without relaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// The client sent nothing before closing or timing out.
    NoData,
    /// Writing captured bytes upstream failed.
    ForwardFailed,
    /// Writing the split records upstream failed.
    WriteFailed,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The ClientHello was written as `records` records, then relayed.
    Split { records: usize, relay: RelayStats },
    /// Captured bytes were forwarded verbatim, then relayed.
    Forwarded {
        reason: ForwardReason,
        relay: RelayStats,
    },
    /// The session was dropped.
    Abandoned { reason: AbandonReason },
}

/// One client connection paired with its upstream connection.
pub struct Session<C, U> {
    client: C,
    upstream: U,
    options: SessionOptions,
}

impl<C, U> Session<C, U>
where
    C: AsyncRead + AsyncWrite + HalfClose + Unpin,
    U: AsyncRead + AsyncWrite + HalfClose + Unpin,
{
    /// Pair a client with an already connected upstream.
    pub fn new(client: C, upstream: U, options: SessionOptions) -> Self {
        Self {
            client,
            upstream,
            options,
        }
    }

    /// Run the session to completion. Both connections are closed on return.
    pub async fn run(mut self) -> SessionOutcome {
        let initial = read_initial_record(
            &mut self.client,
            Some(self.options.read_timeout),
            self.options.max_record_size,
        )
        .await;

        let record = match initial.result {
            Ok(record) => record,
            Err(e) if initial.raw.is_empty() => {
                debug!(
                    component = "session",
                    error = %e,
                    eof = e.is_eof(),
                    "no initial data from client"
                );
                return SessionOutcome::Abandoned {
                    reason: AbandonReason::NoData,
                };
            }
            Err(e) => {
                debug!(
                    component = "session",
                    error = %e,
                    eof = e.is_eof(),
                    captured = initial.raw.len(),
                    "falling back to transparent piping after read failure"
                );
                return self
                    .forward_then_relay(&initial.raw, ForwardReason::ReadFailed)
                    .await;
            }
        };

        let records = match record.split_client_hello(self.options.first_fragment) {
            Ok(records) => records,
            Err(e) if e.is_protocol_mismatch() => {
                debug!(
                    component = "session",
                    reason = %e,
                    "first record not ClientHello handshake; forwarding transparently"
                );
                return self
                    .forward_then_relay(&initial.raw, ForwardReason::NotClientHello)
                    .await;
            }
            Err(e) => {
                warn!(
                    component = "session",
                    error = %e,
                    "unable to split ClientHello; forwarding transparently"
                );
                return self
                    .forward_then_relay(&initial.raw, ForwardReason::MalformedHandshake)
                    .await;
            }
        };

        if let Err(e) = write_records(&mut self.upstream, &records, self.options.gap).await {
            warn!(component = "session", error = %e, "writing split records failed");
            return SessionOutcome::Abandoned {
                reason: AbandonReason::WriteFailed,
            };
        }

        if records.len() > 1 {
            debug!(
                component = "session",
                first = records[0].payload.len(),
                second = records[1].payload.len(),
                "split ClientHello record"
            );
        } else {
            debug!(
                component = "session",
                "forwarded ClientHello without splitting (first fragment disabled)"
            );
        }

        let records = records.len();
        let relay = relay(self.client, self.upstream).await;
        SessionOutcome::Split { records, relay }
    }

    async fn forward_then_relay(mut self, raw: &[u8], reason: ForwardReason) -> SessionOutcome {
        if let Err(e) = self.upstream.write_all(raw).await {
            warn!(component = "session", error = %e, "forward initial bytes upstream failed");
            return SessionOutcome::Abandoned {
                reason: AbandonReason::ForwardFailed,
            };
        }

        let mut relay = relay(self.client, self.upstream).await;
        relay.client_to_upstream += raw.len() as u64;
        SessionOutcome::Forwarded { reason, relay }
    }
}

/// Dial the original destination for an accepted client and run its session.
///
/// `dst` is the client socket's local address, which transparent capture
/// leaves set to the address the client was trying to reach. A dial failure
/// drops the client connection.
pub async fn handle_connection(
    client: TcpStream,
    dst: SocketAddr,
    dialer: MarkedDialer,
    options: SessionOptions,
) -> Result<SessionOutcome, DialError> {
    let upstream = match dialer.connect(dst).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(component = "session", error = %e, "dial upstream failed");
            return Err(e);
        }
    };

    Ok(Session::new(client, upstream, options).run().await)
}
