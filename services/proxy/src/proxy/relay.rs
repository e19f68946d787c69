//! Bidirectional byte relay.
//!
//! Two copy loops run concurrently, client to upstream and upstream to
//! client. When a loop reaches EOF it half-closes its destination if the
//! transport supports it; otherwise both connections are closed. The relay
//! returns once both loops have finished.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Graceful write-side shutdown capability.
///
/// A transport that supports half-close keeps delivering inbound data
/// after its write side has been shut down.
pub trait HalfClose {
    /// Whether shutting down writes leaves the read side usable.
    fn supports_half_close(&self) -> bool {
        false
    }
}

impl HalfClose for TcpStream {
    fn supports_half_close(&self) -> bool {
        true
    }
}

impl HalfClose for DuplexStream {
    fn supports_half_close(&self) -> bool {
        true
    }
}

/// Bytes moved in each direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from the client to upstream.
    pub client_to_upstream: u64,
    /// Bytes copied from upstream to the client.
    pub upstream_to_client: u64,
}

/// Relay bytes between `client` and `upstream` until both directions finish.
///
/// Both connections are closed when this returns.
pub async fn relay<C, U>(client: C, upstream: U) -> RelayStats
where
    C: AsyncRead + AsyncWrite + HalfClose + Unpin,
    U: AsyncRead + AsyncWrite + HalfClose + Unpin,
{
    let client_half_close = client.supports_half_close();
    let upstream_half_close = upstream.supports_half_close();

    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let close_all = CancellationToken::new();

    let (client_to_upstream, upstream_to_client) = tokio::join!(
        pump(
            "client -> upstream",
            client_read,
            upstream_write,
            upstream_half_close,
            &close_all,
        ),
        pump(
            "upstream -> client",
            upstream_read,
            client_write,
            client_half_close,
            &close_all,
        ),
    );

    RelayStats {
        client_to_upstream,
        upstream_to_client,
    }
}

/// Copy one direction, then close the destination's write side.
async fn pump<R, W>(
    direction: &'static str,
    mut reader: R,
    mut writer: W,
    half_close: bool,
    close_all: &CancellationToken,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;

    let result = tokio::select! {
        result = copy(&mut reader, &mut writer, &mut total) => result,
        _ = close_all.cancelled() => Ok(()),
    };

    if let Err(e) = result {
        if !is_closed_error(&e) {
            debug!(component = "relay", direction, error = %e, "copy error");
        }
    }

    if half_close {
        let _ = writer.shutdown().await;
    } else {
        close_all.cancel();
    }

    total
}

async fn copy<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
}

/// Errors that only mean the peer went away.
pub(crate) fn is_closed_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}
