//! Upstream dialer.
//!
//! Every outbound socket carries the configured SO_MARK so the capture rule
//! that feeds the listener can exclude the proxy's own traffic. Without the
//! mark the upstream connection would be intercepted again and loop back
//! into the listener.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::debug;

/// Upstream dial failures.
#[derive(Debug, Error)]
pub enum DialError {
    /// The socket could not be created.
    #[error("create socket: {0}")]
    Socket(#[source] io::Error),

    /// SO_MARK could not be applied.
    #[error("set SO_MARK {mark:#x}: {source}")]
    Mark {
        mark: u32,
        #[source]
        source: io::Error,
    },

    /// The connection attempt failed.
    #[error("connect {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The connection attempt did not finish in time.
    #[error("connect {addr}: timed out after {timeout:?}")]
    TimedOut { addr: SocketAddr, timeout: Duration },
}

/// Connects to upstream destinations with a socket mark and a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkedDialer {
    mark: u32,
    timeout: Duration,
}

impl MarkedDialer {
    /// Create a dialer. A mark of 0 leaves sockets unmarked.
    pub fn new(mark: u32, timeout: Duration) -> Self {
        Self { mark, timeout }
    }

    /// The mark applied to outbound sockets.
    pub fn mark(&self) -> u32 {
        self.mark
    }

    /// Connect to `addr`, bounded by the dial timeout. The returned stream
    /// has TCP_NODELAY enabled.
    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, DialError> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(DialError::Socket)?;

        if self.mark != 0 {
            set_mark(&socket, self.mark).map_err(|source| DialError::Mark {
                mark: self.mark,
                source,
            })?;
        }

        let stream = match timeout(self.timeout, socket.connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(DialError::Connect { addr, source }),
            Err(_) => {
                return Err(DialError::TimedOut {
                    addr,
                    timeout: self.timeout,
                })
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set TCP_NODELAY failed");
        }

        Ok(stream)
    }
}

#[cfg(target_os = "linux")]
fn set_mark(socket: &TcpSocket, mark: u32) -> io::Result<()> {
    socket2::SockRef::from(socket).set_mark(mark)
}

#[cfg(not(target_os = "linux"))]
fn set_mark(_socket: &TcpSocket, _mark: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_MARK is only available on Linux",
    ))
}
