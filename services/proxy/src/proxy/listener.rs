//! Transparent TCP listener and connection handling.
//!
//! The listening socket is configured before bind so it can accept
//! connections addressed to any destination (IP_TRANSPARENT), which is
//! what TPROXY-style capture delivers. Each accepted connection's local
//! address is therefore the client's original destination.
//!
//! Connections run on a task tracker and race a shared cancellation token;
//! cancelling drops every in-flight session, closing both of its sockets.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::Config;

use super::dialer::{DialError, MarkedDialer};
use super::session::{handle_connection, SessionOptions, SessionOutcome};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Pause after a transient accept error.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Socket-level configuration for the listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Set IP_TRANSPARENT / IPV6_TRANSPARENT (requires CAP_NET_ADMIN).
    pub transparent: bool,
    /// Listen backlog.
    pub backlog: u32,
}

impl ListenerConfig {
    /// Create a transparent listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            transparent: true,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// Bind a listening socket with the options transparent capture needs.
///
/// SO_REUSEADDR and IP_TRANSPARENT are required; SO_REUSEPORT and
/// IPV6_TRANSPARENT are best effort. IPv6 sockets also accept IPv4.
pub fn bind_transparent(config: &ListenerConfig) -> io::Result<TcpListener> {
    let addr = config.bind_addr;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    if let Err(e) = socket.set_reuse_port(true) {
        debug!(component = "listener", error = %e, "set SO_REUSEPORT failed");
    }

    if config.transparent {
        set_transparent(&socket)?;
    }

    if addr.is_ipv6() {
        if let Err(e) = socket.set_only_v6(false) {
            debug!(component = "listener", error = %e, "clear IPV6_V6ONLY failed");
        }
    }

    socket.bind(&addr.into())?;
    socket.listen(config.backlog as i32)?;
    socket.set_nonblocking(true)?;

    TcpListener::from_std(socket.into())
}

#[cfg(target_os = "linux")]
fn set_transparent(socket: &Socket) -> io::Result<()> {
    socket
        .set_ip_transparent(true)
        .map_err(|e| io::Error::new(e.kind(), format!("set IP_TRANSPARENT: {e}")))?;

    if let Err(e) = set_ipv6_transparent(socket) {
        match e.raw_os_error() {
            Some(libc::ENOPROTOOPT) | Some(libc::EINVAL) => {}
            _ => debug!(component = "listener", error = %e, "set IPV6_TRANSPARENT failed"),
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_ipv6_transparent(socket: &Socket) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let enable: libc::c_int = 1;
    // SAFETY: the fd is owned by `socket` for the duration of the call and
    // the option value points to a live c_int of the advertised size.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_IPV6,
            libc::IPV6_TRANSPARENT,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn set_transparent(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "transparent sockets are only available on Linux",
    ))
}

/// Connection counters for a listener.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// ClientHello records written through the splitter.
    pub sessions_split: AtomicU64,
    /// Sessions that fell back to verbatim forwarding.
    pub sessions_forwarded: AtomicU64,
    /// Sessions dropped without relaying.
    pub sessions_abandoned: AtomicU64,
    /// Upstream dial failures.
    pub dial_failed: AtomicU64,
    /// Bytes relayed from clients to upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed from upstream to clients.
    pub bytes_to_client: AtomicU64,
}

impl ProxyStats {
    fn record(&self, result: &Result<SessionOutcome, DialError>) {
        let relay = match result {
            Ok(SessionOutcome::Split { relay, .. }) => {
                self.sessions_split.fetch_add(1, Ordering::Relaxed);
                relay
            }
            Ok(SessionOutcome::Forwarded { relay, .. }) => {
                self.sessions_forwarded.fetch_add(1, Ordering::Relaxed);
                relay
            }
            Ok(SessionOutcome::Abandoned { .. }) => {
                self.sessions_abandoned.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(_) => {
                self.dial_failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        self.bytes_to_upstream
            .fetch_add(relay.client_to_upstream, Ordering::Relaxed);
        self.bytes_to_client
            .fetch_add(relay.upstream_to_client, Ordering::Relaxed);
    }
}

/// The transparent listener and its accept loop.
pub struct Listener {
    listener: TcpListener,
    dialer: MarkedDialer,
    options: SessionOptions,
    tracker: TaskTracker,
    stats: Arc<ProxyStats>,
    upstream: Option<SocketAddr>,
}

impl Listener {
    /// Bind the transparent listener described by `config`.
    pub fn bind(config: &Config) -> io::Result<Self> {
        Self::bind_with(&ListenerConfig::new(config.listen_addr), config)
    }

    /// Bind with explicit socket options.
    pub fn bind_with(listener_config: &ListenerConfig, config: &Config) -> io::Result<Self> {
        let listener = bind_transparent(listener_config)?;
        let dialer = MarkedDialer::new(config.mark, config.dial_timeout);
        info!(
            component = "listener",
            bind_addr = %listener.local_addr()?,
            transparent = listener_config.transparent,
            mark = dialer.mark(),
            "Listener bound"
        );

        Ok(Self {
            listener,
            dialer,
            options: SessionOptions::from(config),
            tracker: TaskTracker::new(),
            stats: Arc::new(ProxyStats::default()),
            upstream: None,
        })
    }

    /// Send every connection to `upstream` instead of its original
    /// destination. For traffic that reaches the listener without
    /// transparent capture, where the local address is the listener itself.
    pub fn with_upstream(mut self, upstream: SocketAddr) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `cancel` fires, then close every in-flight
    /// connection and wait for their tasks to finish.
    pub async fn run(self, cancel: CancellationToken) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(component = "listener", bind_addr = %local_addr, "transparent proxy listening");

        let result = loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.spawn_connection(stream, peer, &cancel),
                Err(_) if cancel.is_cancelled() => break Ok(()),
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(component = "listener", error = %e, "accept failed; retrying");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                Err(e) => {
                    error!(component = "listener", error = %e, "accept failed");
                    cancel.cancel();
                    break Err(e);
                }
            }
        };

        drop(self.listener);
        let active = self.stats.connections_active.load(Ordering::Relaxed);
        if active > 0 {
            info!(component = "listener", active, "closing active connections");
        }
        self.tracker.close();
        self.tracker.wait().await;

        let stats = &self.stats;
        info!(
            component = "listener",
            accepted = stats.connections_accepted.load(Ordering::Relaxed),
            split = stats.sessions_split.load(Ordering::Relaxed),
            forwarded = stats.sessions_forwarded.load(Ordering::Relaxed),
            abandoned = stats.sessions_abandoned.load(Ordering::Relaxed),
            dial_failed = stats.dial_failed.load(Ordering::Relaxed),
            bytes_to_upstream = stats.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_to_client = stats.bytes_to_client.load(Ordering::Relaxed),
            "Listener stopped"
        );

        result
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr, cancel: &CancellationToken) {
        let dst = match self
            .upstream
            .map_or_else(|| stream.local_addr().map(original_destination), Ok)
        {
            Ok(dst) => dst,
            Err(e) => {
                debug!(component = "listener", peer = %peer, error = %e, "accepted socket has no local address");
                return;
            }
        };

        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let stats = Arc::clone(&self.stats);
        let cancel = cancel.clone();
        let dialer = self.dialer;
        let options = self.options;

        self.tracker.spawn(
            async move {
                info!(component = "listener", "accepted connection");

                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(component = "listener", "closing connection for shutdown");
                    }
                    result = handle_connection(stream, dst, dialer, options) => {
                        stats.record(&result);
                    }
                }

                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            }
            .instrument(tracing::info_span!("connection", peer = %peer, dst = %dst)),
        );
    }
}

/// The destination of an accepted connection, from its local address.
///
/// IPv4 flows accepted on the dual-stack socket report an IPv4-mapped IPv6
/// address; these are dialed as plain IPv4.
fn original_destination(local: SocketAddr) -> SocketAddr {
    SocketAddr::new(local.ip().to_canonical(), local.port())
}

/// Accept errors that concern a single connection or a momentary resource
/// shortage rather than the listener itself.
fn is_transient_accept_error(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }

    #[cfg(unix)]
    if matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    ) {
        return true;
    }

    false
}
