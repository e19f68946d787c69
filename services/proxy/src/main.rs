//! terasu-proxy
//!
//! Transparent proxy that splits the TLS ClientHello across two records.
//!
//! This service:
//! - Accepts TPROXY-captured TCP connections on the listen address
//! - Dials each connection's original destination with SO_MARK set
//! - Splits the first ClientHello record in two, pausing between them
//! - Relays the rest of the connection untouched
//!
//! Routing and firewall rules that deliver traffic to the listener and
//! exempt marked traffic must be installed separately.

use anyhow::{Context, Result};
use clap::Parser;
use terasu_proxy::{Cli, Config, Listener};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_cli(Cli::parse()).context("invalid configuration")?;

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting terasu-proxy");
    info!(
        listen_addr = %config.listen_addr,
        first_fragment = config.first_fragment,
        gap_min_ms = config.gap.min().as_millis() as u64,
        gap_max_ms = config.gap.max().as_millis() as u64,
        read_timeout_ms = config.read_timeout.as_millis() as u64,
        dial_timeout_ms = config.dial_timeout.as_millis() as u64,
        max_record_size = config.max_record_size,
        mark = config.mark,
        "Configuration loaded"
    );

    let listener = Listener::bind(&config)
        .with_context(|| format!("listen tcp/{}", config.listen_addr))?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Received shutdown signal");
            cancel.cancel();
        }
    });

    listener.run(cancel).await.context("listener failed")?;

    info!("terasu-proxy shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
