//! Proxy configuration.
//!
//! Flags mirror the environment (`TERASU_*`) so the binary can be driven
//! either way. [`Config::from_cli`] is the only place values are checked;
//! everything downstream trusts a [`Config`].

use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use terasu_tls_record::{GapRange, GapRangeError};
use thiserror::Error;

/// Default transparent listen address.
pub const DEFAULT_LISTEN: &str = ":15001";

/// Default size of the first ClientHello fragment.
pub const DEFAULT_FIRST_FRAGMENT: usize = 3;

/// Default cap on the buffered first record payload.
pub const DEFAULT_MAX_RECORD_SIZE: usize = 64 * 1024;

/// Default SO_MARK for upstream sockets.
pub const DEFAULT_MARK: u32 = 0x66;

/// Default wait for the first record.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Default upstream connect timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Command-line arguments.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "terasu-proxy",
    version,
    about = "Transparent TLS ClientHello record splitter"
)]
pub struct Cli {
    /// Transparent listen address (TPROXY target). `:PORT` listens on all interfaces.
    #[arg(long, env = "TERASU_LISTEN", default_value = DEFAULT_LISTEN)]
    pub listen: String,

    /// Bytes placed in the first ClientHello record. 0 disables splitting.
    #[arg(long, env = "TERASU_FIRST", default_value_t = DEFAULT_FIRST_FRAGMENT)]
    pub first: usize,

    /// Maximum record payload to buffer for the first ClientHello record.
    #[arg(long = "max", env = "TERASU_MAX", default_value_t = DEFAULT_MAX_RECORD_SIZE)]
    pub max_record_size: usize,

    /// SO_MARK applied to upstream connections (decimal or 0x-prefixed hex). 0 disables it.
    #[arg(long, env = "TERASU_MARK", default_value = "0x66", value_parser = parse_mark)]
    pub mark: u32,

    /// Log level (debug, info, warn, error).
    #[arg(long = "log-level", env = "TERASU_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Gap range in milliseconds between the two records, as `min,max`.
    #[arg(long, env = "TERASU_GAP", default_value = "0,0")]
    pub gap: String,

    /// Read timeout (ms) while waiting for the initial TLS record.
    #[arg(long = "rt", env = "TERASU_READ_TIMEOUT_MS", default_value_t = 250)]
    pub read_timeout_ms: u64,

    /// Upstream dial timeout in milliseconds.
    #[arg(long = "dial", env = "TERASU_DIAL_TIMEOUT_MS", default_value_t = 5000)]
    pub dial_timeout_ms: u64,
}

fn parse_mark(value: &str) -> Result<u32, String> {
    let value = value.trim();
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid mark {value:?}: {e}"))
}

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// No listen address given.
    #[error("listen address must not be empty")]
    EmptyListen,

    /// The listen address could not be parsed.
    #[error("invalid listen address: {0}")]
    InvalidListen(String),

    /// Record cap of zero.
    #[error("max record size must be positive")]
    ZeroMaxRecordSize,

    /// Bad gap range.
    #[error("invalid gap: {0}")]
    Gap(#[from] GapRangeError),

    /// Read timeout of zero.
    #[error("read timeout must be positive")]
    ZeroReadTimeout,

    /// Dial timeout of zero.
    #[error("dial timeout must be positive")]
    ZeroDialTimeout,

    /// Log level outside the supported set.
    #[error("unsupported log level: {0}")]
    UnsupportedLogLevel(String),
}

/// Validated, immutable runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address the transparent listener binds to.
    pub listen_addr: SocketAddr,
    /// Bytes in the first ClientHello record (0 = no split).
    pub first_fragment: usize,
    /// Pause between the first and second record.
    pub gap: GapRange,
    /// Deadline for reading the first record.
    pub read_timeout: Duration,
    /// Deadline for connecting upstream.
    pub dial_timeout: Duration,
    /// Largest first-record payload that will be buffered.
    pub max_record_size: usize,
    /// SO_MARK for upstream sockets (0 = unmarked).
    pub mark: u32,
    /// Normalized log level: debug, info, warn or error.
    pub log_level: String,
}

impl Config {
    /// Validate parsed arguments.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let listen_addr = parse_listen_addr(&cli.listen)?;

        if cli.max_record_size == 0 {
            return Err(ConfigError::ZeroMaxRecordSize);
        }

        let gap: GapRange = cli.gap.parse()?;

        if cli.read_timeout_ms == 0 {
            return Err(ConfigError::ZeroReadTimeout);
        }
        if cli.dial_timeout_ms == 0 {
            return Err(ConfigError::ZeroDialTimeout);
        }

        let log_level = normalize_log_level(&cli.log_level)?;

        Ok(Self {
            listen_addr,
            first_fragment: cli.first,
            gap,
            read_timeout: Duration::from_millis(cli.read_timeout_ms),
            dial_timeout: Duration::from_millis(cli.dial_timeout_ms),
            max_record_size: cli.max_record_size,
            mark: cli.mark,
            log_level,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 15001),
            first_fragment: DEFAULT_FIRST_FRAGMENT,
            gap: GapRange::NONE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
            mark: DEFAULT_MARK,
            log_level: "info".to_string(),
        }
    }
}

/// Parse a listen address. A bare `:PORT` binds every interface, both families.
fn parse_listen_addr(value: &str) -> Result<SocketAddr, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::EmptyListen);
    }

    if let Some(port) = value.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::InvalidListen(value.to_string()))?;
        return Ok(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port));
    }

    value
        .parse()
        .map_err(|_| ConfigError::InvalidListen(value.to_string()))
}

fn normalize_log_level(value: &str) -> Result<String, ConfigError> {
    let level = value.trim().to_lowercase();
    match level.as_str() {
        "debug" | "info" | "warn" | "error" => Ok(level),
        "warning" => Ok("warn".to_string()),
        _ => Err(ConfigError::UnsupportedLogLevel(value.to_string())),
    }
}
