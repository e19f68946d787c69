pub mod config;
pub mod proxy;

pub use config::{Cli, Config, ConfigError};
pub use proxy::{
    bind_transparent, handle_connection, relay, AbandonReason, DialError, ForwardReason,
    HalfClose, Listener, ListenerConfig, MarkedDialer, ProxyStats, RelayStats, Session,
    SessionOptions, SessionOutcome,
};
