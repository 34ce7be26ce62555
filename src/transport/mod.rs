//! Per-agent WebSocket RPC transport.
//!
//! One [`Connection`] owns the socket to one agent address and keeps it
//! alive forever; an [`RpcClient`] layers request/response correlation on
//! top; a [`ConnectionPool`] hands out one client per address.

pub mod connection;
mod link;
pub mod pool;
pub mod protocol;
pub mod rpc;

use std::time::Duration;

pub use connection::{Connection, ConnectionState, RetryPolicy};
pub use pool::ConnectionPool;
pub use protocol::{Operation, RolePaths};
pub use rpc::RpcClient;

/// Default delay between reconnect attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Default interval for re-checking a missing or invalid address.
pub const DEFAULT_ADDRESS_POLL: Duration = Duration::from_secs(1);

/// Failures of the transport itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection is not open")]
    NotOpen,

    #[error("connection closed before a reply arrived")]
    Closed,

    #[error("reply is not valid JSON: {0}")]
    MalformedReply(String),

    #[error("no reply within {0:?}")]
    TimedOut(Duration),

    #[error("failed to encode request: {0}")]
    Encode(String),
}

/// Settings shared by every connection a pool creates.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// URL scheme of agent endpoints (`ws` or `wss`)
    pub scheme: String,
    pub retry: RetryPolicy,
    /// How often a connection without a valid address re-checks it
    pub address_poll: Duration,
    /// Upper bound on one call, or `None` to wait indefinitely
    pub call_timeout: Option<Duration>,
    pub role_paths: RolePaths,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            scheme: "ws".to_string(),
            retry: RetryPolicy::default(),
            address_poll: DEFAULT_ADDRESS_POLL,
            call_timeout: None,
            role_paths: RolePaths::default(),
        }
    }
}
