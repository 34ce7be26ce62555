//! fedtree - Assemble and reconcile a tiered tree of federated agents.
//!
//! This library provides the core functionality for the `fedtree` CLI tool:
//! the per-agent WebSocket RPC transport, the topology model, and the
//! reconciliation procedures that drive remote agents toward it.

pub mod cli;
pub mod commands;
pub mod config;
pub mod models;
pub mod notifications;
pub mod reconcile;
pub mod storage;
pub mod transport;

pub use reconcile::PreconditionError;
pub use transport::TransportError;
pub use transport::protocol::ProtocolError;

/// Library-level error type for fedtree operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Precondition(#[from] PreconditionError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for fedtree operations.
pub type Result<T> = std::result::Result<T, Error>;
