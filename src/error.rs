//! Error types for the network engine.
//!
//! Only control-plane and setup failures surface as `NetError`. Per-packet
//! problems are counted in [`crate::stats::Stats`] and answered on the wire
//! (drop, RST or ICMP error) by the layer that detects them.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    /// Host socket or pipe failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Port-forward rule could not be added or removed.
    #[error("port forwarding error: {0}")]
    Forward(String),

    /// The engine request queue is gone (engine thread exited).
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// A blocking request did not complete within its bounded wait.
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Host resolver failure.
    #[error("resolver error: {0}")]
    Resolver(String),

    /// The stack is shutting down.
    #[error("network stack is shut down")]
    Shutdown,
}
