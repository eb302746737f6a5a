//! Error types for bridge activation.

use thiserror::Error;

/// Result type alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors surfaced by [`crate::Bridge::activate`].
///
/// Once a bridge is listening nothing escapes it: connection failures
/// are absorbed into teardown-and-relisten.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to resolve {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}
