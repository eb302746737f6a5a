//! Error types for relay configuration.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating a relay document.
///
/// All of these are construction-time failures: they surface before any
/// listen socket is bound.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unknown plan type: {0}")]
    UnknownPlan(String),

    #[error("plan {plan} requires parameter {parameter}")]
    MissingParameter {
        plan: String,
        parameter: &'static str,
    },

    #[error("plan {plan} parameter {parameter} is invalid: {reason}")]
    InvalidParameter {
        plan: String,
        parameter: &'static str,
        reason: String,
    },

    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("listen address {0} is used by more than one bridge")]
    DuplicateListen(String),

    #[error("invalid tunable {name}: {reason}")]
    InvalidTunable { name: &'static str, reason: String },

    #[error("no bridges configured")]
    Empty,
}
