//! Shared value types used across interceptor crates.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One side of a relay: the address a bridge listens on, or the address
/// it forwards to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub host: String,
    pub port: u16,
}

impl EndpointAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form suitable for name resolution.
    ///
    /// Bare IPv6 literals are bracketed so the port separator stays
    /// unambiguous.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// Per-socket options applied to every accepted client and every
/// connected target socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
    /// Abortive close (`SO_LINGER` with a zero timeout) so a severed
    /// connection surfaces as a reset rather than lingering.
    pub linger_zero: bool,
}

impl SocketOptions {
    /// The `SO_LINGER` value these options ask for.
    pub fn linger(&self) -> Option<Duration> {
        self.linger_zero.then_some(Duration::ZERO)
    }
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            linger_zero: true,
        }
    }
}
