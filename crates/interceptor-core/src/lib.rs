//! interceptor-core: configuration and value types for the interceptor relay.
//!
//! Everything in this crate is pure: parsing and validating a relay
//! document never opens a socket or spawns a task. The runtime engine in
//! `interceptor-relay` only ever sees the validated [`RelayDescriptor`]s
//! produced here.

pub mod config;
pub mod error;
pub mod legacy;
pub mod plan;
pub mod types;

pub use config::{BridgeConfig, RelayConfig, RelayDescriptor, RelayTunables};
pub use error::{ConfigError, ConfigResult};
pub use plan::{PlanKind, PlanSpec};
pub use types::{EndpointAddress, SocketOptions};
