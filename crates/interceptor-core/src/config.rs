//! Relay document parser.
//!
//! The primary format is TOML with one `[[bridge]]` table per relay.
//! Files ending in `.json` are read as the legacy bridge list (see
//! [`crate::legacy`]).

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::legacy;
use crate::plan::{PlanKind, PlanSpec};
use crate::types::{EndpointAddress, SocketOptions};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub socket: SocketOptions,
    #[serde(default)]
    pub relay: RelayTunables,
    #[serde(default, rename = "bridge")]
    pub bridges: Vec<BridgeConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayTunables {
    /// Fixed interval between attempts to reach the target.
    pub connect_retry_ms: u64,
    /// Size of the per-read forwarding buffer.
    pub read_buffer_bytes: usize,
}

impl RelayTunables {
    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }
}

impl Default for RelayTunables {
    fn default() -> Self {
        Self {
            connect_retry_ms: 500,
            read_buffer_bytes: 8192,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub listen: EndpointAddress,
    pub target: EndpointAddress,
    /// Client → target policy.
    pub plan: PlanSpec,
    /// Target → client policy; defaults to the same kind as `plan`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_plan: Option<PlanSpec>,
}

/// A fully validated relay, ready to hand to a bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayDescriptor {
    pub name: String,
    pub listen: EndpointAddress,
    pub target: EndpointAddress,
    pub forward: PlanKind,
    pub reverse: PlanKind,
}

impl RelayConfig {
    /// Load a relay document, picking the format from the file extension.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_bridges_json(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse the legacy JSON bridge list; socket options and tunables
    /// take their defaults.
    pub fn from_bridges_json(content: &str) -> ConfigResult<Self> {
        Ok(Self {
            bridges: legacy::parse_bridges(content)?,
            ..Self::default()
        })
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate the whole document and resolve every bridge's plans.
    pub fn descriptors(&self) -> ConfigResult<Vec<RelayDescriptor>> {
        if self.bridges.is_empty() {
            return Err(ConfigError::Empty);
        }
        if self.relay.read_buffer_bytes == 0 {
            return Err(ConfigError::InvalidTunable {
                name: "read_buffer_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }

        let mut seen = HashSet::new();
        let mut descriptors = Vec::with_capacity(self.bridges.len());

        for bridge in &self.bridges {
            check_address(&bridge.listen)?;
            check_address(&bridge.target)?;

            // Port 0 asks the OS for a fresh port, so it never collides.
            if bridge.listen.port != 0 && !seen.insert(bridge.listen.clone()) {
                return Err(ConfigError::DuplicateListen(bridge.listen.to_string()));
            }

            let forward = PlanKind::from_spec(&bridge.plan)?;
            let reverse = match &bridge.return_plan {
                Some(spec) => PlanKind::from_spec(spec)?,
                None => forward.clone(),
            };

            descriptors.push(RelayDescriptor {
                name: bridge
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{}->{}", bridge.listen, bridge.target)),
                listen: bridge.listen.clone(),
                target: bridge.target.clone(),
                forward,
                reverse,
            });
        }

        Ok(descriptors)
    }
}

fn check_address(addr: &EndpointAddress) -> ConfigResult<()> {
    if addr.host.trim().is_empty() {
        return Err(ConfigError::InvalidAddress {
            address: addr.to_string(),
            reason: "host is empty".to_string(),
        });
    }
    Ok(())
}
