//! Legacy JSON bridge list.
//!
//! Older runners described bridges as a JSON array on the command line:
//!
//! ```text
//! [{
//!     "interposing_host": "127.0.0.1", "interposing_port": 5555,
//!     "to_connect_to_host": "127.0.0.1", "to_connect_to_port": 5556,
//!     "plan": { "type": "constant_delay", "additional_args": { "delay_seconds": 1 } }
//! }]
//! ```
//!
//! Every field is required. Both directions of a legacy bridge run the
//! same plan kind.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::config::BridgeConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::plan::PlanSpec;
use crate::types::EndpointAddress;

#[derive(Debug, Deserialize)]
struct LegacyBridge {
    interposing_host: Option<String>,
    interposing_port: Option<Value>,
    to_connect_to_host: Option<String>,
    to_connect_to_port: Option<Value>,
    plan: Option<LegacyPlan>,
}

#[derive(Debug, Deserialize)]
struct LegacyPlan {
    #[serde(rename = "type")]
    kind: Option<String>,
    additional_args: Option<BTreeMap<String, Value>>,
}

/// Parse a legacy bridge list into bridge configs.
pub fn parse_bridges(json: &str) -> ConfigResult<Vec<BridgeConfig>> {
    let raw: Vec<LegacyBridge> =
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;

    raw.into_iter().map(convert).collect()
}

fn convert(bridge: LegacyBridge) -> ConfigResult<BridgeConfig> {
    let listen_host = bridge
        .interposing_host
        .ok_or(ConfigError::MissingField("interposing_host"))?;
    let listen_port = bridge
        .interposing_port
        .ok_or(ConfigError::MissingField("interposing_port"))?;
    let target_host = bridge
        .to_connect_to_host
        .ok_or(ConfigError::MissingField("to_connect_to_host"))?;
    let target_port = bridge
        .to_connect_to_port
        .ok_or(ConfigError::MissingField("to_connect_to_port"))?;
    let plan = bridge.plan.ok_or(ConfigError::MissingField("plan"))?;
    let kind = plan.kind.ok_or(ConfigError::MissingField("plan.type"))?;
    let params = plan
        .additional_args
        .ok_or(ConfigError::MissingField("plan.additional_args"))?;

    let listen_port = port(&listen_host, &listen_port)?;
    let target_port = port(&target_host, &target_port)?;

    Ok(BridgeConfig {
        name: None,
        listen: EndpointAddress::new(listen_host, listen_port),
        target: EndpointAddress::new(target_host, target_port),
        plan: PlanSpec { kind, params },
        return_plan: None,
    })
}

fn port(host: &str, value: &Value) -> ConfigResult<u16> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    };

    parsed.ok_or_else(|| ConfigError::InvalidAddress {
        address: format!("{host}:{value}"),
        reason: "port must be an integer between 0 and 65535".to_string(),
    })
}
