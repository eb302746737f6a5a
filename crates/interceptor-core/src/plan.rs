//! Plan specifications and the pure factory that validates them.
//!
//! A [`PlanSpec`] is the raw `{type, params...}` table read from a config
//! document. [`PlanKind::from_spec`] turns it into one of the fixed
//! policy variants or rejects it; nothing here touches the network.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, ConfigResult};

pub const PASS_THROUGH: &str = "pass_through";
pub const DROP: &str = "drop";
pub const CONSTANT_DELAY: &str = "constant_delay";
pub const RANDOM_DELAY: &str = "random_delay";
pub const RANDOM_FAIL: &str = "random_fail_plan";

const RANDOM_FAIL_ALIAS: &str = "random_fail";

const DELAY_SECONDS: &str = "delay_seconds";
const LOWER_DELAY_SECONDS: &str = "lower_delay_seconds";
const UPPER_DELAY_SECONDS: &str = "upper_delay_seconds";
const FAILURE_PROBABILITY: &str = "failure_probability";

/// Raw plan table as written in a config document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

impl PlanSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: BTreeMap::new(),
        }
    }

    /// Builder method: set a numeric parameter.
    pub fn with_param(mut self, name: &str, value: f64) -> Self {
        self.params.insert(name.to_string(), Value::from(value));
        self
    }

    fn number(&self, name: &'static str) -> ConfigResult<Option<f64>> {
        let invalid = |reason: String| ConfigError::InvalidParameter {
            plan: self.kind.clone(),
            parameter: name,
            reason,
        };

        match self.params.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(Some)
                .ok_or_else(|| invalid(format!("{n} is not representable as a float"))),
            // Numeric strings are accepted; the legacy JSON format often quotes them.
            Some(Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| invalid(format!("expected a number, got {s:?}"))),
            Some(other) => Err(invalid(format!("expected a number, got {other}"))),
        }
    }

    fn required(&self, name: &'static str) -> ConfigResult<f64> {
        self.number(name)?
            .ok_or_else(|| ConfigError::MissingParameter {
                plan: self.kind.clone(),
                parameter: name,
            })
    }

    fn seconds(&self, name: &'static str, value: f64) -> ConfigResult<Duration> {
        if !value.is_finite() || value < 0.0 {
            return Err(ConfigError::InvalidParameter {
                plan: self.kind.clone(),
                parameter: name,
                reason: format!("{value} is not a non-negative number of seconds"),
            });
        }
        Duration::try_from_secs_f64(value).map_err(|e| ConfigError::InvalidParameter {
            plan: self.kind.clone(),
            parameter: name,
            reason: e.to_string(),
        })
    }
}

/// The validated, closed set of traffic policies.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanKind {
    /// Forward every chunk immediately.
    PassThrough,
    /// Discard every chunk.
    Drop,
    /// Forward each chunk once `delay` has elapsed since it arrived.
    ConstantDelay { delay: Duration },
    /// Forward each chunk after a delay drawn uniformly from `[lower, upper]`.
    RandomDelay { lower: Duration, upper: Duration },
    /// Forward each chunk, then with `probability` sever the connection
    /// after waiting `wait`.
    RandomFail { probability: f64, wait: Duration },
}

impl PlanKind {
    /// Build a plan kind from its raw spec.
    ///
    /// Unknown extra parameters are ignored.
    pub fn from_spec(spec: &PlanSpec) -> ConfigResult<Self> {
        match spec.kind.as_str() {
            PASS_THROUGH => Ok(PlanKind::PassThrough),
            DROP => Ok(PlanKind::Drop),
            CONSTANT_DELAY => {
                let delay = spec.required(DELAY_SECONDS)?;
                Ok(PlanKind::ConstantDelay {
                    delay: spec.seconds(DELAY_SECONDS, delay)?,
                })
            }
            RANDOM_DELAY => {
                let lower = spec.required(LOWER_DELAY_SECONDS)?;
                let upper = spec.required(UPPER_DELAY_SECONDS)?;
                let lower = spec.seconds(LOWER_DELAY_SECONDS, lower)?;
                let upper = spec.seconds(UPPER_DELAY_SECONDS, upper)?;
                if lower > upper {
                    return Err(ConfigError::InvalidParameter {
                        plan: spec.kind.clone(),
                        parameter: UPPER_DELAY_SECONDS,
                        reason: format!(
                            "upper bound {upper:?} is below lower bound {lower:?}"
                        ),
                    });
                }
                Ok(PlanKind::RandomDelay { lower, upper })
            }
            RANDOM_FAIL | RANDOM_FAIL_ALIAS => {
                let probability = spec.required(FAILURE_PROBABILITY)?;
                if !(0.0..=1.0).contains(&probability) {
                    return Err(ConfigError::InvalidParameter {
                        plan: spec.kind.clone(),
                        parameter: FAILURE_PROBABILITY,
                        reason: format!("{probability} is outside [0, 1]"),
                    });
                }
                let wait = match spec.number(DELAY_SECONDS)? {
                    Some(secs) => spec.seconds(DELAY_SECONDS, secs)?,
                    None => Duration::ZERO,
                };
                Ok(PlanKind::RandomFail { probability, wait })
            }
            other => Err(ConfigError::UnknownPlan(other.to_string())),
        }
    }

    /// The config name of this variant.
    pub fn name(&self) -> &'static str {
        match self {
            PlanKind::PassThrough => PASS_THROUGH,
            PlanKind::Drop => DROP,
            PlanKind::ConstantDelay { .. } => CONSTANT_DELAY,
            PlanKind::RandomDelay { .. } => RANDOM_DELAY,
            PlanKind::RandomFail { .. } => RANDOM_FAIL,
        }
    }
}
