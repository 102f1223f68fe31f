//! Writable schema and mutation validation.
//!
//! Every mutation is resolved against a [`Schema`] before it reaches the
//! store. Resolution either yields exactly one `(path, value)` write or
//! rejects the request; nothing is silently dropped.
//!
//! ```text
//! {type:"fan",  index:0, state:true}   → fan        = true
//! {type:"leds", index:3, state:false}  → leds/3     = false
//! {type:"leds/3",        state:false}  → leds/3     = false
//! {type:"sensors/ldr",   state:true}   → sensors/ldr = true
//! {type:"leds", index:7, …}            → IndexOutOfRange
//! {type:"garage", …}                   → InvalidPath
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::path::StatePath;
use crate::tree::{DeviceState, Sensors, StateTree};

/// Name of the sensor subtree.
pub const SENSORS: &str = "sensors";

/// Shape of one device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceKind {
    /// Single boolean leaf
    Switch,
    /// Boolean slots `first_slot..slots`; lower slots are unused (null)
    Bank {
        slots: usize,
        #[serde(default = "default_first_slot")]
        first_slot: usize,
    },
}

fn default_first_slot() -> usize {
    1
}

/// Mutation errors. None of these are fatal to the hub.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MutationError {
    #[error("invalid path '{target}': {reason}")]
    InvalidPath { target: String, reason: String },

    #[error("index {index} out of range for '{target}' (valid {min}..={max})")]
    IndexOutOfRange {
        target: String,
        index: i64,
        min: usize,
        max: usize,
    },

    #[error("invalid value for '{target}': expected {expected}")]
    InvalidValue {
        target: String,
        expected: &'static str,
    },
}

/// Value carried by a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MutationValue {
    Bool(bool),
    Number(f64),
}

impl MutationValue {
    fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Number(_) => None,
        }
    }

    fn as_finite(&self) -> Option<f64> {
        match self {
            Self::Number(n) if n.is_finite() => Some(*n),
            _ => None,
        }
    }
}

/// A request to change one writable leaf or slot.
///
/// Wire envelope: `{"type": <target path>, "index": <optional>, "state": <value>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    #[serde(rename = "type", alias = "targetPath")]
    pub target_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,
    #[serde(rename = "state", alias = "value")]
    pub value: MutationValue,
}

impl MutationRequest {
    pub fn new(target_path: impl Into<String>, index: Option<i64>, value: MutationValue) -> Self {
        Self {
            target_path: target_path.into(),
            index,
            value,
        }
    }

    /// Shorthand for a boolean switch or slot.
    pub fn toggle(target_path: impl Into<String>, index: Option<i64>, on: bool) -> Self {
        Self::new(target_path, index, MutationValue::Bool(on))
    }
}

/// The single store write a valid mutation resolves to.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedWrite {
    pub path: StatePath,
    pub value: Value,
}

/// Writable schema: device classes plus the fixed sensor leaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schema {
    pub devices: BTreeMap<String, DeviceKind>,
}

impl Default for Schema {
    fn default() -> Self {
        let mut devices = BTreeMap::new();
        devices.insert("fan".to_string(), DeviceKind::Switch);
        devices.insert(
            "leds".to_string(),
            DeviceKind::Bank {
                slots: 5,
                first_slot: 1,
            },
        );
        Self { devices }
    }
}

impl Schema {
    /// Whether an inbound `type` tag names something this schema can write.
    pub fn is_target(&self, tag: &str) -> bool {
        match tag.trim_matches('/').split('/').next() {
            Some(SENSORS) => true,
            Some(head) => self.devices.contains_key(head),
            None => false,
        }
    }

    /// Resolve a mutation to exactly one store write.
    pub fn resolve(&self, req: &MutationRequest) -> Result<ResolvedWrite, MutationError> {
        let path = StatePath::parse(&req.target_path)
            .map_err(|e| invalid_path(req, e.to_string()))?;

        let Some((head, rest)) = path.segments().split_first() else {
            return Err(invalid_path(req, "the document root is not writable"));
        };

        if head == SENSORS {
            return resolve_sensor(req, rest);
        }

        let Some(kind) = self.devices.get(head) else {
            return Err(invalid_path(req, format!("unknown device class '{head}'")));
        };

        match (*kind, rest) {
            (DeviceKind::Switch, []) => {
                scalar_index(req)?;
                let on = req.value.as_bool().ok_or_else(|| invalid_value(req, "a boolean"))?;
                Ok(ResolvedWrite {
                    path: StatePath::root().child(head),
                    value: Value::Bool(on),
                })
            }
            (DeviceKind::Bank { slots, first_slot }, rest) => {
                let index = bank_index(req, rest)?;
                if index < first_slot as i64 || index >= slots as i64 {
                    return Err(MutationError::IndexOutOfRange {
                        target: req.target_path.clone(),
                        index,
                        min: first_slot,
                        max: slots.saturating_sub(1),
                    });
                }
                let on = req.value.as_bool().ok_or_else(|| invalid_value(req, "a boolean"))?;
                Ok(ResolvedWrite {
                    path: StatePath::root().child(head).child(index),
                    value: Value::Bool(on),
                })
            }
            (DeviceKind::Switch, _) => Err(invalid_path(req, "a switch has no children")),
        }
    }

    /// The document an empty store is seeded with.
    pub fn default_tree(&self) -> StateTree {
        let devices = self
            .devices
            .iter()
            .map(|(name, kind)| {
                let state = match *kind {
                    DeviceKind::Switch => DeviceState::Switch(false),
                    DeviceKind::Bank { slots, first_slot } => DeviceState::Bank(
                        (0..slots)
                            .map(|i| if i < first_slot { None } else { Some(false) })
                            .collect(),
                    ),
                };
                (name.clone(), state)
            })
            .collect();

        StateTree {
            sensors: Sensors {
                temperature: Some(0.0),
                humidity: Some(0.0),
                ldr: Some(false),
                timestamp: None,
            },
            devices,
        }
    }
}

fn resolve_sensor(req: &MutationRequest, rest: &[String]) -> Result<ResolvedWrite, MutationError> {
    let [leaf] = rest else {
        return Err(invalid_path(req, "expected sensors/<leaf>"));
    };
    scalar_index(req)?;

    let value = match leaf.as_str() {
        "temperature" | "humidity" => {
            let n = req.value.as_finite().ok_or_else(|| invalid_value(req, "a finite number"))?;
            serde_json::Number::from_f64(n)
                .map(Value::Number)
                .ok_or_else(|| invalid_value(req, "a finite number"))?
        }
        "ldr" => Value::Bool(req.value.as_bool().ok_or_else(|| invalid_value(req, "a boolean"))?),
        "timestamp" => return Err(invalid_path(req, "sensors/timestamp is server-assigned")),
        other => return Err(invalid_path(req, format!("unknown sensor '{other}'"))),
    };

    Ok(ResolvedWrite {
        path: StatePath::root().child(SENSORS).child(leaf),
        value,
    })
}

/// Leaves take no index; `0` is tolerated because clients send it for the fan.
fn scalar_index(req: &MutationRequest) -> Result<(), MutationError> {
    match req.index {
        None | Some(0) => Ok(()),
        Some(index) => Err(MutationError::IndexOutOfRange {
            target: req.target_path.clone(),
            index,
            min: 0,
            max: 0,
        }),
    }
}

/// Slot index from either the path (`leds/3`) or the `index` field.
fn bank_index(req: &MutationRequest, rest: &[String]) -> Result<i64, MutationError> {
    let from_path = match rest {
        [] => None,
        [segment] => Some(
            segment
                .parse::<i64>()
                .map_err(|_| invalid_path(req, format!("slot '{segment}' is not numeric")))?,
        ),
        _ => return Err(invalid_path(req, "a bank slot has no children")),
    };

    match (from_path, req.index) {
        (Some(a), Some(b)) if a != b => Err(invalid_path(req, "path slot and index disagree")),
        (Some(i), _) | (None, Some(i)) => Ok(i),
        (None, None) => Err(invalid_path(req, "a bank mutation needs an index")),
    }
}

fn invalid_path(req: &MutationRequest, reason: impl Into<String>) -> MutationError {
    MutationError::InvalidPath {
        target: req.target_path.clone(),
        reason: reason.into(),
    }
}

fn invalid_value(req: &MutationRequest, expected: &'static str) -> MutationError {
    MutationError::InvalidValue {
        target: req.target_path.clone(),
        expected,
    }
}
