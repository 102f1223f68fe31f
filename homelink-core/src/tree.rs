//! Typed view of the state document.
//!
//! The document is stored as plain JSON in the state store. Observers
//! deserialize each snapshot into a [`StateTree`]; device classes are
//! flattened into the top level next to `sensors`:
//!
//! ```json
//! { "fan": false,
//!   "leds": [null, false, true, false, false],
//!   "sensors": { "temperature": 24.5, "humidity": 60.0, "ldr": false, "timestamp": 1718000000000 } }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// State of one device class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceState {
    /// A single on/off device (e.g. the fan)
    Switch(bool),
    /// An ordered bank of slots; `None` marks an unused slot
    Bank(Vec<Option<bool>>),
    /// Anything the schema does not describe; carried through untouched
    Opaque(Value),
}

/// Sensor subtree. Every field is optional so that partially seeded
/// documents still parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sensors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldr: Option<bool>,
    /// Server-assigned, milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl Sensors {
    /// Whether the tracked metrics or the server timestamp differ.
    ///
    /// `ldr` is not a tracked metric and is ignored here.
    pub fn reading_differs(&self, other: &Sensors) -> bool {
        self.temperature != other.temperature
            || self.humidity != other.humidity
            || self.timestamp != other.timestamp
    }
}

/// Snapshot of the whole state document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateTree {
    #[serde(default)]
    pub sensors: Sensors,
    /// Device classes keyed by name (`fan`, `leds`, …)
    #[serde(flatten)]
    pub devices: BTreeMap<String, DeviceState>,
}

impl StateTree {
    /// Parse a snapshot value. `null` is rejected: an empty document is
    /// sent as `{}`.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Value of a switch device, `None` if absent or not a switch.
    pub fn switch(&self, name: &str) -> Option<bool> {
        match self.devices.get(name) {
            Some(DeviceState::Switch(on)) => Some(*on),
            _ => None,
        }
    }

    /// Value of one bank slot, `None` if absent, unused, or not a bank.
    pub fn slot(&self, name: &str, index: usize) -> Option<bool> {
        match self.devices.get(name) {
            Some(DeviceState::Bank(slots)) => slots.get(index).copied().flatten(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_persisted_layout() {
        let tree = StateTree::from_value(json!({
            "fan": true,
            "leds": [null, false, true, false, false],
            "sensors": { "temperature": 24.5, "humidity": 60.0, "ldr": false, "timestamp": 17 }
        }))
        .unwrap();

        assert_eq!(tree.switch("fan"), Some(true));
        assert_eq!(tree.slot("leds", 0), None);
        assert_eq!(tree.slot("leds", 2), Some(true));
        assert_eq!(tree.slot("leds", 9), None);
        assert_eq!(tree.sensors.temperature, Some(24.5));
        assert_eq!(tree.sensors.timestamp, Some(17));
    }

    #[test]
    fn test_empty_document() {
        let tree = StateTree::from_value(json!({})).unwrap();
        assert!(tree.devices.is_empty());
        assert_eq!(tree.sensors, Sensors::default());
        assert!(StateTree::from_value(Value::Null).is_err());
    }

    #[test]
    fn test_unknown_keys_are_opaque() {
        let tree = StateTree::from_value(json!({
            "fan": false,
            "controls": { "fan": false }
        }))
        .unwrap();
        assert!(matches!(tree.devices.get("controls"), Some(DeviceState::Opaque(_))));
        assert_eq!(tree.switch("controls"), None);
    }

    #[test]
    fn test_value_roundtrip_keeps_layout() {
        let value = json!({
            "fan": false,
            "leds": [null, true],
            "sensors": { "temperature": 1.5 }
        });
        let tree = StateTree::from_value(value.clone()).unwrap();
        assert_eq!(tree.to_value(), value);
    }

    #[test]
    fn test_reading_differs_ignores_ldr() {
        let a = Sensors { temperature: Some(20.0), humidity: Some(40.0), ldr: Some(true), timestamp: Some(1) };
        let mut b = a.clone();
        b.ldr = Some(false);
        assert!(!a.reading_differs(&b));
        b.timestamp = Some(2);
        assert!(a.reading_differs(&b));
    }
}
