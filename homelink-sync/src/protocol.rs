//! JSON wire protocol between the hub and its observers.
//!
//! Inbound messages are discriminated by an explicit `type` tag:
//! ```text
//! {"type":"sensor", "temperature":24.5, "humidity":60.0, "ldr":false}   → ingestion
//! {"type":"leds", "index":3, "state":true}                              → mutation
//! {"type":"doorbell", ...}                                              → ignored
//! ```
//!
//! Outbound messages are always a full snapshot of the state document.

use homelink_core::{MutationRequest, Schema, SensorReading, StateTree};
use serde_json::Value;
use std::sync::Arc;

/// Tag reserved for sensor ingestion.
pub const SENSOR_TAG: &str = "sensor";

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("transport error: {0}")]
    Transport(String),
}

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Raw reading to stamp and store
    Sensor(SensorReading),
    /// Change to one writable leaf or slot
    Mutation(MutationRequest),
    /// Well-formed, but the tag names nothing we handle
    Unrecognized(String),
}

impl InboundMessage {
    /// Classify an inbound text frame.
    ///
    /// The tag is inspected before the body is deserialized, so a sensor
    /// payload can never be mistaken for a mutation or the other way round.
    pub fn parse(text: &str, schema: &Schema) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let tag = match value.get("type") {
            Some(Value::String(tag)) => tag.clone(),
            Some(_) => return Err(ProtocolError::Malformed("'type' must be a string".into())),
            None => return Err(ProtocolError::Malformed("missing 'type' tag".into())),
        };

        if tag == SENSOR_TAG {
            let reading: SensorReading = serde_json::from_value(value)
                .map_err(|e| ProtocolError::Malformed(format!("sensor payload: {e}")))?;
            return Ok(Self::Sensor(reading));
        }

        if !schema.is_target(&tag) {
            return Ok(Self::Unrecognized(tag));
        }

        let request: MutationRequest = serde_json::from_value(value)
            .map_err(|e| ProtocolError::Malformed(format!("mutation envelope: {e}")))?;
        Ok(Self::Mutation(request))
    }
}

/// Serialize a snapshot frame.
pub fn encode_snapshot(value: &Value) -> Result<Arc<str>, ProtocolError> {
    serde_json::to_string(value)
        .map(Arc::from)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Parse an outbound snapshot on the observer side.
pub fn decode_snapshot(text: &str) -> Result<StateTree, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use homelink_core::MutationValue;
    use serde_json::json;

    #[test]
    fn test_parse_sensor_message() {
        let msg = InboundMessage::parse(
            r#"{"type":"sensor","temperature":24.5,"humidity":60.0}"#,
            &Schema::default(),
        )
        .unwrap();
        assert_eq!(msg, InboundMessage::Sensor(SensorReading::new(24.5, 60.0)));
    }

    #[test]
    fn test_sensor_timestamp_from_producer_is_ignored() {
        let msg = InboundMessage::parse(
            r#"{"type":"sensor","temperature":20.0,"humidity":50.0,"ldr":true,"timestamp":1}"#,
            &Schema::default(),
        )
        .unwrap();
        let InboundMessage::Sensor(reading) = msg else {
            panic!("expected a sensor message");
        };
        assert_eq!(reading.ldr, Some(true));
    }

    #[test]
    fn test_parse_mutation_envelope() {
        let msg = InboundMessage::parse(
            r#"{"type":"leds","index":3,"state":true}"#,
            &Schema::default(),
        )
        .unwrap();
        assert_eq!(
            msg,
            InboundMessage::Mutation(MutationRequest::toggle("leds", Some(3), true))
        );

        let msg = InboundMessage::parse(r#"{"type":"sensors/temperature","state":21.5}"#, &Schema::default())
            .unwrap();
        assert_eq!(
            msg,
            InboundMessage::Mutation(MutationRequest::new(
                "sensors/temperature",
                None,
                MutationValue::Number(21.5)
            ))
        );
    }

    #[test]
    fn test_unknown_tag_is_unrecognized() {
        let msg = InboundMessage::parse(r#"{"type":"doorbell","ring":true}"#, &Schema::default())
            .unwrap();
        assert_eq!(msg, InboundMessage::Unrecognized("doorbell".into()));
    }

    #[test]
    fn test_malformed_inputs() {
        let schema = Schema::default();
        for raw in [
            "not json",
            r#"{"temperature":1.0}"#,
            r#"{"type":5}"#,
            r#"{"type":"sensor","temperature":"hot"}"#,
            r#"{"type":"fan"}"#,
        ] {
            assert!(
                matches!(InboundMessage::parse(raw, &schema), Err(ProtocolError::Malformed(_))),
                "{raw} should be malformed"
            );
        }
    }

    #[test]
    fn test_snapshot_encode_decode() {
        let value = json!({"fan": true, "leds": [null, false, true, false, false]});
        let text = encode_snapshot(&value).unwrap();
        let tree = decode_snapshot(&text).unwrap();
        assert_eq!(tree.switch("fan"), Some(true));
        assert_eq!(tree.slot("leds", 2), Some(true));
        assert!(decode_snapshot("[1,2]").is_err());
    }
}
