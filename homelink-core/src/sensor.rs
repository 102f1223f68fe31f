//! Sensor ingestion payloads and the server timestamp clock.
//!
//! Producers send bare readings; the hub stamps them with a server time that
//! never goes backwards, so observers can order readings regardless of the
//! producer's own clock.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::schema::MutationError;

/// A reading as sent by the ingestion producer. Any timestamp the producer
/// includes is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub temperature: f64,
    pub humidity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldr: Option<bool>,
}

impl SensorReading {
    pub fn new(temperature: f64, humidity: f64) -> Self {
        Self {
            temperature,
            humidity,
            ldr: None,
        }
    }

    /// Reject NaN and infinities before they reach the store.
    pub fn validate(&self) -> Result<(), MutationError> {
        for (name, value) in [("temperature", self.temperature), ("humidity", self.humidity)] {
            if !value.is_finite() {
                return Err(MutationError::InvalidValue {
                    target: format!("sensors/{name}"),
                    expected: "a finite number",
                });
            }
        }
        Ok(())
    }

    /// Attach the server timestamp.
    pub fn stamp(self, timestamp: u64) -> SensorRecord {
        SensorRecord {
            temperature: self.temperature,
            humidity: self.humidity,
            ldr: self.ldr,
            timestamp,
        }
    }
}

/// The `sensors` subtree exactly as one ingestion write stores it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    pub temperature: f64,
    pub humidity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldr: Option<bool>,
    pub timestamp: u64,
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// No timestamp above the last one is representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("server clock exhausted after timestamp {last}")]
pub struct ClockExhausted {
    pub last: u64,
}

/// Strictly increasing millisecond clock.
///
/// Each `stamp` returns `max(now, last + 1)`, so two readings in the same
/// millisecond, or a wall clock stepping backwards, still yield increasing
/// timestamps.
pub struct ServerClock {
    last: AtomicU64,
    source: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerClock {
    /// Clock backed by the system wall clock.
    pub fn new() -> Self {
        Self::with_source(epoch_millis)
    }

    /// Clock backed by an arbitrary millisecond source (tests).
    pub fn with_source(source: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self {
            last: AtomicU64::new(0),
            source: Box::new(source),
        }
    }

    /// Next timestamp. Fails once the last one issued or observed is
    /// `u64::MAX`.
    pub fn stamp(&self) -> Result<u64, ClockExhausted> {
        let now = (self.source)();
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let floor = prev.checked_add(1).ok_or(ClockExhausted { last: prev })?;
            let next = now.max(floor);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(next),
                Err(actual) => prev = actual,
            }
        }
    }

    /// Make sure future stamps exceed a timestamp already persisted.
    pub fn observe(&self, timestamp: u64) {
        self.last.fetch_max(timestamp, Ordering::AcqRel);
    }

    /// Last issued (or observed) timestamp.
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_stamp_is_strictly_increasing_on_frozen_clock() {
        let clock = ServerClock::with_source(|| 1_000);
        let a = clock.stamp().unwrap();
        let b = clock.stamp().unwrap();
        let c = clock.stamp().unwrap();
        assert_eq!(a, 1_000);
        assert!(b > a && c > b);
    }

    #[test]
    fn test_stamp_survives_clock_going_backwards() {
        let now = Arc::new(AtomicU64::new(5_000));
        let source = now.clone();
        let clock = ServerClock::with_source(move || source.load(Ordering::SeqCst));

        let first = clock.stamp().unwrap();
        now.store(4_000, Ordering::SeqCst);
        let second = clock.stamp().unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_observe_persisted_timestamp() {
        let clock = ServerClock::with_source(|| 10);
        clock.observe(500);
        assert_eq!(clock.stamp(), Ok(501));
        clock.observe(100);
        assert_eq!(clock.last(), 501);
    }

    #[test]
    fn test_stamp_refuses_to_wrap_past_max() {
        let clock = ServerClock::with_source(|| 10);
        clock.observe(u64::MAX - 1);
        assert_eq!(clock.stamp(), Ok(u64::MAX));
        assert_eq!(clock.stamp(), Err(ClockExhausted { last: u64::MAX }));
        assert_eq!(clock.last(), u64::MAX);

        let clock = ServerClock::with_source(|| 10);
        clock.observe(u64::MAX);
        assert!(clock.stamp().is_err());
    }

    #[test]
    fn test_stamp_concurrent_unique() {
        let clock = Arc::new(ServerClock::with_source(|| 42));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                std::thread::spawn(move || (0..250).map(|_| clock.stamp().unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1_000);
    }

    #[test]
    fn test_reading_ignores_sender_timestamp() {
        let reading: SensorReading = serde_json::from_str(
            r#"{"temperature": 24.5, "humidity": 60.0, "timestamp": 99}"#,
        )
        .unwrap();
        let record = reading.stamp(1234);
        assert_eq!(record.timestamp, 1234);
        assert_eq!(record.ldr, None);
    }

    #[test]
    fn test_validate_rejects_non_finite() {
        assert!(SensorReading::new(20.0, 50.0).validate().is_ok());
        assert!(SensorReading::new(f64::NAN, 50.0).validate().is_err());
        assert!(SensorReading::new(20.0, f64::INFINITY).validate().is_err());
    }

    #[test]
    fn test_record_serializes_without_ldr() {
        let json = serde_json::to_value(SensorReading::new(1.0, 2.0).stamp(3)).unwrap();
        assert_eq!(json, serde_json::json!({"temperature": 1.0, "humidity": 2.0, "timestamp": 3}));
    }
}
