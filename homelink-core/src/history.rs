//! Bounded rolling history of sensor metrics.
//!
//! One FIFO ring per metric. Appends beyond the capacity evict the oldest
//! sample first, so each ring always holds the most recent `capacity`
//! samples in insertion order.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::tree::Sensors;

/// Samples retained per metric.
pub const HISTORY_CAPACITY: usize = 10;

/// Tracked metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Temperature,
    Humidity,
}

impl Metric {
    pub const ALL: [Metric; 2] = [Metric::Temperature, Metric::Humidity];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
        }
    }

    /// Read this metric from a sensor subtree.
    pub fn read(&self, sensors: &Sensors) -> Option<f64> {
        match self {
            Self::Temperature => sensors.temperature,
            Self::Humidity => sensors.humidity,
        }
    }

    fn slot(&self) -> usize {
        match self {
            Self::Temperature => 0,
            Self::Humidity => 1,
        }
    }
}

/// One timestamped value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistorySample {
    pub metric: Metric,
    pub value: f64,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

/// Fixed-capacity per-metric ring.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    capacity: usize,
    series: [VecDeque<HistorySample>; 2],
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            series: [
                VecDeque::with_capacity(capacity),
                VecDeque::with_capacity(capacity),
            ],
        }
    }

    /// Append a sample, returning the evicted one if the ring was full.
    /// A zero-capacity buffer keeps nothing.
    pub fn push(&mut self, sample: HistorySample) -> Option<HistorySample> {
        if self.capacity == 0 {
            return None;
        }
        let ring = &mut self.series[sample.metric.slot()];
        let evicted = if ring.len() >= self.capacity {
            ring.pop_front()
        } else {
            None
        };
        ring.push_back(sample);
        evicted
    }

    /// Append one sample per metric present in `sensors`.
    ///
    /// Uses the server timestamp when the subtree carries one, otherwise
    /// `received_at`. Returns the number of samples appended.
    pub fn record(&mut self, sensors: &Sensors, received_at: u64) -> usize {
        if self.capacity == 0 {
            return 0;
        }
        let timestamp = sensors.timestamp.unwrap_or(received_at);
        let mut appended = 0;
        for metric in Metric::ALL {
            if let Some(value) = metric.read(sensors) {
                if self.push(HistorySample { metric, value, timestamp }).is_some() {
                    log::trace!("history: evicted oldest {} sample", metric.name());
                }
                appended += 1;
            }
        }
        appended
    }

    /// Samples for one metric, oldest first.
    pub fn samples(&self, metric: Metric) -> impl Iterator<Item = &HistorySample> + '_ {
        self.series[metric.slot()].iter()
    }

    /// Just the values for one metric, oldest first.
    pub fn values(&self, metric: Metric) -> Vec<f64> {
        self.samples(metric).map(|s| s.value).collect()
    }

    pub fn latest(&self, metric: Metric) -> Option<&HistorySample> {
        self.series[metric.slot()].back()
    }

    pub fn len(&self, metric: Metric) -> usize {
        self.series[metric.slot()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.iter().all(VecDeque::is_empty)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        for ring in &mut self.series {
            ring.clear();
        }
    }
}
