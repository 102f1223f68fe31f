//! # homelink-core: data model for the home state bridge
//!
//! Pure types with no I/O. Everything that crosses the wire or lands in the
//! state store is defined here:
//!
//! - [`path`]: slash-separated paths into the state document
//! - [`tree`]: typed view of the document (`StateTree`)
//! - [`schema`]: which paths are writable, and mutation validation
//! - [`sensor`]: sensor readings and the server-side timestamp clock
//! - [`history`]: bounded per-metric sample ring
//!
//! ```text
//! MutationRequest ──► Schema::resolve ──► ResolvedWrite { path, value }
//! SensorReading   ──► ServerClock     ──► SensorRecord  (sensors subtree)
//! snapshot JSON   ──► StateTree       ──► HistoryBuffer
//! ```

pub mod path;
pub mod tree;
pub mod schema;
pub mod sensor;
pub mod history;

pub use path::{PathError, StatePath};
pub use tree::{DeviceState, Sensors, StateTree};
pub use schema::{
    DeviceKind, MutationError, MutationRequest, MutationValue, ResolvedWrite, Schema,
};
pub use sensor::{ClockExhausted, SensorReading, SensorRecord, ServerClock};
pub use history::{HistoryBuffer, HistorySample, Metric, HISTORY_CAPACITY};
