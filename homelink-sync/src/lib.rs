//! # homelink-sync: realtime bridge between the state store and observers
//!
//! ## Architecture
//!
//! ```text
//!  sensor producer ─┐                                  ┌─► observer A (ReconnectingClient)
//!  control API ─────┼─► Hub ──write──► StateStore ──┐  ├─► observer B
//!  observer frames ─┘    ▲                          │  └─► observer C
//!                        └── subscription per connection ─┘
//! ```
//!
//! The store is the only source of truth. The hub validates mutations,
//! stamps sensor readings, and forwards every store change to every
//! connection as a full snapshot, in store order.
//!
//! ## Modules
//!
//! - [`store`]: `StateStore` contract and the in-memory store
//! - [`protocol`]: JSON wire messages
//! - [`connection`]: per-observer outbox and liveness
//! - [`hub`]: mutation, ingestion and fan-out
//! - [`server`]: WebSocket server
//! - [`control`]: HTTP control API
//! - [`client`]: reconnecting observer with history
//! - [`backoff`]: reconnect delay policies
//! - [`config`]: TOML configuration
//! - [`error`]: bridge error taxonomy

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod hub;
pub mod protocol;
mod registry;
pub mod server;
pub mod store;

pub use backoff::{BackoffConfig, BackoffPolicy, ConstantBackoff, ExponentialBackoff};
pub use client::{
    ClientConfig, ClientEvent, ConnectionState, Connector, InboundStream, ReconnectingClient,
    SyncState, WsConnector,
};
pub use config::{BridgeConfig, ConfigError, LoggingConfig};
pub use connection::{Connection, ConnectionId, ConnectionInfo};
pub use error::BridgeError;
pub use hub::{Hub, HubConfig, HubStats, InboundOutcome, MutationAck};
pub use protocol::{InboundMessage, ProtocolError, SENSOR_TAG};
pub use server::{ServerConfig, SyncServer};
pub use store::{DynStore, MemoryStore, StateStore, StoreError, Subscription, Versioned};
