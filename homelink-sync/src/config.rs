//! Bridge configuration (`homelink.toml`).
//!
//! ```toml
//! [server]
//! ws_addr = "0.0.0.0:5000"
//! http_addr = "0.0.0.0:5001"
//! heartbeat_interval_secs = 30
//! outbound_queue_capacity = 64
//!
//! [schema.devices.fan]
//! kind = "switch"
//!
//! [schema.devices.leds]
//! kind = "bank"
//! slots = 5
//! first_slot = 1
//!
//! [client]
//! url = "ws://127.0.0.1:5000"
//! history_capacity = 10
//!
//! [client.backoff]
//! kind = "exponential"
//! base_ms = 500
//! max_ms = 30000
//! multiplier = 2.0
//! jitter = true
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Every section is optional. Declaring any `[schema.devices.*]` table
//! replaces the default device set as a whole.

use homelink_core::Schema;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::client::ClientConfig;
use crate::hub::HubConfig;
use crate::server::ServerConfig;

/// Files searched by [`BridgeConfig::discover`], in order.
pub const CONFIG_CANDIDATES: [&str; 2] = ["homelink.toml", "config/homelink.toml"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `env_logger` filter; `RUST_LOG` takes precedence
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub schema: Schema,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// Load configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// First existing file among [`CONFIG_CANDIDATES`].
    pub fn discover() -> Option<PathBuf> {
        CONFIG_CANDIDATES
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            schema: self.schema.clone(),
            outbound_queue_capacity: self.server.outbound_queue_capacity,
        }
    }
}
