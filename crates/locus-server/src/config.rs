//! Server configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use locus_common::constants::DEFAULT_RESOLUTION;
use locus_common::{LocusError, LocusResult};

/// Configuration for a Locus server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Peers to register with at startup. With no peers the server
    /// assumes control of the whole curve.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Curve resolution (even, at most 104).
    #[serde(default = "default_resolution")]
    pub resolution: u8,
}

fn default_listen() -> String {
    "[::]:7777".to_string()
}

fn default_resolution() -> u8 {
    DEFAULT_RESOLUTION
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            peers: Vec::new(),
            resolution: default_resolution(),
        }
    }
}

impl ServerConfig {
    /// Loads a configuration from a TOML file.
    pub fn from_file(path: &Path) -> LocusResult<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| LocusError::invalid_argument(format!("invalid config: {e}")))
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> LocusResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| LocusError::invalid_argument(format!("unserializable config: {e}")))
    }
}
