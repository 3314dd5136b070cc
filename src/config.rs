//! Server configuration for the node graph core.

use crate::error::ConfigError;
use crate::event::EVENT_QUEUE_CAPACITY;
use crate::pool::{DEFAULT_POOL_CAPACITY, MIN_BLOCK_SIZE};
use serde::Deserialize;
use std::path::Path;

/// Tunables read once at startup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bytes available to the node pool.
    pub pool_capacity: usize,
    /// Slots in the node event queue.
    pub event_queue_capacity: usize,
    /// Sample rate of the built-in `sine` prototype every graph registers.
    pub sample_rate: f32,
    /// Most live nodes, root group included. Node slots, the registry and the
    /// render walk are sized for this many nodes at startup.
    pub max_nodes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            event_queue_capacity: EVENT_QUEUE_CAPACITY,
            sample_rate: 44100.0,
            max_nodes: 1024,
        }
    }
}

impl ServerConfig {
    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_capacity < MIN_BLOCK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "pool_capacity must be at least {} bytes, got {}",
                MIN_BLOCK_SIZE, self.pool_capacity
            )));
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_queue_capacity must be positive".to_string(),
            ));
        }
        if self.max_nodes == 0 {
            return Err(ConfigError::Invalid(
                "max_nodes must leave room for the root group".to_string(),
            ));
        }
        if !(self.sample_rate > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "sample_rate must be positive, got {}",
                self.sample_rate
            )));
        }
        Ok(())
    }
}
