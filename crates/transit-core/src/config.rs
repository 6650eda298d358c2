//! Transfer configuration types.

use std::path::Path;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::TransferError;

/// Configuration for transfer operations.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
#[serde(default)]
pub struct TransferConfig {
    /// Ask for confirmation before copying.
    #[builder(default = "true")]
    pub confirm_copy: bool,

    /// Ask for confirmation before moving.
    #[builder(default = "true")]
    pub confirm_move: bool,

    /// Ask for confirmation before deleting.
    #[builder(default = "true")]
    pub confirm_delete: bool,

    /// Size of each streamed chunk in bytes.
    #[builder(default = "DEFAULT_CHUNK_SIZE")]
    pub chunk_size: usize,

    /// Materialized content up to this size stays in memory.
    #[builder(default = "DEFAULT_MEMORY_MATERIALIZE_LIMIT")]
    pub memory_materialize_limit: u64,

    /// Bound of the worker-to-control event channel.
    #[builder(default = "DEFAULT_EVENT_CHANNEL_SIZE")]
    pub event_channel_size: usize,
}

const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
const DEFAULT_MEMORY_MATERIALIZE_LIMIT: u64 = 64 * 1024 * 1024;
const DEFAULT_EVENT_CHANNEL_SIZE: usize = 100;

impl TransferConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.chunk_size == Some(0) {
            return Err("Chunk size must be greater than zero".to_string());
        }
        if self.event_channel_size == Some(0) {
            return Err("Event channel size must be greater than zero".to_string());
        }
        Ok(())
    }
}

impl TransferConfig {
    /// Create a new config builder.
    pub fn builder() -> TransferConfigBuilder {
        TransferConfigBuilder::default()
    }

    /// A config that never asks for confirmation.
    pub fn unattended() -> Self {
        Self {
            confirm_copy: false,
            confirm_move: false,
            confirm_delete: false,
            ..Self::default()
        }
    }

    /// Parse a config from TOML. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, TransferError> {
        let config: Self = toml::from_str(text)
            .map_err(|e| TransferError::invalid_request(format!("Invalid config: {e}")))?;
        if config.chunk_size == 0 || config.event_channel_size == 0 {
            return Err(TransferError::invalid_request(
                "Invalid config: sizes must be greater than zero",
            ));
        }
        Ok(config)
    }

    /// Load a config from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| TransferError::io(path.display().to_string(), e))?;
        Self::from_toml_str(&text)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            confirm_copy: true,
            confirm_move: true,
            confirm_delete: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            memory_materialize_limit: DEFAULT_MEMORY_MATERIALIZE_LIMIT,
            event_channel_size: DEFAULT_EVENT_CHANNEL_SIZE,
        }
    }
}
