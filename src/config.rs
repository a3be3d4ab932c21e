//! Engine configuration, loaded from an optional JSON file.

use log::info;
use serde::Deserialize;
use std::path::Path;

use crate::error::{EngineError, Result};

/// Tunables for the resource core. Every field has a default so a partial JSON file works.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fixed capacity of the bindless texture array.
    pub max_bindless_textures: u32,
    /// How long an immediate submit may wait on its fence before the device is considered lost.
    pub fence_timeout_ms: u64,
    /// Number of per-frame scene descriptor sets.
    pub frames_in_flight: u32,
    /// Sets in the first descriptor pool of each growable allocator.
    pub descriptor_sets_per_pool: u32,
    pub validation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_bindless_textures: 1024,
            fence_timeout_ms: 10_000,
            frames_in_flight: 2,
            descriptor_sets_per_pool: 16,
            validation: cfg!(debug_assertions),
        }
    }
}

impl EngineConfig {
    /// Parse a config from JSON text and validate it.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(text)
            .map_err(|e| EngineError::Config(format!("Failed to parse config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                let config = Self::from_json(&text)?;
                info!("Loaded engine config from {:?}", path);
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_bindless_textures == 0 {
            return Err(EngineError::Config(
                "max_bindless_textures must be at least 1".to_string(),
            ));
        }
        if !(1..=4).contains(&self.frames_in_flight) {
            return Err(EngineError::Config(format!(
                "frames_in_flight must be between 1 and 4, got {}",
                self.frames_in_flight
            )));
        }
        if self.fence_timeout_ms == 0 {
            return Err(EngineError::Config("fence_timeout_ms must be non-zero".to_string()));
        }
        if self.descriptor_sets_per_pool == 0 {
            return Err(EngineError::Config(
                "descriptor_sets_per_pool must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fence_timeout_ns(&self) -> u64 {
        self.fence_timeout_ms.saturating_mul(1_000_000)
    }
}
