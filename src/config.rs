// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::sync::MAX_FRAMES_IN_FLIGHT;
use crate::streaming::DEFAULT_QUEUE_CAPACITY;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub streaming: StreamingConfig,
    pub shaders: ShaderConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Stream Renderer".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Graphics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    /// Fence / acquire timeout in milliseconds, 0 waits forever
    pub frame_timeout_ms: u64,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.1, 0.2, 0.8, 1.0],
            max_frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            frame_timeout_ms: 0,
        }
    }
}

impl GraphicsConfig {
    /// Timeout in nanoseconds as Vulkan expects it
    pub fn frame_timeout_ns(&self) -> u64 {
        if self.frame_timeout_ms == 0 {
            u64::MAX
        } else {
            u64::try_from(Duration::from_millis(self.frame_timeout_ms).as_nanos())
                .unwrap_or(u64::MAX)
        }
    }
}

/// Entity streaming settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Pending add/remove requests before producers are refused
    pub queue_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Compiled SPIR-V locations
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("shaders/triangle.vert.spv"),
            fragment: PathBuf::from("shaders/triangle.frag.spv"),
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "renderer.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validation only in debug builds, and only when enabled
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.streaming.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.graphics.max_frames_in_flight, MAX_FRAMES_IN_FLIGHT);
        assert_eq!(config.shaders.vertex, PathBuf::from("shaders/triangle.vert.spv"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [streaming]
            queue_capacity = 16

            [graphics]
            clear_color = [0.0, 0.0, 0.0, 1.0]
            frame_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.streaming.queue_capacity, 16);
        assert_eq!(config.graphics.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.graphics.frame_timeout_ns(), 250_000_000);
        assert_eq!(config.window.width, 1280);
    }

    #[test]
    fn zero_timeout_waits_forever() {
        assert_eq!(GraphicsConfig::default().frame_timeout_ns(), u64::MAX);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(Config::from_toml_str("[streaming]\nqueue_capacity = \"lots\"").is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load_from_path("no/such/config.toml").unwrap();
        assert_eq!(config.window.title, "Stream Renderer");
    }
}
