// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every field has a default, so a missing or partial config.toml still
// produces a runnable setup.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub shaders: ShaderConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan".to_string(),
            width: 800,
            height: 600,
            resizable: true,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Preferred present mode; FIFO is used when the surface lacks it
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Bound on fence waits and image acquisition. `None` waits forever.
    pub frame_timeout_ms: Option<u64>,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            frame_timeout_ms: None,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
        }
    }
}

/// Precompiled SPIR-V locations
#[derive(Debug, Deserialize)]
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

/// How the configuration was obtained. Loading happens before logging is
/// set up, so the outcome is kept and logged afterwards.
#[derive(Debug)]
pub enum LoadReport {
    Loaded(PathBuf),
    NotFound(PathBuf),
    /// Unreadable or malformed; defaults are in use
    Failed(anyhow::Error),
}

impl LoadReport {
    pub fn log(&self) {
        match self {
            LoadReport::Loaded(path) => log::info!("Loaded configuration from {:?}", path),
            LoadReport::NotFound(path) => {
                log::info!("Config file not found at {:?}, using defaults", path)
            }
            LoadReport::Failed(e) => log::warn!("Failed to load config: {:#}. Using defaults.", e),
        }
    }
}

impl Config {
    /// Load `config.toml` from the working directory
    pub fn load() -> (Self, LoadReport) {
        Self::load_with_report("config.toml")
    }

    /// Load from `path`, falling back to defaults when it is missing or broken
    pub fn load_with_report<P: AsRef<Path>>(path: P) -> (Self, LoadReport) {
        let path = path.as_ref();

        if !path.exists() {
            return (Config::default(), LoadReport::NotFound(path.to_path_buf()));
        }

        match Self::load_from_path(path) {
            Ok(config) => (config, LoadReport::Loaded(path.to_path_buf())),
            Err(e) => (Config::default(), LoadReport::Failed(e)),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Preferred present mode as a Vulkan enum
    pub fn preferred_present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::MAILBOX
            }
        }
    }

    /// Validation is only ever enabled in debug builds
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }

    /// Timeout in nanoseconds for the frame loop's blocking calls
    pub fn frame_timeout_ns(&self) -> u64 {
        self.graphics
            .frame_timeout_ms
            .map_or(u64::MAX, |ms| ms.saturating_mul(1_000_000))
    }
}
