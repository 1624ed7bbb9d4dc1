// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub instance: InstanceConfig,
    pub device: DeviceConfig,
    pub filter: FilterConfig,
    pub logging: LoggingConfig,
}

/// Instance settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InstanceConfig {
    pub app_name: String,
    /// "major.minor", e.g. "1.1"
    pub api_version: String,
    pub validation_layers: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            app_name: "vkcompute".to_string(),
            api_version: "1.1".to_string(),
            validation_layers: true,
        }
    }
}

/// Device selection and creation settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceConfig {
    pub extensions: Vec<String>,
    /// Require storageBuffer8BitAccess and shaderInt8
    pub require_int8: bool,
    pub fence_timeout_ns: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            extensions: vec![
                "VK_KHR_storage_buffer_storage_class".to_string(),
                "VK_KHR_8bit_storage".to_string(),
                "VK_KHR_shader_float16_int8".to_string(),
            ],
            require_int8: true,
            fence_timeout_ns: 100_000_000_000,
        }
    }
}

/// Gaussian filter settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FilterConfig {
    pub shader_path: PathBuf,
    pub entry_point: String,
    pub sigma: f32,
    pub device_id: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            shader_path: PathBuf::from("shaders/gaussian_filter.comp.spv"),
            entry_point: "main".to_string(),
            sigma: 10.0,
            device_id: 0,
        }
    }
}

/// Logging settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    pub log_file: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: false,
            log_file: PathBuf::from("vkcompute.log"),
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
        let (config, source) = Self::read(path)?;
        log::info!("{}", source);
        log::debug!("Config: {:?}", config);
        Ok(config)
    }

    /// Like `load_from_path` but silent, for callers that set up logging
    /// from the result and report `ConfigSource` afterwards
    pub fn read<P: AsRef<Path>>(path: P) -> Result<(Self, ConfigSource)> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok((Config::default(), ConfigSource::Defaults(path.to_path_buf())));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok((config, ConfigSource::File(path.to_path_buf())))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.instance.vk_api_version()?;
        Ok(config)
    }
}

/// Where a configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Nothing at this path
    Defaults(PathBuf),
    File(PathBuf),
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Defaults(path) => {
                write!(f, "Config file not found at {:?}, using defaults", path)
            }
            ConfigSource::File(path) => write!(f, "Loaded configuration from {:?}", path),
        }
    }
}

impl InstanceConfig {
    /// Requested API version as a Vulkan packed version
    pub fn vk_api_version(&self) -> Result<u32> {
        let (major, minor) = self
            .api_version
            .trim()
            .split_once('.')
            .with_context(|| format!("Expected \"major.minor\", got {:?}", self.api_version))?;
        let major: u32 = major.parse().context("Invalid major version")?;
        let minor: u32 = minor.parse().context("Invalid minor version")?;
        if major != 1 {
            anyhow::bail!("Unsupported Vulkan major version {}", major);
        }
        Ok(vk::make_api_version(0, major, minor, 0))
    }
}

impl LoggingConfig {
    /// Get the level as a log filter
    pub fn level_filter(&self) -> log::LevelFilter {
        self.parse_level().unwrap_or_else(|| {
            log::warn!("Unknown log level '{}', defaulting to info", self.level);
            log::LevelFilter::Info
        })
    }

    /// `None` for an unknown level name
    pub fn parse_level(&self) -> Option<log::LevelFilter> {
        self.level.parse().ok()
    }
}
