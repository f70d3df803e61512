//! Offload configuration with TOML, environment variable, and default
//! config sources.

use std::path::{Path, PathBuf};
use std::{env, fs};

use serde::{Deserialize, Serialize};

use crate::driver::{DeviceTypeSetting, QueueProperties};
use crate::loader::FileSourceStore;
use crate::resolver::DeviceSelection;

// ── Errors ──────────────────────────────────────────────────────────

/// Errors produced by configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid environment variable value for {key}: {value}")]
    InvalidEnvVar { key: String, value: String },
}

pub const ENV_PLATFORM_INDEX: &str = "CL_OFFLOAD_PLATFORM_INDEX";
pub const ENV_DEVICE_TYPE: &str = "CL_OFFLOAD_DEVICE_TYPE";
pub const ENV_DEVICE_INDEX: &str = "CL_OFFLOAD_DEVICE_INDEX";
pub const ENV_PROFILING: &str = "CL_OFFLOAD_PROFILING";
pub const ENV_KERNEL_DIR: &str = "CL_OFFLOAD_KERNEL_DIR";
pub const ENV_KERNEL_SUFFIX: &str = "CL_OFFLOAD_KERNEL_SUFFIX";
pub const ENV_BUILD_OPTIONS: &str = "CL_OFFLOAD_BUILD_OPTIONS";

// ── TOML wrapper ────────────────────────────────────────────────────

/// Wrapper used for the `[offload]` table in TOML files.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TomlWrapper {
    offload: OffloadConfig,
}

// ── OffloadConfig ───────────────────────────────────────────────────

/// Device selection, queue and kernel-source settings for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    pub platform_index: usize,
    pub device_type: DeviceTypeSetting,
    pub device_index: usize,
    pub enable_profiling: bool,
    /// Directory searched for `<kernel_name><kernel_suffix>`.
    pub kernel_dir: PathBuf,
    pub kernel_suffix: String,
    /// Passed verbatim to the driver's program build step.
    pub build_options: String,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            platform_index: 0,
            device_type: DeviceTypeSetting::All,
            device_index: 0,
            enable_profiling: true,
            kernel_dir: PathBuf::from("."),
            kernel_suffix: ".cl".to_string(),
            build_options: String::new(),
        }
    }
}

impl OffloadConfig {
    // ── Constructors ────────────────────────────────────────────

    /// Load configuration from a TOML file at `path`.
    ///
    /// The file is expected to contain an `[offload]` table. If the file
    /// does not exist, returns `Ok(Self::default())`.
    pub fn from_toml(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found; using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        let wrapper: TomlWrapper = toml::from_str(&text)?;
        Ok(wrapper.offload)
    }

    /// Serialize to a TOML string (wrapped in `[offload]`).
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let wrapper = TomlWrapper { offload: self.clone() };
        Ok(toml::to_string_pretty(&wrapper)?)
    }

    /// Build a config from `CL_OFFLOAD_*` environment variables on top of
    /// `Self::default()`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Ok(v) = env::var(ENV_PLATFORM_INDEX) {
            cfg.platform_index = Self::parse_env_usize(ENV_PLATFORM_INDEX, &v)?;
        }
        if let Ok(v) = env::var(ENV_DEVICE_TYPE) {
            cfg.device_type = v.parse().map_err(|_| ConfigError::InvalidEnvVar {
                key: ENV_DEVICE_TYPE.to_string(),
                value: v.clone(),
            })?;
        }
        if let Ok(v) = env::var(ENV_DEVICE_INDEX) {
            cfg.device_index = Self::parse_env_usize(ENV_DEVICE_INDEX, &v)?;
        }
        if let Ok(v) = env::var(ENV_PROFILING) {
            cfg.enable_profiling = Self::parse_env_bool(ENV_PROFILING, &v)?;
        }
        if let Ok(v) = env::var(ENV_KERNEL_DIR) {
            cfg.kernel_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var(ENV_KERNEL_SUFFIX) {
            cfg.kernel_suffix = v;
        }
        if let Ok(v) = env::var(ENV_BUILD_OPTIONS) {
            cfg.build_options = v;
        }

        Ok(cfg)
    }

    /// File settings overlaid with environment settings, validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg = Self::from_toml(path)?.merge_with(&Self::from_env()?);
        cfg.validate()?;
        Ok(cfg)
    }

    // ── Validation ──────────────────────────────────────────────

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kernel_suffix.is_empty() {
            return Err(ConfigError::Validation("kernel_suffix must not be empty".into()));
        }
        if !self.kernel_suffix.starts_with('.') {
            return Err(ConfigError::Validation(format!(
                "kernel_suffix must start with '.', got '{}'",
                self.kernel_suffix
            )));
        }
        Ok(())
    }

    // ── Merge ───────────────────────────────────────────────────

    /// Overlay `other` on top of `self`. Fields in `other` that differ
    /// from the default take precedence.
    #[must_use]
    pub fn merge_with(&self, other: &Self) -> Self {
        let d = Self::default();
        Self {
            platform_index: if other.platform_index == d.platform_index {
                self.platform_index
            } else {
                other.platform_index
            },
            device_type: if other.device_type == d.device_type {
                self.device_type
            } else {
                other.device_type
            },
            device_index: if other.device_index == d.device_index {
                self.device_index
            } else {
                other.device_index
            },
            enable_profiling: if other.enable_profiling == d.enable_profiling {
                self.enable_profiling
            } else {
                other.enable_profiling
            },
            kernel_dir: if other.kernel_dir == d.kernel_dir {
                self.kernel_dir.clone()
            } else {
                other.kernel_dir.clone()
            },
            kernel_suffix: if other.kernel_suffix == d.kernel_suffix {
                self.kernel_suffix.clone()
            } else {
                other.kernel_suffix.clone()
            },
            build_options: if other.build_options == d.build_options {
                self.build_options.clone()
            } else {
                other.build_options.clone()
            },
        }
    }

    // ── Derived settings ────────────────────────────────────────

    pub fn selection(&self) -> DeviceSelection {
        DeviceSelection {
            platform_index: self.platform_index,
            device_type: self.device_type.mask(),
            device_index: self.device_index,
        }
    }

    pub fn queue_properties(&self) -> QueueProperties {
        QueueProperties { profiling: self.enable_profiling }
    }

    pub fn source_store(&self) -> FileSourceStore {
        FileSourceStore::new(&self.kernel_dir, &self.kernel_suffix)
    }

    // ── Helpers ─────────────────────────────────────────────────

    fn parse_env_usize(key: &str, val: &str) -> Result<usize, ConfigError> {
        val.parse::<usize>().map_err(|_| ConfigError::InvalidEnvVar {
            key: key.to_string(),
            value: val.to_string(),
        })
    }

    fn parse_env_bool(key: &str, val: &str) -> Result<bool, ConfigError> {
        match val.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidEnvVar { key: key.to_string(), value: val.to_string() }),
        }
    }
}
