// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration file support for weard.
//!
//! Supports loading configuration from TOML files with the following search order:
//! 1. Path specified via `--config` CLI argument
//! 2. `./wear-rs.toml` (current directory)
//! 3. `~/.config/wear-rs/config.toml` (XDG config)
//! 4. `/etc/wear-rs/config.toml` (system-wide)
//!
//! A missing file yields the documented defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use wear_core::config::{BleConfig, LoraConfig, PowerConfig, WifiConfig};

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Main loop behavior
    pub behavior: BehaviorConfig,
    /// Status cache settings
    pub status: StatusConfig,
    /// Display/sleep state machine
    pub power: PowerConfig,
    /// Wide-area network radio
    pub wifi: WifiConfig,
    /// Short-range bridge radio
    pub ble: BleConfig,
    /// Long-range packet radio
    pub lora: LoraConfig,
}

/// General application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    pub log_level: Option<String>,
}

/// Main loop behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Cooperative loop period in milliseconds
    pub tick_ms: u64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self { tick_ms: 50 }
    }
}

/// Status cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Topic prefixes recorded by the last-known-good cache
    pub prefixes: Vec<String>,
    /// Wildcard default TTL in milliseconds (absent = no expiry)
    pub default_ttl_ms: Option<u64>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            prefixes: vec!["status/".to_string()],
            default_ttl_ms: None,
        }
    }
}

impl Config {
    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    /// Load configuration from the default search paths.
    /// Returns default config if no config file is found.
    pub fn load_from_default_paths() -> Result<(Self, Option<PathBuf>), ConfigError> {
        for path in Self::default_search_paths() {
            if path.exists() {
                let config = Self::load_from_file(&path)?;
                return Ok((config, Some(path)));
            }
        }
        Ok((Self::default(), None))
    }

    /// Get the default search paths for config files.
    pub fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // Current directory
        paths.push(PathBuf::from("wear-rs.toml"));

        // XDG config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("wear-rs").join("config.toml"));
        }

        // System-wide config
        paths.push(PathBuf::from("/etc/wear-rs/config.toml"));

        paths
    }

    /// Generate an example configuration as a TOML string.
    pub fn example_toml() -> String {
        let mut example = Config::default();
        example.general.log_level = Some("info".to_string());
        example.wifi.enabled = true;
        example.wifi.ssid = Some("home".to_string());
        example.wifi.psk = Some("hunter2".to_string());
        example.ble.enabled = true;
        example.status.default_ttl_ms = Some(30_000);

        toml::to_string_pretty(&example).unwrap_or_default()
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file
    ReadError(PathBuf, String),
    /// Failed to parse the config file
    ParseError(PathBuf, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadError(path, err) => {
                write!(f, "failed to read config file '{}': {}", path.display(), err)
            }
            Self::ParseError(path, err) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), err)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
