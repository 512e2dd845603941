// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bluetooth::ble_constants::timing;
use crate::bluetooth::{DeviceProfile, SessionConfig, TransportConfig};

const APP_DIR: &str = "ledstrip-desktop";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for the registry database.
    #[serde(skip)]
    pub data_dir: PathBuf,

    pub bluetooth: BluetoothConfig,

    pub transport: TransportSettings,

    pub reconnect: ReconnectSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// How long discovery runs before giving up.
    pub scan_timeout_secs: u64,

    pub connect_timeout_secs: u64,

    /// Connect to the best known device at startup.
    pub auto_connect: bool,

    /// Restrict discovery to one protocol.
    pub preferred_protocol: Option<DeviceProfile>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 10,
            connect_timeout_secs: 10,
            auto_connect: true,
            preferred_protocol: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub min_spacing_ms: u64,
    pub settle_ms: u64,
    pub write_timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_step_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            min_spacing_ms: timing::MIN_SPACING_MS,
            settle_ms: timing::SETTLE_MS,
            write_timeout_ms: timing::WRITE_TIMEOUT_MS,
            max_retries: timing::MAX_RETRIES,
            backoff_step_ms: timing::BACKOFF_STEP_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub attempts: u32,
    pub delay_secs: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            attempts: timing::RECONNECT_ATTEMPTS,
            delay_secs: timing::RECONNECT_DELAY_SECS,
        }
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

impl Config {
    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let config_dir = config_dir();
        std::fs::create_dir_all(&config_dir)?;

        let mut config = Self::load_from(&config_dir.join("config.toml"))?;

        config.data_dir = data_dir();
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(config)
    }

    /// Read `path`, writing the defaults there first if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content).with_context(|| format!("Invalid config file {:?}", path))
        } else {
            let config = Self::default();
            let content = toml::to_string_pretty(&config)?;
            std::fs::write(path, content)?;
            Ok(config)
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.bluetooth.scan_timeout_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_secs(self.bluetooth.connect_timeout_secs),
            reconnect_attempts: self.reconnect.attempts,
            reconnect_delay: Duration::from_secs(self.reconnect.delay_secs),
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            min_spacing: Duration::from_millis(self.transport.min_spacing_ms),
            settle: Duration::from_millis(self.transport.settle_ms),
            write_timeout: Duration::from_millis(self.transport.write_timeout_ms),
            max_retries: self.transport.max_retries,
            backoff_step: Duration::from_millis(self.transport.backoff_step_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_timing() {
        let config = Config::default();
        let transport = config.transport_config();
        assert_eq!(transport.min_spacing, Duration::from_millis(50));
        assert_eq!(transport.settle, Duration::from_millis(50));
        assert_eq!(transport.write_timeout, Duration::from_secs(5));
        assert_eq!(transport.max_retries, 3);
        assert_eq!(transport.backoff_step, Duration::from_millis(100));

        let session = config.session_config();
        assert_eq!(session.connect_timeout, Duration::from_secs(10));
        assert_eq!(session.reconnect_attempts, 3);
        assert_eq!(session.reconnect_delay, Duration::from_secs(3));
    }

    #[test]
    fn test_partial_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[bluetooth]\npreferred_protocol = \"generic\"\n\n[transport]\nmax_retries = 5\n",
        )?;

        let config = Config::load_from(&path)?;
        assert_eq!(config.bluetooth.preferred_protocol, Some(DeviceProfile::Generic));
        assert!(config.bluetooth.auto_connect);
        assert_eq!(config.transport.max_retries, 5);
        assert_eq!(config.transport.settle_ms, 50);
        assert_eq!(config.reconnect.attempts, 3);
        Ok(())
    }

    #[test]
    fn test_creates_default_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.toml");

        Config::load_from(&path)?;
        assert!(path.exists());

        let reloaded = Config::load_from(&path)?;
        assert_eq!(reloaded.bluetooth.scan_timeout_secs, 10);
        Ok(())
    }
}
