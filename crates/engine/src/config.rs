// Rewind - EVM State Time Machine
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Engine configuration.
//!
//! Read from `~/.rewind.toml` (created with defaults on first use) or from an explicit
//! path. Environment variables from [`rewind_common::env`] win over file values.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use eyre::{Context, Result};
use rewind_adapter::{AnvilConfig, NodeDialect};
use rewind_common::{env::REWIND_ANVIL_BIN, DataPath, RewindDataPath};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Configuration file name under the home directory.
pub const CONFIG_FILE_NAME: &str = ".rewind.toml";

/// An existing JSON-RPC node registered as a replay backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    /// Registry tag jobs refer to
    pub tag: String,
    /// HTTP endpoint
    pub url: String,
    /// Override method family
    #[serde(default = "default_dialect")]
    pub dialect: NodeDialect,
}

fn default_dialect() -> NodeDialect {
    NodeDialect::Anvil
}

/// Settings of a [`TimeMachine`](crate::TimeMachine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of persisted snapshots and the lineage index; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    /// Maximum number of deltas between a snapshot and its nearest full ancestor
    pub checkpoint_interval: u32,
    /// Canonical blobs larger than this many bytes are stored zstd-compressed
    pub compression_threshold: usize,
    /// Recursion bound of the diff engine
    pub diff_max_depth: usize,
    /// Wall-clock bound of a single replay job, in seconds
    pub replay_timeout_secs: u64,
    /// Event stream poll interval, in milliseconds
    pub event_poll_interval_ms: u64,
    /// Network name used in rendered diff locations
    pub network: String,
    /// Backend used to apply patches outside of a replay job
    pub patch_backend: String,
    /// Defaults of the `anvil` backend
    pub anvil: AnvilConfig,
    /// Extra node backends
    pub nodes: Vec<NodeEndpoint>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            checkpoint_interval: 16,
            compression_threshold: 64 * 1024,
            diff_max_depth: 32,
            replay_timeout_secs: 600,
            event_poll_interval_ms: 1000,
            network: "mainnet".to_string(),
            patch_backend: "mock".to_string(),
            anvil: AnvilConfig::default(),
            nodes: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// `~/.rewind.toml`.
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs_next::home_dir()
            .ok_or_else(|| eyre::eyre!("Unable to determine home directory"))?;
        Ok(home.join(CONFIG_FILE_NAME))
    }

    /// Loads the home configuration, creating it with defaults if missing.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path()?)
    }

    /// Loads `path`, creating it with defaults if missing, then applies env overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("Config file not found, creating default at {}", path.display());
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config.with_env_overrides());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as TOML: {}", path.display()))?;

        debug!("Loaded engine configuration from {}", path.display());
        Ok(config.with_env_overrides())
    }

    /// Writes the configuration as TOML.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        debug!("Saved engine configuration to {}", path.display());
        Ok(())
    }

    /// Applies `REWIND_DATA_DIR` and `REWIND_ANVIL_BIN`.
    pub fn with_env_overrides(mut self) -> Self {
        self.data_dir = RewindDataPath::resolve(self.data_dir.take()).data_dir();
        if let Ok(binary) = std::env::var(REWIND_ANVIL_BIN) {
            if !binary.trim().is_empty() {
                self.anvil.binary = PathBuf::from(binary);
            }
        }
        self
    }

    /// Data path of the configured root, or an in-memory one.
    pub fn data_path(&self) -> RewindDataPath {
        match &self.data_dir {
            Some(dir) => RewindDataPath::new(Some(dir.clone())),
            None => RewindDataPath::in_memory(),
        }
    }

    /// Replay bound.
    pub fn replay_timeout(&self) -> Duration {
        Duration::from_secs(self.replay_timeout_secs)
    }

    /// Event stream poll interval.
    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms)
    }

    /// Persists under `dir`.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Sets the checkpoint interval.
    pub fn with_checkpoint_interval(mut self, interval: u32) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Sets the compression threshold.
    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }

    /// Sets the replay bound.
    pub fn with_replay_timeout(mut self, timeout: Duration) -> Self {
        self.replay_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Sets the network name.
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    /// Sets the patch backend.
    pub fn with_patch_backend(mut self, tag: impl Into<String>) -> Self {
        self.patch_backend = tag.into();
        self
    }

    /// Registers an extra node backend.
    pub fn with_node(mut self, tag: impl Into<String>, url: impl Into<String>, dialect: NodeDialect) -> Self {
        self.nodes.push(NodeEndpoint { tag: tag.into(), url: url.into(), dialect });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_common::logging::ensure_test_logging;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_missing_file_creates_defaults() {
        ensure_test_logging(None);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("rewind.toml");

        std::env::remove_var(rewind_common::env::REWIND_DATA_DIR);
        let config = EngineConfig::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    #[serial]
    fn test_partial_file_keeps_defaults() {
        ensure_test_logging(None);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rewind.toml");
        fs::write(
            &path,
            r#"
checkpoint_interval = 4
network = "sepolia"

[anvil]
port = 9545

[[nodes]]
tag = "geth"
url = "http://127.0.0.1:8546"
dialect = "geth"
"#,
        )
        .unwrap();

        std::env::remove_var(rewind_common::env::REWIND_DATA_DIR);
        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.checkpoint_interval, 4);
        assert_eq!(config.network, "sepolia");
        assert_eq!(config.anvil.port, 9545);
        assert_eq!(config.anvil.host, "127.0.0.1");
        assert_eq!(config.nodes[0].dialect, NodeDialect::Geth);
        assert_eq!(config.diff_max_depth, 32);
        assert!(config.data_dir.is_none());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        ensure_test_logging(None);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rewind.toml");
        EngineConfig::default().with_data_dir("/from/file").save_to(&path).unwrap();

        std::env::set_var(rewind_common::env::REWIND_DATA_DIR, dir.path());
        let config = EngineConfig::load_from(&path).unwrap();
        std::env::remove_var(rewind_common::env::REWIND_DATA_DIR);

        assert_eq!(config.data_dir.as_deref(), Some(dir.path()));
        assert!(config.data_path().is_persistent());
    }

    #[test]
    fn test_in_memory_when_unset() {
        let config = EngineConfig::default();
        assert!(!config.data_path().is_persistent());
        assert_eq!(config.replay_timeout(), Duration::from_secs(600));
    }
}
