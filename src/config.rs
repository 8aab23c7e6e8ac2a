use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::relay::stream::RelayConfig;

const CONFIG_PATH: &str = ".termbridge/config.toml";

/// Project-level configuration from `.termbridge/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Longest a single frame may spend writing queued output.
    pub flush_budget_ms: u64,
    /// How often the relay fires a frame.
    pub frame_interval_ms: u64,
    /// Where session histories live. Relative paths resolve against the
    /// project root.
    pub history_dir: Option<PathBuf>,
    pub default_model: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flush_budget_ms: 4,
            frame_interval_ms: 16,
            history_dir: None,
            default_model: None,
        }
    }
}

impl Config {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            budget: Duration::from_millis(self.flush_budget_ms),
            frame_interval: Duration::from_millis(self.frame_interval_ms.max(1)),
        }
    }
}

/// Load configuration from `.termbridge/config.toml` under `root`.
///
/// Falls back to defaults if the file is missing.
pub fn load(root: &Path) -> Result<Config> {
    let path = root.join(CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    if let Some(dir) = &config.history_dir
        && dir.is_relative()
    {
        config.history_dir = Some(root.join(dir));
    }
    Ok(config)
}
