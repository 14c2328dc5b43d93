//! Layered configuration for the `loom` binary.
//!
//! Resolution order, lowest to highest:
//! 1. compiled defaults (`LoomConfig::default()` via `#[serde(default)]`)
//! 2. the JSON file (`~/.loom/config.json`, or `--config`)
//! 3. `LOOM_`-prefixed environment variables, `__` separating nested keys
//!    (`LOOM_ENGINE__MAX_STEPS=10`)

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use figment::providers::{Env, Format, Json};
use figment::Figment;
use serde::{Deserialize, Serialize};

use loom_engine::EngineConfig;
use loom_llm::{ProviderConfig, ReliableConfig};
use loom_telemetry::TelemetryConfig;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoomConfig {
    pub provider: ProviderConfig,
    pub retry: ReliableConfig,
    pub engine: EngineConfig,
    pub telemetry: TelemetryConfig,
    /// Session database. Defaults to `~/.loom/sessions.db`.
    pub db_path: Option<PathBuf>,
}

impl LoomConfig {
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| loom_home().join("sessions.db"))
    }
}

/// `~/.loom`, falling back to `/tmp/.loom` when `HOME` is unset.
pub fn loom_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".loom")
}

pub fn default_config_path() -> PathBuf {
    loom_home().join("config.json")
}

/// Load configuration. An explicit path must exist; the default one may not.
pub fn load(explicit: Option<&Path>) -> Result<LoomConfig> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                bail!("config file not found: {}", path.display());
            }
            path.to_path_buf()
        }
        None => default_config_path(),
    };
    figment(&path)
        .extract()
        .with_context(|| format!("invalid configuration (file: {})", path.display()))
}

fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Json::file(path))
        .merge(Env::prefixed("LOOM_").split("__"))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}
