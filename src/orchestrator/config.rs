use crate::engine::SimulatedEngineConfig;
use crate::model::StageDurations;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR: &str = "particle-stage";
const CONFIG_FILE: &str = "config.json";

/// External engine executable; when absent the simulated engine is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineProgram {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    /// Restart the engine after a command fails for want of a live engine.
    pub auto_restart: bool,
    #[serde(with = "humantime_serde")]
    pub health_poll_interval: Duration,
    /// A heartbeat older than this marks the engine as not responding.
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    pub stage_durations: StageDurations,
    pub engine: Option<EngineProgram>,
    pub simulator: SimulatedEngineConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            auto_restart: true,
            health_poll_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
            stage_durations: StageDurations::default(),
            engine: None,
            simulator: SimulatedEngineConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// `<config dir>/particle-stage/config.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load from `path`, or from the default location when it exists, or fall
    /// back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(p) => Self::from_file(&p),
                None => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.health_poll_interval.is_zero() {
            anyhow::bail!("healthPollInterval must be greater than zero");
        }
        if self.request_timeout.is_zero() {
            anyhow::bail!("requestTimeout must be greater than zero");
        }
        Ok(())
    }
}
