use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::transition::PollPolicy;

/// Smallest auto-refresh interval the engine will honor; configured
/// values below this are clamped up.
pub const MIN_REFRESH_INTERVAL_MS: u64 = 10_000;
/// Auto-refresh interval used when none is configured.
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 60_000;

/// Top-level configuration for the vmfleet engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tool: ToolConfig,
    pub refresh: RefreshConfig,
    pub fleet: FleetConfig,
    pub poll: PollConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tool: ToolConfig::default(),
            refresh: RefreshConfig::default(),
            fleet: FleetConfig::default(),
            poll: PollConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.tool.path.as_os_str().is_empty(),
            "tool.path must not be empty"
        );
        anyhow::ensure!(
            self.poll.max_attempts >= 1,
            "poll.max_attempts must be >= 1"
        );
        Ok(())
    }
}

/// Control tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Path to the hypervisor control tool binary.
    pub path: PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("prlctl"),
        }
    }
}

/// Auto-refresh (reconciler timer) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Whether the timer-driven reconciler runs at all.
    pub enabled: bool,
    /// Interval between reconciles in milliseconds, clamped to a minimum
    /// of 10,000 ms.
    pub interval_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
        }
    }
}

impl RefreshConfig {
    /// Effective interval after clamping.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(MIN_REFRESH_INTERVAL_MS))
    }
}

/// Fleet model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Keep each group's machine list sorted alphabetically by name.
    pub sort_alphabetically: bool,
    /// Show machines and groups flagged hidden in listings.
    pub show_hidden: bool,
    /// Path to persist the fleet model as JSON.
    pub state_file: PathBuf,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            sort_alphabetically: true,
            show_hidden: false,
            state_file: PathBuf::from("/var/lib/vmfleet/state.json"),
        }
    }
}

/// Transition status-poll configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Maximum number of status polls per transition.
    pub max_attempts: u32,
    /// Delay between polls in milliseconds (0 = no explicit delay).
    pub interval_ms: u64,
    /// Optional overall deadline for the polling phase, in milliseconds.
    pub deadline_ms: Option<u64>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: 40,
            interval_ms: 0,
            deadline_ms: None,
        }
    }
}

impl PollConfig {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy {
            max_attempts: self.max_attempts,
            interval: Duration::from_millis(self.interval_ms),
            deadline: self.deadline_ms.map(Duration::from_millis),
        }
    }
}
