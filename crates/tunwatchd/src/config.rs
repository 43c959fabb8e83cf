//! tunwatch.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use tunwatch_health::IntervalThresholds;

/// File read when no `--config` is given and it exists in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "tunwatch.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunwatchConfig {
    pub tunnel: TunnelConfig,
    pub probe: ProbeConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub name: String,
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Upper bound on a single probe request (e.g., "5s").
    pub timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// How often the monitor re-triggers a gated check.
    pub tick: String,
    /// Checks younger than this are in the first interval.
    pub first_interval: String,
    /// Checks at least this old are due.
    pub due_after: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            public_url: None,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: "5s".to_string(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick: "10s".to_string(),
            first_interval: "20s".to_string(),
            due_after: "60s".to_string(),
        }
    }
}

impl TunwatchConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: TunwatchConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load `path`, or `./tunwatch.toml` if present, or the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::from_file(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn probe_timeout(&self) -> anyhow::Result<Duration> {
        let timeout = duration_field("probe.timeout", &self.probe.timeout)?;
        if timeout.is_zero() {
            bail!("probe.timeout must be greater than zero");
        }
        Ok(timeout)
    }

    pub fn tick(&self) -> anyhow::Result<Duration> {
        let tick = duration_field("schedule.tick", &self.schedule.tick)?;
        if tick.is_zero() {
            bail!("schedule.tick must be greater than zero");
        }
        Ok(tick)
    }

    pub fn thresholds(&self) -> anyhow::Result<IntervalThresholds> {
        let thresholds = IntervalThresholds {
            first: duration_field("schedule.first_interval", &self.schedule.first_interval)?,
            due: duration_field("schedule.due_after", &self.schedule.due_after)?,
        };
        if !thresholds.is_valid() {
            bail!("schedule.first_interval must not exceed schedule.due_after");
        }
        Ok(thresholds)
    }
}

fn duration_field(field: &str, value: &str) -> anyhow::Result<Duration> {
    parse_duration(value).with_context(|| format!("invalid duration for {field}: {value:?}"))
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
