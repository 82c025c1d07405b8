//! Engine configuration (`scaler.toml`).
//!
//! Every field has a default, so an empty file is a valid config.
//! Durations are written as `"500ms"`, `"2s"`, or `"5m"`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::types::ScalingItemType;

/// Cluster flavor. Decides which workload kinds are reconciled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[default]
    Kubernetes,
    Openshift,
}

impl Platform {
    /// Workload kinds available on this platform.
    pub fn kinds(&self) -> Vec<ScalingItemType> {
        match self {
            Platform::Kubernetes => vec![
                ScalingItemType::Deployment,
                ScalingItemType::RedisCluster,
            ],
            Platform::Openshift => ScalingItemType::ALL.to_vec(),
        }
    }
}

/// How the scaler moves a workload toward its target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMode {
    /// One update straight to the target.
    #[default]
    Rapid,
    /// ±1 replica per iteration, waiting for readiness in between.
    Step,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub platform: Platform,
    pub scaling_mode: ScalingMode,
    /// Readiness poll interval between steps.
    pub poll_interval: String,
    /// Added to the workload's progress deadline to bound one step.
    pub step_timeout_slack: String,
    /// Interval of the failure rectification sweep.
    pub rectify_interval: String,
    /// Interval of the periodic namespace reconcile.
    pub reconcile_interval: String,
    /// Update attempts before a write conflict becomes a failure.
    pub conflict_retries: u32,
    /// Fixed wait between conflicting update attempts.
    pub conflict_backoff: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            platform: Platform::default(),
            scaling_mode: ScalingMode::default(),
            poll_interval: "2s".to_string(),
            step_timeout_slack: "60s".to_string(),
            rectify_interval: "15s".to_string(),
            reconcile_interval: "30s".to_string(),
            conflict_retries: 5,
            conflict_backoff: "10ms".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        debug!(?path, "engine config loaded");
        Ok(config)
    }

    /// Parse and validate a config document.
    pub fn from_toml(content: &str) -> CoreResult<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every duration field parses.
    pub fn validate(&self) -> CoreResult<()> {
        self.poll_interval()?;
        self.step_timeout_slack()?;
        self.rectify_interval()?;
        self.reconcile_interval()?;
        self.conflict_backoff()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> CoreResult<Duration> {
        parse_duration(&self.poll_interval)
    }

    pub fn step_timeout_slack(&self) -> CoreResult<Duration> {
        parse_duration(&self.step_timeout_slack)
    }

    pub fn rectify_interval(&self) -> CoreResult<Duration> {
        parse_duration(&self.rectify_interval)
    }

    pub fn reconcile_interval(&self) -> CoreResult<Duration> {
        parse_duration(&self.reconcile_interval)
    }

    pub fn conflict_backoff(&self) -> CoreResult<Duration> {
        parse_duration(&self.conflict_backoff)
    }
}

/// Parse a duration string like `"250ms"`, `"30s"`, `"5m"`, or bare seconds.
pub fn parse_duration(s: &str) -> CoreResult<Duration> {
    let s = s.trim();
    let bad = || CoreError::Duration(s.to_string());
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().map(Duration::from_millis).map_err(|_| bad())
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().map(Duration::from_secs).map_err(|_| bad())
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins = mins.parse::<u64>().map_err(|_| bad())?;
        mins.checked_mul(60).map(Duration::from_secs).ok_or_else(bad)
    } else {
        s.parse::<u64>().map(Duration::from_secs).map_err(|_| bad())
    }
}
