use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Weights used by the heat score. Partial config files fall back to the
/// defaults field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub severity_weight: f64,
    pub merit_weight: f64,
    pub repeat_factor: f64,
    pub max_repeat_exponent: u32,
    pub burst_window_days: i64,
    pub burst_threshold: usize,
    pub burst_multiplier: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            severity_weight: 0.5,
            merit_weight: 0.25,
            repeat_factor: 1.5,
            max_repeat_exponent: 4,
            burst_window_days: 7,
            burst_threshold: 3,
            burst_multiplier: 1.25,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scoring: ScoringConfig,
}

impl EngineConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
