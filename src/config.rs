//! Runtime configuration, persisted as TOML.
//!
//! Every field has a serde default, so a partial (or empty) file is valid and
//! a missing file means "all defaults".

use std::path::Path;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from configuration loading and saving.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(sria::config::read),
        help("Ensure the config file exists and is readable, or run `sria config init`.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}: {message}")]
    #[diagnostic(
        code(sria::config::parse),
        help("Check the TOML syntax. `sria config show` prints the defaults.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(sria::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Coupling
// ---------------------------------------------------------------------------

/// Thresholds and damping factors for cross-agent propagation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouplingConfig {
    /// Minimum coupling for a phase to propagate.
    #[serde(default = "default_phase_threshold")]
    pub phase_threshold: f64,
    #[serde(default = "default_phase_damping")]
    pub phase_damping: f64,
    /// Minimum coupling for a policy update to propagate.
    #[serde(default = "default_policy_threshold")]
    pub policy_threshold: f64,
    #[serde(default = "default_policy_damping")]
    pub policy_damping: f64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Minimum coupling for a belief to propagate.
    #[serde(default = "default_belief_threshold")]
    pub belief_threshold: f64,
    #[serde(default = "default_belief_damping")]
    pub belief_damping: f64,
    /// Substituted for a zero policy probability when biasing entropy costs.
    #[serde(default = "default_probability_floor")]
    pub probability_floor: f64,
    /// Action types every member's policy is seeded with.
    #[serde(default = "default_action_types")]
    pub action_types: Vec<String>,
    /// How many aggregated beliefs a collective step reports.
    #[serde(default = "default_shared_belief_top_k")]
    pub shared_belief_top_k: usize,
}

fn default_phase_threshold() -> f64 {
    0.1
}
fn default_phase_damping() -> f64 {
    0.5
}
fn default_policy_threshold() -> f64 {
    0.2
}
fn default_policy_damping() -> f64 {
    0.3
}
fn default_learning_rate() -> f64 {
    0.1
}
fn default_belief_threshold() -> f64 {
    0.15
}
fn default_belief_damping() -> f64 {
    0.4
}
fn default_probability_floor() -> f64 {
    0.1
}
fn default_action_types() -> Vec<String> {
    ["query", "response", "memory_write", "layer_shift", "wait"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_shared_belief_top_k() -> usize {
    5
}

impl Default for CouplingConfig {
    fn default() -> Self {
        Self {
            phase_threshold: default_phase_threshold(),
            phase_damping: default_phase_damping(),
            policy_threshold: default_policy_threshold(),
            policy_damping: default_policy_damping(),
            learning_rate: default_learning_rate(),
            belief_threshold: default_belief_threshold(),
            belief_damping: default_belief_damping(),
            probability_floor: default_probability_floor(),
            action_types: default_action_types(),
            shared_belief_top_k: default_shared_belief_top_k(),
        }
    }
}

// ---------------------------------------------------------------------------
// Runner / engine
// ---------------------------------------------------------------------------

/// Defaults for background run loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Pause between steps.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Step limit applied when a run is started without a stop condition.
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
}

fn default_interval_ms() -> u64 {
    100
}
fn default_max_steps() -> u64 {
    100
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_steps: default_max_steps(),
        }
    }
}

/// Defaults applied to newly created agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// `perception_config.prime_count` for agents that don't set one.
    #[serde(default = "default_prime_count")]
    pub default_prime_count: usize,
}

fn default_prime_count() -> usize {
    5
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_prime_count: default_prime_count(),
        }
    }
}

// ---------------------------------------------------------------------------
// SriaConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SriaConfig {
    #[serde(default)]
    pub coupling: CouplingConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub engine: EngineSettings,
}

impl SriaConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content, path)
    }

    /// Load from `path`, or return defaults if it does not exist.
    pub fn load_or_default(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    fn parse(content: &str, path: &Path) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Render as pretty TOML.
    pub fn to_toml(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: "<memory>".into(),
            message: e.to_string(),
        })
    }

    /// Save to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = self.to_toml()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: SriaConfig = toml::from_str(
            r#"
            [coupling]
            belief_threshold = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.coupling.belief_threshold, 0.5);
        assert_eq!(cfg.coupling.policy_threshold, 0.2);
        assert_eq!(cfg.coupling.action_types.len(), 5);
        assert_eq!(cfg.runner, RunnerConfig::default());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut cfg = SriaConfig::default();
        cfg.runner.max_steps = 7;
        cfg.save(&path).unwrap();
        assert_eq!(SriaConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = SriaConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, SriaConfig::default());
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "coupling = [").unwrap();
        assert!(matches!(SriaConfig::load(&path), Err(ConfigError::Parse { .. })));
    }
}
