//! Configuration system for delve.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from the user config directory (`config.toml`) and/or
//! `.delve/config.toml` in the workspace directory.

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for one research run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub budget: BudgetConfig,
    pub hypotheses: HypothesisConfig,
    pub retry: RetryConfig,
    /// Maximum in-flight oracle and source calls across the whole run.
    pub max_concurrent_units: usize,
    /// Maximum sub-goals accepted from a single decomposition.
    pub max_sub_goals: usize,
    /// Token-set similarity at or above which a goal counts as a repeat of an ancestor.
    pub cycle_similarity: f64,
    /// Result limit passed to every source call.
    pub results_per_source: usize,
    /// Sources used for direct searches and hypotheses that name no target.
    pub default_sources: Vec<String>,
    /// Directory that receives run artifacts (findings, metrics, events, report).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_dir: Option<PathBuf>,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            budget: BudgetConfig::default(),
            hypotheses: HypothesisConfig::default(),
            retry: RetryConfig::default(),
            max_concurrent_units: 8,
            max_sub_goals: 6,
            cycle_similarity: 0.85,
            results_per_source: 10,
            default_sources: vec!["web".to_string()],
            artifacts_dir: None,
        }
    }
}

impl ResearchConfig {
    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };
        if self.max_concurrent_units == 0 {
            return invalid("max_concurrent_units must be at least 1");
        }
        if !(self.budget.max_cost_usd > 0.0) {
            return invalid("budget.max_cost_usd must be positive");
        }
        if self.budget.max_goal_count == 0 {
            return invalid("budget.max_goal_count must be at least 1");
        }
        if self.budget.max_wall_time_secs == 0 {
            return invalid("budget.max_wall_time_secs must be at least 1");
        }
        if !(self.cycle_similarity > 0.0 && self.cycle_similarity <= 1.0) {
            return invalid("cycle_similarity must be in (0, 1]");
        }
        if self.hypotheses.max_per_goal == 0 && self.hypotheses.mode.executes_hypotheses() {
            return invalid("hypotheses.max_per_goal must be at least 1 when hypotheses run");
        }
        Ok(())
    }
}

/// Hard resource ceilings for a research run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Deepest goal allowed; the root is depth 0.
    pub max_depth: usize,
    pub max_wall_time_secs: u64,
    pub max_cost_usd: f64,
    pub max_goal_count: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_wall_time_secs: 300,
            max_cost_usd: 1.0,
            max_goal_count: 25,
        }
    }
}

impl BudgetConfig {
    pub fn max_wall_time(&self) -> Duration {
        Duration::from_secs(self.max_wall_time_secs)
    }
}

/// How hypotheses are used when a goal is executed directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HypothesisMode {
    /// No hypotheses; every executed goal is a single direct search.
    Off,
    /// Hypotheses are generated and recorded, but the goal runs a direct search.
    PlanOnly,
    /// Hypotheses run one at a time with coverage assessment between them.
    #[default]
    Sequential,
    /// All hypotheses run concurrently with no early stop.
    Parallel,
}

impl HypothesisMode {
    pub fn executes_hypotheses(self) -> bool {
        matches!(self, Self::Sequential | Self::Parallel)
    }
}

impl std::str::FromStr for HypothesisMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "plan-only" | "plan_only" | "plan" => Ok(Self::PlanOnly),
            "sequential" | "coverage" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            other => Err(ConfigError::Invalid {
                message: format!("unknown hypothesis mode '{other}'"),
            }),
        }
    }
}

/// Hypothesis branching limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypothesisConfig {
    pub mode: HypothesisMode,
    pub max_per_goal: usize,
    /// Wall-clock allowance for all hypothesis execution under one goal.
    pub time_budget_secs: u64,
}

impl Default for HypothesisConfig {
    fn default() -> Self {
        Self {
            mode: HypothesisMode::Sequential,
            max_per_goal: 5,
            time_budget_secs: 120,
        }
    }
}

impl HypothesisConfig {
    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }
}

/// Retry policy for oracle and source calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries for rate-limit and server errors.
    pub max_retries: u32,
    /// Retries for network errors.
    pub network_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Add up to 25% jitter to each backoff.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            network_retries: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `DELVE_`, nested with `__`)
/// 3. Workspace-local config (`.delve/config.toml`)
/// 4. User config (`~/.config/delve/config.toml` or platform equivalent)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&ResearchConfig>,
) -> Result<ResearchConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(ResearchConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // DELVE_BUDGET__MAX_COST_USD, DELVE_HYPOTHESES__MODE, ...
    figment = figment.merge(Env::prefixed("DELVE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: ResearchConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from one explicit TOML file layered over the defaults.
pub fn load_config_file(path: &Path) -> Result<ResearchConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let config: ResearchConfig = Figment::from(Serialized::defaults(ResearchConfig::default()))
        .merge(Toml::file(path))
        .extract()
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
    config.validate()?;
    Ok(config)
}

/// Path of the user-level config file, if a home directory can be resolved.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "delve", "delve")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".delve").join("config.toml")
}
