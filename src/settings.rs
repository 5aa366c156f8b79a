//! Layered configuration for storyforge.
//!
//! Values are resolved in this order, later layers winning:
//! built-in defaults → `.storyforge/storyforge.toml` → `.env` → process
//! environment → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "shop"
//! agent_cmd = "claude"
//!
//! [budget]
//! currency = "USD"
//! warning_percent = 75
//! critical_percent = 90
//! auto_stop = true
//! rolling_window_days = 30
//! baseline_offset = 0.0
//! default_phase_estimate = 1.0
//!
//! [budget.caps]
//! planning = 5.0
//! implementation = 15.0
//! review = 5.0
//!
//! [pipeline]
//! agent_retries = 2
//! checkpoint_context_tokens = 100000
//! checkpoint_timeout_ms = 2000
//! agent_timeout_secs = 1800
//! auto_fix = true
//!
//! [collab]
//! max_swarm_iterations = 3
//! swarm_round_timeout_secs = 300
//! consensus_quorum = 0.66
//! pair_max_increments = 3
//! approval_marker = "APPROVED"
//!
//! [gates]
//! version_files = ["Cargo.toml"]
//! changelog = "CHANGELOG.md"
//!
//! [[gates.commands]]
//! name = "lint"
//! tier = 2
//! command = "cargo clippy -- -D warnings"
//! fix = "cargo clippy --fix --allow-dirty"
//!
//! [agents.developer]
//! model = "opus"
//! principles = ["Small commits"]
//! ```

use crate::agent::PersonaLayer;
use crate::budget::BudgetConfig;
use crate::collab::CollabConfig;
use crate::errors::PipelineError;
use crate::gates::GatesConfig;
use crate::router::AgentRegistry;
use crate::scheduler::PipelineConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Prefix of every recognised environment variable.
pub const ENV_PREFIX: &str = "STORYFORGE_";

fn default_skip_permissions() -> bool {
    true
}

/// Project-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSection {
    #[serde(default)]
    pub name: Option<String>,
    /// Agent CLI executable.
    #[serde(default)]
    pub agent_cmd: Option<String>,
    #[serde(default = "default_skip_permissions")]
    pub skip_permissions: bool,
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            name: None,
            agent_cmd: None,
            skip_permissions: default_skip_permissions(),
        }
    }
}

/// The complete `storyforge.toml` structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryforgeToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub collab: CollabConfig,
    #[serde(default)]
    pub gates: GatesConfig,
    /// Persona profile layer per agent id.
    #[serde(default)]
    pub agents: BTreeMap<String, PersonaLayer>,
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, PipelineError> {
    value.trim().parse::<T>().map_err(|_| {
        PipelineError::ConfigInvalid(format!("{} has an invalid value '{}'", key, value))
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, PipelineError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(PipelineError::ConfigInvalid(format!(
            "{} must be a boolean, got '{}'",
            key, value
        ))),
    }
}

impl StoryforgeToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse storyforge.toml")
    }

    /// Load `<dir>/storyforge.toml`, or defaults if it does not exist.
    pub fn load_or_default(storyforge_dir: &Path) -> Result<Self> {
        let config_path = storyforge_dir.join("storyforge.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize storyforge.toml")?;
        crate::util::write_atomic(path, content.as_bytes())
    }

    /// Apply `STORYFORGE_*` overrides from `vars`. Unrelated keys are ignored.
    pub fn apply_env_from<I, K, V>(&mut self, vars: I) -> Result<(), PipelineError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "WARNING_PERCENT" => self.budget.warning_percent = parse_env(key, value)?,
                "CRITICAL_PERCENT" => self.budget.critical_percent = parse_env(key, value)?,
                "AUTO_STOP" => self.budget.auto_stop = parse_bool(key, value)?,
                "ROLLING_WINDOW_DAYS" => self.budget.rolling_window_days = parse_env(key, value)?,
                "MAX_SWARM_ITERATIONS" => {
                    self.collab.max_swarm_iterations = parse_env(key, value)?
                }
                "AGENT_CMD" => self.project.agent_cmd = Some(value.to_string()),
                other => {
                    if let Some(category) = other.strip_prefix("BUDGET_") {
                        let cap: f64 = parse_env(key, value)?;
                        self.budget.caps.insert(category.to_lowercase(), cap);
                    } else {
                        debug!(key, "ignoring unrecognised environment option");
                        continue;
                    }
                }
            }
            debug!(key, "configuration overridden from environment");
        }
        Ok(())
    }

    /// Check the configuration. Returns warnings, or `ConfigInvalid` for
    /// values the pipeline cannot run with.
    pub fn validate(&self) -> Result<Vec<String>, PipelineError> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let budget = &self.budget;

        for (category, cap) in &budget.caps {
            if !cap.is_finite() || *cap < 0.0 {
                errors.push(format!("budget cap for '{}' must be non-negative, got {}", category, cap));
            } else if *cap == 0.0 {
                warnings.push(format!("budget cap for '{}' is zero; its phases will be blocked", category));
            }
        }
        for (name, value) in [
            ("warning_percent", budget.warning_percent),
            ("critical_percent", budget.critical_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                errors.push(format!("{} must be between 0 and 100, got {}", name, value));
            }
        }
        if budget.warning_percent >= budget.critical_percent {
            errors.push(format!(
                "warning_percent ({}) must be below critical_percent ({})",
                budget.warning_percent, budget.critical_percent
            ));
        }
        if !budget.default_phase_estimate.is_finite() || budget.default_phase_estimate < 0.0 {
            errors.push("default_phase_estimate must be non-negative".to_string());
        }
        if !budget.baseline_offset.is_finite() {
            errors.push("baseline_offset must be a number".to_string());
        }
        if budget.rolling_window_days == 0 {
            warnings.push("rolling_window_days is 0; the rolling aggregate covers no sessions".to_string());
        }
        if !budget.auto_stop {
            warnings.push("auto_stop is off; reservations past a cap are allowed".to_string());
        }

        let collab = &self.collab;
        if !(collab.consensus_quorum > 0.0 && collab.consensus_quorum <= 1.0) {
            errors.push(format!(
                "consensus_quorum must be in (0, 1], got {}",
                collab.consensus_quorum
            ));
        }
        if collab.max_swarm_iterations == 0 {
            errors.push("max_swarm_iterations must be at least 1".to_string());
        }
        if collab.pair_max_increments == 0 {
            errors.push("pair_max_increments must be at least 1".to_string());
        }
        if collab.approval_marker.trim().is_empty() {
            errors.push("approval_marker must not be empty".to_string());
        }

        let mut gate_names = HashSet::new();
        for gate in &self.gates.commands {
            if !gate_names.insert(gate.name.as_str()) {
                warnings.push(format!("gate '{}' is configured more than once", gate.name));
            }
            if gate.command.trim().is_empty() {
                errors.push(format!("gate '{}' has an empty command", gate.name));
            }
        }

        let registry = AgentRegistry::builtin();
        for id in self.agents.keys() {
            if !registry.contains(id) {
                warnings.push(format!("[agents.{}] does not match a known agent role", id));
            }
        }

        if errors.is_empty() {
            Ok(warnings)
        } else {
            Err(PipelineError::ConfigInvalid(errors.join("; ")))
        }
    }
}

/// Resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub project_dir: PathBuf,
    pub storyforge_dir: PathBuf,
    pub toml: StoryforgeToml,
    pub verbose: bool,
}

impl Settings {
    /// Resolve all layers for `project_dir`, reading `.env` and the process
    /// environment.
    pub fn load(project_dir: &Path, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory: {}", project_dir.display()))?;
        let dotenv = read_dotenv(&project_dir.join(".env"))?;
        Self::load_with_env(&project_dir, verbose, dotenv.into_iter().chain(std::env::vars()))
    }

    /// Like [`load`](Self::load) but with an explicit environment.
    pub fn load_with_env<I>(project_dir: &Path, verbose: bool, env: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let storyforge_dir = project_dir.join(".storyforge");
        let mut toml = StoryforgeToml::load_or_default(&storyforge_dir)?;
        toml.apply_env_from(env)?;
        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            storyforge_dir,
            toml,
            verbose,
        })
    }

    pub fn agent_cmd(&self) -> String {
        self.toml
            .project
            .agent_cmd
            .clone()
            .unwrap_or_else(|| "claude".to_string())
    }

    pub fn config_path(&self) -> PathBuf {
        self.storyforge_dir.join("storyforge.toml")
    }
}

/// `(key, value)` pairs from a `.env` file; empty if the file is absent.
fn read_dotenv(path: &Path) -> Result<Vec<(String, String)>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    dotenvy::from_path_iter(path)
        .with_context(|| format!("Failed to read {}", path.display()))?
        .map(|item| item.with_context(|| format!("Failed to parse {}", path.display())))
        .collect()
}
