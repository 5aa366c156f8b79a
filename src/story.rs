//! Story and phase model, story definitions, and the sprint status table.
//!
//! This module provides:
//! - `StoryStatus` / `PhaseState` lifecycle enums with transition checks
//! - `Story` and `Phase`, mutated only by the scheduler
//! - `StoryDefinition`, the optional `stories/<key>.yaml` file
//! - `StorySnapshot`, the state serialized into checkpoints
//! - `SprintStatus`, the `sprint-status.yaml` table

use crate::budget::{BudgetConfig, BudgetEntry};
use crate::errors::PipelineError;
use crate::util::write_atomic;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Lifecycle status of a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoryStatus {
    Backlog,
    Drafted,
    ReadyForDev,
    InProgress,
    Review,
    Done,
    Blocked,
    Failed,
}

impl StoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Drafted => "drafted",
            Self::ReadyForDev => "ready-for-dev",
            Self::InProgress => "in-progress",
            Self::Review => "review",
            Self::Done => "done",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: StoryStatus) -> bool {
        use StoryStatus::*;
        match (self, next) {
            (Backlog, Drafted)
            | (Drafted, ReadyForDev)
            | (ReadyForDev, InProgress)
            | (InProgress, Review)
            | (Review, Done)
            | (InProgress, Blocked)
            | (Review, Blocked)
            | (Blocked, InProgress) => true,
            (from, Failed) => from != Done && from != Failed,
            _ => false,
        }
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "drafted" => Ok(Self::Drafted),
            "ready-for-dev" => Ok(Self::ReadyForDev),
            "in-progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            "blocked" => Ok(Self::Blocked),
            "failed" => Ok(Self::Failed),
            other => Err(format!("Unknown story status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseState {
    #[default]
    Pending,
    Running,
    Blocked,
    Done,
    Failed,
}

/// One phase entry in a story definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub name: String,
    /// Registry id of the agent that runs the phase.
    pub agent: String,
    /// Budget category the phase is charged to.
    pub category: String,
    /// Reservation amount; the configured default applies when absent.
    #[serde(default)]
    pub estimate: Option<f64>,
    /// Phase names in this story, or other story keys, that must be done first.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl PhaseDefinition {
    pub fn new(name: &str, agent: &str, category: &str) -> Self {
        Self {
            name: name.to_string(),
            agent: agent.to_string(),
            category: category.to_string(),
            estimate: None,
            depends_on: Vec::new(),
        }
    }
}

fn default_sprint() -> u32 {
    1
}

fn default_phases() -> Vec<PhaseDefinition> {
    vec![
        PhaseDefinition::new("plan", "planner", "planning"),
        PhaseDefinition::new("implement", "developer", "implementation"),
        PhaseDefinition::new("review", "reviewer", "review"),
    ]
}

/// Contents of `stories/<key>.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryDefinition {
    #[serde(default = "default_sprint")]
    pub sprint: u32,
    #[serde(default)]
    pub currency: Option<String>,
    /// Per-category cap overrides.
    #[serde(default)]
    pub budget: BTreeMap<String, f64>,
    #[serde(default = "default_phases")]
    pub phases: Vec<PhaseDefinition>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Default for StoryDefinition {
    fn default() -> Self {
        Self {
            sprint: default_sprint(),
            currency: None,
            budget: BTreeMap::new(),
            phases: default_phases(),
            description: None,
        }
    }
}

impl StoryDefinition {
    /// Load `<dir>/<key>.yaml`, falling back to the default definition.
    pub fn load(stories_dir: &Path, key: &str) -> Result<Self> {
        let path = stories_dir.join(format!("{}.yaml", key));
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read story definition: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse story definition: {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub agent: String,
    pub category: String,
    #[serde(default)]
    pub estimate: Option<f64>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub state: PhaseState,
    /// Cost charged to this phase so far.
    #[serde(default)]
    pub spent: f64,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Output of the last successful run.
    #[serde(default)]
    pub output: Option<String>,
}

impl Phase {
    fn from_definition(def: &PhaseDefinition) -> Self {
        Self {
            name: def.name.clone(),
            agent: def.agent.clone(),
            category: def.category.clone(),
            estimate: def.estimate,
            depends_on: def.depends_on.clone(),
            state: PhaseState::Pending,
            spent: 0.0,
            started_at: None,
            ended_at: None,
            output: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == PhaseState::Done
    }
}

/// A unit of work driven through the phase pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub key: String,
    pub sprint: u32,
    pub status: StoryStatus,
    pub phases: Vec<Phase>,
    pub budget: Vec<BudgetEntry>,
    pub currency: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Story {
    /// Materialize a story in `backlog` from its definition.
    ///
    /// Caps come from `config.caps`, overridden per category by the
    /// definition. Every phase category must end up with a cap.
    pub fn from_definition(
        key: &str,
        def: &StoryDefinition,
        config: &BudgetConfig,
    ) -> Result<Self, PipelineError> {
        if def.phases.is_empty() {
            return Err(PipelineError::ConfigInvalid(format!(
                "story {} declares no phases",
                key
            )));
        }

        let mut seen = HashSet::new();
        for phase in &def.phases {
            if phase.name.trim().is_empty() || phase.agent.trim().is_empty() {
                return Err(PipelineError::ConfigInvalid(format!(
                    "story {} has a phase without a name or agent",
                    key
                )));
            }
            if !seen.insert(phase.name.as_str()) {
                return Err(PipelineError::ConfigInvalid(format!(
                    "story {} declares phase '{}' twice",
                    key, phase.name
                )));
            }
            if phase.estimate.is_some_and(|e| e < 0.0 || !e.is_finite()) {
                return Err(PipelineError::ConfigInvalid(format!(
                    "phase '{}' of story {} has an invalid estimate",
                    phase.name, key
                )));
            }
        }

        let currency = def.currency.clone().unwrap_or_else(|| config.currency.clone());
        let mut caps = config.caps.clone();
        caps.extend(def.budget.iter().map(|(k, v)| (k.clone(), *v)));
        if let Some((category, cap)) = caps.iter().find(|(_, cap)| **cap < 0.0 || !cap.is_finite()) {
            return Err(PipelineError::ConfigInvalid(format!(
                "budget cap for '{}' must be a non-negative number, got {}",
                category, cap
            )));
        }
        if let Some(phase) = def.phases.iter().find(|p| !caps.contains_key(&p.category)) {
            return Err(PipelineError::ConfigInvalid(format!(
                "phase '{}' of story {} uses budget category '{}' which has no cap",
                phase.name, key, phase.category
            )));
        }

        Ok(Self {
            key: key.to_string(),
            sprint: def.sprint,
            status: StoryStatus::Backlog,
            phases: def.phases.iter().map(Phase::from_definition).collect(),
            budget: caps
                .iter()
                .map(|(category, cap)| BudgetEntry::new(category, *cap, &currency))
                .collect(),
            currency,
            description: def.description.clone(),
        })
    }

    /// Move to `next` if the lifecycle allows it. Returns whether it moved.
    pub fn transition(&mut self, next: StoryStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Index of the first phase that is not done.
    pub fn next_phase(&self) -> Option<usize> {
        self.phases.iter().position(|p| !p.is_done())
    }

    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn is_complete(&self) -> bool {
        self.phases.iter().all(Phase::is_done)
    }

    /// Dependencies of phase `index` that are not satisfied. Names of phases
    /// in this story are checked here; anything else is treated as a story
    /// key and checked with `story_done`.
    pub fn unmet_dependencies(&self, index: usize, story_done: impl Fn(&str) -> bool) -> Vec<String> {
        let Some(phase) = self.phases.get(index) else {
            return Vec::new();
        };
        phase
            .depends_on
            .iter()
            .filter(|dep| match self.phase(dep) {
                Some(other) => !other.is_done(),
                None => !story_done(dep),
            })
            .cloned()
            .collect()
    }

    /// Phase outputs so far, as context for the next agent.
    pub fn prior_outputs(&self, index: usize) -> Vec<String> {
        self.phases[..index.min(self.phases.len())]
            .iter()
            .filter_map(|p| {
                p.output
                    .as_ref()
                    .map(|o| format!("Output of phase '{}' ({}):\n{}", p.name, p.agent, o))
            })
            .collect()
    }

    pub fn total_spent(&self) -> f64 {
        self.budget.iter().map(|e| e.spent).sum()
    }
}

/// State serialized into each checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorySnapshot {
    pub story: Story,
    /// Accumulated context-size estimate at the time of the checkpoint.
    pub context_tokens: u64,
}

/// The `sprint-status.yaml` table: story key → lifecycle status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SprintStatus {
    #[serde(default)]
    pub development_status: BTreeMap<String, StoryStatus>,
}

impl SprintStatus {
    /// Load the table, or an empty one if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sprint status: {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse sprint status: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize sprint status")?;
        write_atomic(path, yaml.as_bytes())
    }

    pub fn get(&self, key: &str) -> Option<StoryStatus> {
        self.development_status.get(key).copied()
    }

    pub fn set(&mut self, key: &str, status: StoryStatus) {
        self.development_status.insert(key.to_string(), status);
    }

    /// Read-modify-write a single entry.
    pub fn update(path: &Path, key: &str, status: StoryStatus) -> Result<()> {
        let mut table = Self::load(path)?;
        table.set(key, status);
        table.save(path)
    }
}

/// Check that `key` is a single plain path component. Keys name files and
/// directories under `.storyforge/`.
pub fn validate_key(key: &str) -> Result<(), PipelineError> {
    let plain = !key.is_empty()
        && !key.starts_with('.')
        && !key.contains(['/', '\\', '\0'])
        && !key.contains("..");
    if plain {
        Ok(())
    } else {
        Err(PipelineError::ConfigInvalid(format!(
            "invalid story key {:?}: keys may not be empty, start with '.', or contain path separators",
            key
        )))
    }
}
