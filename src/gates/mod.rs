//! Tiered validation gates.
//!
//! Tier 1 runs before a phase starts (preflight), tier 2 between phases,
//! tier 3 once all phases are done. Each gate passes, warns or fails on its
//! own; the engine aggregates them into a [`ValidationReport`].

pub mod builtin;
pub mod command;

pub use builtin::{BudgetAvailableGate, DependenciesGate, OutputParseGate, StoryFileGate, VersionSyncGate};
pub use command::{CommandGate, CommandGateConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

// ============================================================================
// Tier / outcome
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Tier {
    Preflight,
    InterPhase,
    PostCompletion,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Preflight, Tier::InterPhase, Tier::PostCompletion];

    pub fn number(self) -> u8 {
        match self {
            Self::Preflight => 1,
            Self::InterPhase => 2,
            Self::PostCompletion => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Preflight => "preflight",
            Self::InterPhase => "inter-phase",
            Self::PostCompletion => "post-completion",
        }
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> u8 {
        tier.number()
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Preflight),
            2 => Ok(Self::InterPhase),
            3 => Ok(Self::PostCompletion),
            other => Err(format!("Invalid tier {}: expected 1, 2 or 3", other)),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1" | "preflight" => Ok(Self::Preflight),
            "2" | "inter-phase" => Ok(Self::InterPhase),
            "3" | "post-completion" => Ok(Self::PostCompletion),
            other => Err(format!("Invalid tier '{}': expected 1, 2 or 3", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateOutcome {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::Fail => "fail",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Results
// ============================================================================

/// What a gate reports from one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct GateCheck {
    pub outcome: GateOutcome,
    pub detail: String,
    pub suggested_fix: Option<String>,
}

impl GateCheck {
    pub fn pass(detail: impl Into<String>) -> Self {
        Self {
            outcome: GateOutcome::Pass,
            detail: detail.into(),
            suggested_fix: None,
        }
    }

    pub fn warn(detail: impl Into<String>) -> Self {
        Self {
            outcome: GateOutcome::Warn,
            detail: detail.into(),
            suggested_fix: None,
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            outcome: GateOutcome::Fail,
            detail: detail.into(),
            suggested_fix: None,
        }
    }

    pub fn with_suggestion(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fix = Some(fix.into());
        self
    }
}

/// Record of an auto-fix applied to a failing gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixAttempt {
    pub before: GateOutcome,
    pub applied: bool,
    pub detail: String,
    pub after: GateOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub outcome: GateOutcome,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<FixAttempt>,
}

impl GateResult {
    fn from_check(name: &str, check: GateCheck) -> Self {
        Self {
            name: name.to_string(),
            outcome: check.outcome,
            detail: check.detail,
            suggested_fix: check.suggested_fix,
            fix: None,
        }
    }

    /// `fail→fix→pass` style transition, if a fix was attempted.
    pub fn transition(&self) -> Option<String> {
        self.fix.as_ref().map(|fix| {
            if fix.applied {
                format!("{}→fix→{}", fix.before, fix.after)
            } else {
                format!("{}→fix failed", fix.before)
            }
        })
    }
}

/// Aggregated result of one tier run. Produced fresh for every invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub tier: Tier,
    pub results: Vec<GateResult>,
    /// Gates not evaluated because a critical gate failed first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

impl ValidationReport {
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            results: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// `fail` if any gate failed after its fix attempt, else `warn` if any
    /// warned, else `pass`.
    pub fn outcome(&self) -> GateOutcome {
        self.results
            .iter()
            .map(|r| r.outcome)
            .max()
            .unwrap_or(GateOutcome::Pass)
    }

    pub fn passed(&self) -> bool {
        self.outcome() != GateOutcome::Fail
    }

    pub fn failing_gates(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.outcome == GateOutcome::Fail)
            .map(|r| r.name.clone())
            .collect()
    }

    pub fn result(&self, name: &str) -> Option<&GateResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn transitions(&self) -> Vec<String> {
        self.results
            .iter()
            .filter_map(|r| r.transition().map(|t| format!("{}: {}", r.name, t)))
            .collect()
    }

    /// Plain-text rendering, one line per gate.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Tier {} ({}): {}\n",
            self.tier,
            self.tier.label(),
            self.outcome()
        );
        for r in &self.results {
            out.push_str(&format!("  [{}] {}: {}", r.outcome, r.name, r.detail));
            if let Some(t) = r.transition() {
                out.push_str(&format!(" ({})", t));
            }
            out.push('\n');
            if r.outcome == GateOutcome::Fail
                && let Some(fix) = &r.suggested_fix
            {
                out.push_str(&format!("      fix: {}\n", fix));
            }
        }
        for name in &self.skipped {
            out.push_str(&format!("  [skipped] {}\n", name));
        }
        out
    }
}

// ============================================================================
// Gate trait and context
// ============================================================================

/// Budget figures the preflight budget gate checks.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetSnapshot {
    pub category: String,
    pub requested: f64,
    /// `None` when the category has no configured cap.
    pub cap: Option<f64>,
    pub spent: f64,
}

/// Inputs gates evaluate against. Built by the caller for each tier run.
#[derive(Debug, Clone)]
pub struct GateContext {
    pub project_dir: PathBuf,
    pub story_key: String,
    pub story_file: PathBuf,
    pub phase: Option<String>,
    pub budget: Option<BudgetSnapshot>,
    pub unmet_dependencies: Vec<String>,
    /// Output of the phase just completed (tier 2).
    pub output: Option<String>,
}

impl GateContext {
    pub fn new(project_dir: PathBuf, story_key: &str, story_file: PathBuf) -> Self {
        Self {
            project_dir,
            story_key: story_key.to_string(),
            story_file,
            phase: None,
            budget: None,
            unmet_dependencies: Vec::new(),
            output: None,
        }
    }

    pub fn with_phase(mut self, phase: &str) -> Self {
        self.phase = Some(phase.to_string());
        self
    }

    pub fn with_budget(mut self, budget: BudgetSnapshot) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_unmet_dependencies(mut self, unmet: Vec<String>) -> Self {
        self.unmet_dependencies = unmet;
        self
    }

    pub fn with_output(mut self, output: &str) -> Self {
        self.output = Some(output.to_string());
        self
    }
}

#[async_trait]
pub trait Gate: Send + Sync {
    fn name(&self) -> &str;

    fn tier(&self) -> Tier;

    /// A failing critical gate stops evaluation of the rest of its tier.
    fn critical(&self) -> bool {
        false
    }

    async fn evaluate(&self, ctx: &GateContext) -> GateCheck;

    fn has_fix(&self) -> bool {
        false
    }

    /// Apply the gate's deterministic remediation.
    async fn fix(&self, _ctx: &GateContext) -> Result<String, String> {
        Err(format!("gate '{}' has no fix", self.name()))
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Runs the gates registered for a tier.
#[derive(Clone, Default)]
pub struct GateEngine {
    gates: Vec<Arc<dyn Gate>>,
    auto_fix: bool,
}

impl GateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auto_fix(mut self, auto_fix: bool) -> Self {
        self.auto_fix = auto_fix;
        self
    }

    pub fn register(&mut self, gate: Arc<dyn Gate>) {
        self.gates.push(gate);
    }

    pub fn with_gate(mut self, gate: Arc<dyn Gate>) -> Self {
        self.register(gate);
        self
    }

    /// The built-in gates plus any configured command gates.
    pub fn standard(config: &GatesConfig) -> Self {
        let mut engine = Self::new()
            .with_gate(Arc::new(StoryFileGate))
            .with_gate(Arc::new(BudgetAvailableGate))
            .with_gate(Arc::new(DependenciesGate))
            .with_gate(Arc::new(OutputParseGate))
            .with_gate(Arc::new(VersionSyncGate::new(
                config.version_files.clone(),
                &config.changelog,
            )));
        for command in &config.commands {
            engine.register(Arc::new(CommandGate::new(command.clone())));
        }
        engine
    }

    pub fn gate_names(&self, tier: Tier) -> Vec<String> {
        self.ordered(tier).iter().map(|g| g.name().to_string()).collect()
    }

    /// Critical gates first, otherwise registration order.
    fn ordered(&self, tier: Tier) -> Vec<Arc<dyn Gate>> {
        let mut gates: Vec<Arc<dyn Gate>> = self
            .gates
            .iter()
            .filter(|g| g.tier() == tier)
            .cloned()
            .collect();
        gates.sort_by_key(|g| !g.critical());
        gates
    }

    pub async fn run(&self, tier: Tier, ctx: &GateContext) -> ValidationReport {
        let mut report = ValidationReport::new(tier);
        let gates = self.ordered(tier);

        for (idx, gate) in gates.iter().enumerate() {
            let check = gate.evaluate(ctx).await;
            let mut result = GateResult::from_check(gate.name(), check);

            if result.outcome == GateOutcome::Fail && self.auto_fix && gate.has_fix() {
                result = self.apply_fix(gate.as_ref(), ctx, result).await;
            }
            debug!(tier = %tier, gate = %result.name, outcome = %result.outcome, "gate evaluated");

            let stop = result.outcome == GateOutcome::Fail && gate.critical();
            report.results.push(result);
            if stop {
                report.skipped = gates[idx + 1..]
                    .iter()
                    .map(|g| g.name().to_string())
                    .collect();
                break;
            }
        }

        info!(
            story = %ctx.story_key,
            tier = %tier,
            outcome = %report.outcome(),
            gates = report.results.len(),
            "validation tier complete"
        );
        report
    }

    /// Fix once, then re-evaluate only this gate.
    async fn apply_fix(&self, gate: &dyn Gate, ctx: &GateContext, failed: GateResult) -> GateResult {
        match gate.fix(ctx).await {
            Ok(fix_detail) => {
                let recheck = GateResult::from_check(gate.name(), gate.evaluate(ctx).await);
                GateResult {
                    fix: Some(FixAttempt {
                        before: failed.outcome,
                        applied: true,
                        detail: fix_detail,
                        after: recheck.outcome,
                    }),
                    ..recheck
                }
            }
            Err(fix_error) => GateResult {
                fix: Some(FixAttempt {
                    before: failed.outcome,
                    applied: false,
                    detail: fix_error,
                    after: failed.outcome,
                }),
                ..failed
            },
        }
    }
}

/// `[gates]` section of `storyforge.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatesConfig {
    #[serde(default)]
    pub commands: Vec<CommandGateConfig>,
    #[serde(default = "default_version_files")]
    pub version_files: Vec<String>,
    #[serde(default = "default_changelog")]
    pub changelog: String,
}

fn default_version_files() -> Vec<String> {
    vec!["Cargo.toml".to_string(), "package.json".to_string()]
}

fn default_changelog() -> String {
    "CHANGELOG.md".to_string()
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            version_files: default_version_files(),
            changelog: default_changelog(),
        }
    }
}
