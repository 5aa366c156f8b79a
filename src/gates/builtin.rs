//! Gates every project gets without configuration.

use super::{Gate, GateCheck, GateContext, Tier};
use crate::budget::AMOUNT_EPSILON;
use crate::util::extract_json_object;
use async_trait::async_trait;
use regex::Regex;
use std::path::Path;

/// Tier 1, critical: the story file must exist.
pub struct StoryFileGate;

#[async_trait]
impl Gate for StoryFileGate {
    fn name(&self) -> &str {
        "story-file"
    }

    fn tier(&self) -> Tier {
        Tier::Preflight
    }

    fn critical(&self) -> bool {
        true
    }

    async fn evaluate(&self, ctx: &GateContext) -> GateCheck {
        if ctx.story_file.is_file() {
            GateCheck::pass(format!("{} present", ctx.story_file.display()))
        } else {
            GateCheck::fail(format!("{} not found", ctx.story_file.display()))
                .with_suggestion(format!("Create the story file for {}", ctx.story_key))
        }
    }
}

/// Tier 1, critical: the phase's budget category must be configured.
///
/// A reservation that would exceed the cap is only a warning here; the
/// ledger's reserve step decides, so the story can be blocked rather than
/// left waiting in its prior state.
pub struct BudgetAvailableGate;

#[async_trait]
impl Gate for BudgetAvailableGate {
    fn name(&self) -> &str {
        "budget-available"
    }

    fn tier(&self) -> Tier {
        Tier::Preflight
    }

    fn critical(&self) -> bool {
        true
    }

    async fn evaluate(&self, ctx: &GateContext) -> GateCheck {
        let Some(budget) = &ctx.budget else {
            return GateCheck::pass("no budget check requested");
        };
        let Some(cap) = budget.cap else {
            return GateCheck::fail(format!("no cap configured for category '{}'", budget.category))
                .with_suggestion(format!(
                    "Add `{} = <amount>` under [budget.caps] or set STORYFORGE_BUDGET_{}",
                    budget.category,
                    budget.category.to_uppercase()
                ));
        };
        let remaining = (cap - budget.spent).max(0.0);
        if budget.requested > remaining + AMOUNT_EPSILON {
            GateCheck::warn(format!(
                "'{}' has {:.2} of {:.2} remaining, phase estimate {:.2}",
                budget.category, remaining, cap, budget.requested
            ))
        } else {
            GateCheck::pass(format!(
                "'{}' has {:.2} of {:.2} remaining",
                budget.category, remaining, cap
            ))
        }
    }
}

/// Tier 1: declared dependencies must be satisfied.
pub struct DependenciesGate;

#[async_trait]
impl Gate for DependenciesGate {
    fn name(&self) -> &str {
        "dependencies"
    }

    fn tier(&self) -> Tier {
        Tier::Preflight
    }

    async fn evaluate(&self, ctx: &GateContext) -> GateCheck {
        if ctx.unmet_dependencies.is_empty() {
            GateCheck::pass("all dependencies satisfied")
        } else {
            GateCheck::fail(format!("unmet: {}", ctx.unmet_dependencies.join(", ")))
                .with_suggestion("Complete the listed dependencies first")
        }
    }
}

/// Tier 2: the phase produced output, and any JSON it claims to contain parses.
pub struct OutputParseGate;

#[async_trait]
impl Gate for OutputParseGate {
    fn name(&self) -> &str {
        "output-parse"
    }

    fn tier(&self) -> Tier {
        Tier::InterPhase
    }

    async fn evaluate(&self, ctx: &GateContext) -> GateCheck {
        let Some(output) = ctx.output.as_deref() else {
            return GateCheck::pass("no phase output to check");
        };
        if output.trim().is_empty() {
            return GateCheck::fail("phase output is empty");
        }
        let claims_json = output.contains("```json") || output.trim_start().starts_with('{');
        if !claims_json {
            return GateCheck::pass("text output");
        }
        match extract_json_object(output) {
            Some(json) => match serde_json::from_str::<serde_json::Value>(&json) {
                Ok(_) => GateCheck::pass("JSON output parses"),
                Err(e) => GateCheck::fail(format!("JSON output does not parse: {}", e)),
            },
            None => GateCheck::fail("JSON output is unterminated"),
        }
    }
}

/// Tier 3: the project version appears in the changelog.
pub struct VersionSyncGate {
    version_files: Vec<String>,
    changelog: String,
}

impl VersionSyncGate {
    pub fn new(version_files: Vec<String>, changelog: &str) -> Self {
        Self {
            version_files,
            changelog: changelog.to_string(),
        }
    }
}

/// Extract the package version from a manifest's contents.
pub fn manifest_version(file_name: &str, content: &str) -> Option<String> {
    let pattern = if file_name.ends_with(".json") {
        r#""version"\s*:\s*"([^"]+)""#
    } else {
        r#"(?m)^version\s*=\s*"([^"]+)""#
    };
    let re = Regex::new(pattern).ok()?;
    re.captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn read_versions(project_dir: &Path, files: &[String]) -> Vec<(String, String)> {
    files
        .iter()
        .filter_map(|name| {
            let content = std::fs::read_to_string(project_dir.join(name)).ok()?;
            manifest_version(name, &content).map(|v| (name.clone(), v))
        })
        .collect()
}

#[async_trait]
impl Gate for VersionSyncGate {
    fn name(&self) -> &str {
        "version-sync"
    }

    fn tier(&self) -> Tier {
        Tier::PostCompletion
    }

    async fn evaluate(&self, ctx: &GateContext) -> GateCheck {
        let versions = read_versions(&ctx.project_dir, &self.version_files);
        let Some((first_file, version)) = versions.first() else {
            return GateCheck::pass("no versioned manifests");
        };
        if let Some((other_file, other)) = versions.iter().find(|(_, v)| v != version) {
            return GateCheck::fail(format!(
                "{} has {} but {} has {}",
                first_file, version, other_file, other
            ))
            .with_suggestion("Align the manifest versions");
        }

        let changelog_path = ctx.project_dir.join(&self.changelog);
        let Ok(changelog) = std::fs::read_to_string(&changelog_path) else {
            return GateCheck::warn(format!("{} not found", self.changelog));
        };
        if changelog.contains(version.as_str()) {
            GateCheck::pass(format!("{} {} is in {}", first_file, version, self.changelog))
        } else {
            GateCheck::fail(format!("version {} missing from {}", version, self.changelog))
                .with_suggestion(format!("Add a `## [{}]` entry to {}", version, self.changelog))
        }
    }
}
