//! Persona resolution.
//!
//! A persona is assembled from up to three layers plus the agent's memory:
//! the base definition (`agents/<id>.yaml` or the registry default), the
//! profile from `storyforge.toml` (`[agents.<id>]`), and local overrides
//! (`agents/<id>.override.yaml`). Scalars take the value of the highest
//! layer that sets them (`overrides > profile > base`); lists are
//! concatenated base-first with duplicates removed.

use super::MemoryEntry;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One persona layer. All fields are optional so layers can be sparse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonaLayer {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub principles: Vec<String>,
    #[serde(default)]
    pub critical_actions: Vec<String>,
}

impl PersonaLayer {
    /// Load a layer from a YAML file, returning `None` when it does not exist.
    pub fn load_optional(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read persona file: {}", path.display()))?;
        let layer = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse persona file: {}", path.display()))?;
        Ok(Some(layer))
    }
}

/// Fully merged persona handed to an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAgentConfig {
    pub name: Option<String>,
    pub title: Option<String>,
    pub model: Option<String>,
    pub instructions: Option<String>,
    pub principles: Vec<String>,
    pub critical_actions: Vec<String>,
    pub memories: Vec<String>,
}

impl ResolvedAgentConfig {
    /// Render the persona as a prompt preamble.
    pub fn render_preamble(&self) -> String {
        let mut out = String::from("## PERSONA\n");
        match (&self.name, &self.title) {
            (Some(name), Some(title)) => out.push_str(&format!("You are {}, the {}.\n", name, title)),
            (None, Some(title)) => out.push_str(&format!("You are the {}.\n", title)),
            (Some(name), None) => out.push_str(&format!("You are {}.\n", name)),
            (None, None) => {}
        }
        if let Some(instructions) = &self.instructions {
            out.push_str(instructions);
            out.push('\n');
        }
        push_list(&mut out, "PRINCIPLES", &self.principles);
        push_list(&mut out, "CRITICAL ACTIONS", &self.critical_actions);
        push_list(&mut out, "MEMORY", &self.memories);
        out
    }
}

fn push_list(out: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("\n### {}\n", heading));
    for item in items {
        out.push_str(&format!("- {}\n", item));
    }
}

/// Merge persona layers. Pure and deterministic: the same inputs always
/// produce the same configuration.
pub fn resolve(
    base: &PersonaLayer,
    profile: Option<&PersonaLayer>,
    overrides: Option<&PersonaLayer>,
    memory: &[MemoryEntry],
) -> ResolvedAgentConfig {
    let layers: Vec<&PersonaLayer> = std::iter::once(base)
        .chain(profile)
        .chain(overrides)
        .collect();

    ResolvedAgentConfig {
        name: highest(&layers, |l| l.name.as_ref()),
        title: highest(&layers, |l| l.title.as_ref()),
        model: highest(&layers, |l| l.model.as_ref()),
        instructions: highest(&layers, |l| l.instructions.as_ref()),
        principles: concat(&layers, |l| &l.principles),
        critical_actions: concat(&layers, |l| &l.critical_actions),
        memories: memory.iter().map(|m| m.text.clone()).collect(),
    }
}

fn highest(
    layers: &[&PersonaLayer],
    pick: impl Fn(&PersonaLayer) -> Option<&String>,
) -> Option<String> {
    layers.iter().rev().find_map(|layer| pick(layer).cloned())
}

fn concat(layers: &[&PersonaLayer], pick: impl Fn(&PersonaLayer) -> &Vec<String>) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for layer in layers {
        for item in pick(layer) {
            if !merged.contains(item) {
                merged.push(item.clone());
            }
        }
    }
    merged
}
