//! Agents are opaque, invocable units: they take a prompt plus context and
//! return output plus usage metrics.
//!
//! - [`Agent`]: the async trait every agent implements
//! - [`CommandAgent`]: spawns the configured agent CLI and parses its stream-json output
//! - [`ScriptedAgent`]: replays queued responses (tests and dry runs)
//! - [`persona`]: pure persona resolution (base + profile + overrides + memory)
//! - [`memory`]: per-agent scoped memory store

pub mod command;
pub mod memory;
pub mod persona;
pub mod scripted;
pub mod stream;

pub use command::{CommandAgent, CommandAgentConfig};
pub use memory::{MemoryEntry, MemoryStore};
pub use persona::{PersonaLayer, ResolvedAgentConfig, resolve};
pub use scripted::ScriptedAgent;

use crate::errors::AgentError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Token and cost usage of one agent invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl Usage {
    pub fn new(model: &str, input_tokens: u64, output_tokens: u64, cost: f64) -> Self {
        Self {
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cost,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.total_tokens() == 0 && self.cost <= 0.0
    }

    /// Add another usage record into this one. The model name of the first
    /// non-empty record wins.
    pub fn add(&mut self, other: &Usage) {
        if self.model.is_empty() {
            self.model = other.model.clone();
        }
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost += other.cost;
    }

    /// The part of `self` not already covered by `reported`, clamped at zero.
    pub fn remainder_after(&self, reported: &Usage) -> Usage {
        Usage {
            model: self.model.clone(),
            input_tokens: self.input_tokens.saturating_sub(reported.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(reported.output_tokens),
            cost: (self.cost - reported.cost).max(0.0),
        }
    }
}

/// Accumulates usage an agent reports while it is still running.
///
/// The scheduler commits whatever has been reported if the call is abandoned
/// by a hard cancel.
#[derive(Debug, Clone, Default)]
pub struct UsageReporter {
    inner: Arc<Mutex<Usage>>,
}

impl UsageReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, usage: &Usage) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.add(usage);
        }
    }

    pub fn snapshot(&self) -> Usage {
        self.inner
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

/// Input handed to an agent.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub story_key: String,
    pub phase: String,
    pub prompt: String,
    /// Prior outputs and feedback the agent should take into account.
    pub context: Vec<String>,
    pub reporter: UsageReporter,
}

impl AgentRequest {
    pub fn new(story_key: &str, phase: &str, prompt: impl Into<String>) -> Self {
        Self {
            story_key: story_key.to_string(),
            phase: phase.to_string(),
            prompt: prompt.into(),
            context: Vec::new(),
            reporter: UsageReporter::new(),
        }
    }

    pub fn with_context(mut self, context: Vec<String>) -> Self {
        self.context = context;
        self
    }

    pub fn with_reporter(mut self, reporter: UsageReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Prompt with context sections appended, as sent to text-based agents.
    pub fn render(&self) -> String {
        if self.context.is_empty() {
            return self.prompt.clone();
        }
        let mut out = self.prompt.clone();
        out.push_str("\n\n## CONTEXT\n");
        for (i, item) in self.context.iter().enumerate() {
            out.push_str(&format!("\n### Item {}\n{}\n", i + 1, item));
        }
        out
    }
}

/// Output of a successful agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub output: String,
    /// Total usage of the invocation, including anything already reported.
    pub usage: Usage,
}

impl AgentResponse {
    pub fn new(output: impl Into<String>, usage: Usage) -> Self {
        Self {
            output: output.into(),
            usage,
        }
    }
}

/// An invocable agent role.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Registry id of the role this agent plays (e.g. "developer").
    fn id(&self) -> &str;

    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentError>;
}

/// Agents available to a run, keyed by role id.
#[derive(Clone, Default)]
pub struct AgentPool {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.id().to_string(), agent);
    }

    pub fn with(mut self, agent: Arc<dyn Agent>) -> Self {
        self.insert(agent);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for AgentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPool").field("agents", &self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_add_accumulates_and_keeps_first_model() {
        let mut total = Usage::default();
        total.add(&Usage::new("sonnet", 100, 50, 0.25));
        total.add(&Usage::new("opus", 10, 5, 0.75));
        assert_eq!(total.model, "sonnet");
        assert_eq!(total.total_tokens(), 165);
        assert!((total.cost - 1.0).abs() < 1e-9);
    }

    #[test]
    fn remainder_after_clamps_at_zero() {
        let total = Usage::new("sonnet", 100, 50, 1.0);
        let reported = Usage::new("sonnet", 120, 10, 0.4);
        let rest = total.remainder_after(&reported);
        assert_eq!(rest.input_tokens, 0);
        assert_eq!(rest.output_tokens, 40);
        assert!((rest.cost - 0.6).abs() < 1e-9);
    }

    #[test]
    fn reporter_is_shared_between_clones() {
        let reporter = UsageReporter::new();
        let clone = reporter.clone();
        clone.report(&Usage::new("m", 1, 1, 0.1));
        reporter.report(&Usage::new("m", 1, 1, 0.1));
        assert_eq!(reporter.snapshot().total_tokens(), 4);
    }

    #[test]
    fn render_appends_context_sections() {
        let req = AgentRequest::new("s", "plan", "Do the thing")
            .with_context(vec!["first".into(), "second".into()]);
        let rendered = req.render();
        assert!(rendered.starts_with("Do the thing"));
        assert!(rendered.contains("### Item 2\nsecond"));
    }

    #[test]
    fn pool_lists_sorted_ids() {
        let pool = AgentPool::new()
            .with(Arc::new(ScriptedAgent::new("reviewer")))
            .with(Arc::new(ScriptedAgent::new("developer")));
        assert_eq!(pool.ids(), vec!["developer", "reviewer"]);
        assert!(pool.contains("reviewer"));
        assert!(pool.get("planner").is_none());
    }
}
