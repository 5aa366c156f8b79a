//! Execution strategies for a phase's agents.
//!
//! - [`sequential`]: one agent, bounded retries
//! - [`pair`]: implementer and reviewer in a strict handshake
//! - [`swarm`]: concurrent rounds until a quorum agrees
//!
//! Every invocation goes through [`invoke`], which registers the call's
//! [`UsageReporter`] in the [`InFlight`] registry while it runs and hands the
//! final usage to the [`UsageSink`] as soon as the call completes. Usage is
//! therefore recorded in completion order, and a caller that abandons the
//! whole phase can still drain what in-flight calls reported.

pub mod pair;
pub mod sequential;
pub mod swarm;

pub use pair::{PairIncrement, PairTranscript};
pub use swarm::{ConsensusReport, SwarmRound};

use crate::agent::{Agent, AgentPool, AgentRequest, AgentResponse, Usage, UsageReporter};
use crate::errors::{AgentError, PipelineError};
use crate::router::Strategy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

fn default_max_swarm_iterations() -> u32 {
    3
}

fn default_swarm_round_timeout_secs() -> u64 {
    300
}

fn default_consensus_quorum() -> f64 {
    0.66
}

fn default_pair_max_increments() -> u32 {
    3
}

fn default_approval_marker() -> String {
    "APPROVED".to_string()
}

/// `[collab]` section of `storyforge.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollabConfig {
    #[serde(default = "default_max_swarm_iterations")]
    pub max_swarm_iterations: u32,
    /// Per-agent timeout within one swarm round.
    #[serde(default = "default_swarm_round_timeout_secs")]
    pub swarm_round_timeout_secs: u64,
    /// Fraction of the swarm that must share a position.
    #[serde(default = "default_consensus_quorum")]
    pub consensus_quorum: f64,
    #[serde(default = "default_pair_max_increments")]
    pub pair_max_increments: u32,
    /// Text in a reviewer's feedback that ends a pair session.
    #[serde(default = "default_approval_marker")]
    pub approval_marker: String,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            max_swarm_iterations: default_max_swarm_iterations(),
            swarm_round_timeout_secs: default_swarm_round_timeout_secs(),
            consensus_quorum: default_consensus_quorum(),
            pair_max_increments: default_pair_max_increments(),
            approval_marker: default_approval_marker(),
        }
    }
}

impl CollabConfig {
    pub fn swarm_round_timeout(&self) -> Duration {
        Duration::from_secs(self.swarm_round_timeout_secs)
    }
}

/// Receives the usage of every finished agent call.
pub trait UsageSink: Send + Sync {
    fn record(&self, agent: &str, usage: &Usage);
}

/// Calls currently awaiting an agent, with the usage they have reported so far.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    calls: Arc<Mutex<HashMap<u64, (String, UsageReporter)>>>,
    next: Arc<AtomicU64>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, agent: &str, reporter: UsageReporter) -> u64 {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut calls) = self.calls.lock() {
            calls.insert(ticket, (agent.to_string(), reporter));
        }
        ticket
    }

    fn release(&self, ticket: u64) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.remove(&ticket);
        }
    }

    pub fn len(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every registered call and return what each had reported.
    pub fn drain(&self) -> Vec<(String, Usage)> {
        let Ok(mut calls) = self.calls.lock() else {
            return Vec::new();
        };
        let mut drained: Vec<(u64, (String, UsageReporter))> = calls.drain().collect();
        drained.sort_by_key(|(ticket, _)| *ticket);
        drained
            .into_iter()
            .map(|(_, (agent, reporter))| (agent, reporter.snapshot()))
            .collect()
    }
}

/// Everything a strategy needs to call agents.
#[derive(Clone, Copy)]
pub struct CollabContext<'a> {
    pub pool: &'a AgentPool,
    pub sink: &'a dyn UsageSink,
    pub in_flight: &'a InFlight,
    pub config: &'a CollabConfig,
    /// Additional attempts after a failed agent call.
    pub agent_retries: u32,
}

impl<'a> CollabContext<'a> {
    pub fn new(
        pool: &'a AgentPool,
        sink: &'a dyn UsageSink,
        in_flight: &'a InFlight,
        config: &'a CollabConfig,
    ) -> Self {
        Self {
            pool,
            sink,
            in_flight,
            config,
            agent_retries: 0,
        }
    }

    pub fn with_retries(mut self, agent_retries: u32) -> Self {
        self.agent_retries = agent_retries;
        self
    }

    pub(crate) fn agent(&self, id: &str) -> Result<Arc<dyn Agent>, PipelineError> {
        self.pool.get(id).ok_or_else(|| {
            PipelineError::ConfigInvalid(format!(
                "agent '{}' is not available (configured: {})",
                id,
                self.pool.ids().join(", ")
            ))
        })
    }
}

/// Copy of `template` with its own usage reporter.
pub(crate) fn fresh_request(template: &AgentRequest) -> AgentRequest {
    template.clone().with_reporter(UsageReporter::new())
}

/// Invoke one agent, tracking it as in flight and recording its usage on completion.
///
/// With `limit` set, a call that runs too long is abandoned and reported as
/// [`AgentError::Timeout`] carrying whatever usage it had reported.
pub(crate) async fn invoke(
    ctx: &CollabContext<'_>,
    agent: &Arc<dyn Agent>,
    request: AgentRequest,
    limit: Option<Duration>,
) -> Result<AgentResponse, AgentError> {
    let reporter = request.reporter.clone();
    let ticket = ctx.in_flight.register(agent.id(), reporter.clone());

    let result = match limit {
        Some(limit) => match tokio::time::timeout(limit, agent.invoke(request)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout {
                agent: agent.id().to_string(),
                secs: limit.as_secs(),
                usage: reporter.snapshot(),
            }),
        },
        None => agent.invoke(request).await,
    };

    ctx.in_flight.release(ticket);
    let usage = match &result {
        Ok(response) => &response.usage,
        Err(e) => e.usage(),
    };
    ctx.sink.record(agent.id(), usage);
    result
}

/// What a strategy did beyond producing output.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabDetail {
    Single { agent: String, attempts: u32 },
    Pair(PairTranscript),
    Swarm(ConsensusReport),
}

/// Result of running one phase under a strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct CollabOutcome {
    pub output: String,
    /// Usage of every call made, including failed attempts.
    pub usage: Usage,
    pub detail: CollabDetail,
}

/// Run a phase under a resolved strategy. `lead` is the phase's own agent.
pub async fn execute(
    ctx: &CollabContext<'_>,
    strategy: &Strategy,
    lead: &str,
    agents: &[String],
    template: &AgentRequest,
) -> Result<CollabOutcome, PipelineError> {
    match strategy {
        Strategy::Sequential => sequential::run(ctx, lead, template).await,
        Strategy::Pair => match agents.iter().find(|a| a.as_str() != lead) {
            Some(reviewer) => pair::run(ctx, lead, reviewer, template).await,
            None => {
                warn!(phase = %template.phase, lead, "no reviewer available, pair runs sequentially");
                sequential::run(ctx, lead, template).await
            }
        },
        Strategy::Swarm {
            agents: swarm_agents,
            max_iterations,
        } => {
            let mut members = vec![lead.to_string()];
            members.extend(swarm_agents.iter().filter(|a| a.as_str() != lead).cloned());
            // A lone member would agree with itself.
            if members.len() < 2 {
                warn!(phase = %template.phase, lead, "swarm needs at least two agents, running sequentially");
                return sequential::run(ctx, lead, template).await;
            }
            swarm::run(ctx, &members, *max_iterations, template).await
        }
        Strategy::Auto => Err(PipelineError::ConfigInvalid(
            "strategy must be resolved before a phase runs".into(),
        )),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Sink that keeps every recorded usage in order.
    #[derive(Default)]
    pub struct RecordingSink {
        pub records: Mutex<Vec<(String, Usage)>>,
    }

    impl RecordingSink {
        pub fn agents(&self) -> Vec<String> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .map(|(a, _)| a.clone())
                .collect()
        }

        pub fn total_cost(&self) -> f64 {
            self.records.lock().unwrap().iter().map(|(_, u)| u.cost).sum()
        }
    }

    impl UsageSink for RecordingSink {
        fn record(&self, agent: &str, usage: &Usage) {
            self.records
                .lock()
                .unwrap()
                .push((agent.to_string(), usage.clone()));
        }
    }

    pub fn usage(cost: f64) -> Usage {
        Usage::new("sonnet", 100, 50, cost)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::agent::ScriptedAgent;

    #[test]
    fn test_collab_config_defaults_from_empty_toml() {
        let config: CollabConfig = toml::from_str("").unwrap();
        assert_eq!(config, CollabConfig::default());
        assert_eq!(config.max_swarm_iterations, 3);
        assert!((config.consensus_quorum - 0.66).abs() < 1e-9);
        assert_eq!(config.approval_marker, "APPROVED");
    }

    #[tokio::test]
    async fn test_invoke_records_usage_and_releases() {
        let pool = AgentPool::new().with(Arc::new(
            ScriptedAgent::new("developer").respond("done", usage(0.5)),
        ));
        let sink = RecordingSink::default();
        let in_flight = InFlight::new();
        let config = CollabConfig::default();
        let ctx = CollabContext::new(&pool, &sink, &in_flight, &config);

        let agent = ctx.agent("developer").unwrap();
        let response = invoke(&ctx, &agent, AgentRequest::new("S", "implement", "go"), None)
            .await
            .unwrap();
        assert_eq!(response.output, "done");
        assert!(in_flight.is_empty());
        assert_eq!(sink.agents(), vec!["developer"]);
    }

    #[tokio::test]
    async fn test_timeout_records_partial_usage() {
        let pool = AgentPool::new().with(Arc::new(
            ScriptedAgent::new("architect").report_then_hang(usage(0.3), Duration::from_secs(5)),
        ));
        let sink = RecordingSink::default();
        let in_flight = InFlight::new();
        let config = CollabConfig::default();
        let ctx = CollabContext::new(&pool, &sink, &in_flight, &config);

        let agent = ctx.agent("architect").unwrap();
        let err = invoke(
            &ctx,
            &agent,
            AgentRequest::new("S", "design", "go"),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AgentError::Timeout { .. }));
        assert!((sink.total_cost() - 0.3).abs() < 1e-9);
        assert!(in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_call_stays_drainable() {
        let pool = AgentPool::new().with(Arc::new(
            ScriptedAgent::new("developer").report_then_hang(usage(0.7), Duration::from_secs(5)),
        ));
        let sink = RecordingSink::default();
        let in_flight = InFlight::new();
        let config = CollabConfig::default();
        let ctx = CollabContext::new(&pool, &sink, &in_flight, &config);
        let agent = ctx.agent("developer").unwrap();

        let call = invoke(&ctx, &agent, AgentRequest::new("S", "implement", "go"), None);
        let abandoned = tokio::time::timeout(Duration::from_millis(100), call).await;
        assert!(abandoned.is_err());

        let drained = in_flight.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, "developer");
        assert!((drained[0].1.cost - 0.7).abs() < 1e-9);
        assert!(sink.agents().is_empty());
        assert!(in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_missing_agent_is_config_error() {
        let pool = AgentPool::new();
        let sink = RecordingSink::default();
        let in_flight = InFlight::new();
        let config = CollabConfig::default();
        let ctx = CollabContext::new(&pool, &sink, &in_flight, &config);

        let err = execute(
            &ctx,
            &Strategy::Sequential,
            "developer",
            &[],
            &AgentRequest::new("S", "implement", "go"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::ConfigInvalid(_)));
    }

    #[tokio::test]
    async fn test_pair_with_single_agent_runs_sequentially() {
        let pool = AgentPool::new().with(Arc::new(
            ScriptedAgent::new("developer").respond("solo", usage(0.1)),
        ));
        let sink = RecordingSink::default();
        let in_flight = InFlight::new();
        let config = CollabConfig::default();
        let ctx = CollabContext::new(&pool, &sink, &in_flight, &config);

        let outcome = execute(
            &ctx,
            &Strategy::Pair,
            "developer",
            &["developer".to_string()],
            &AgentRequest::new("S", "implement", "go"),
        )
        .await
        .unwrap();
        assert_eq!(outcome.output, "solo");
        assert!(matches!(outcome.detail, CollabDetail::Single { .. }));
    }

    #[tokio::test]
    async fn test_swarm_of_one_runs_sequentially() {
        let lead = Arc::new(
            ScriptedAgent::new("architect")
                .respond("<position>ship it</position>", usage(0.1))
                .respond("<position>ship it</position>", usage(0.1)),
        );
        let pool = AgentPool::new().with(lead.clone());
        let sink = RecordingSink::default();
        let in_flight = InFlight::new();
        let config = CollabConfig::default();
        let ctx = CollabContext::new(&pool, &sink, &in_flight, &config);
        let strategy = Strategy::Swarm {
            agents: vec!["architect".to_string()],
            max_iterations: 3,
        };

        let outcome = execute(
            &ctx,
            &strategy,
            "architect",
            &["architect".to_string()],
            &AgentRequest::new("S", "plan", "go"),
        )
        .await
        .unwrap();
        assert!(matches!(outcome.detail, CollabDetail::Single { .. }));
        assert_eq!(lead.call_count(), 1);
    }
}
