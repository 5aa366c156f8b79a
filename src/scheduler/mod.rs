//! Phase scheduler: drives one story through its phases.
//!
//! For every phase the scheduler runs preflight gates, reserves budget,
//! invokes the phase's agents under the routed strategy, runs inter-phase
//! gates and checkpoints. Once every phase is done the post-completion tier
//! decides whether the story reaches `done`.
//!
//! Budget and checkpoint state is shared across schedulers through the
//! [`BudgetLedger`] and [`CheckpointStore`]; a story is only ever driven by
//! one run at a time via [`StoryLocks`].

pub mod cancel;
pub mod locks;
pub mod outcome;

pub use cancel::{CancelHandle, CancelMode};
pub use locks::StoryLocks;
pub use outcome::StoryOutcome;

use crate::agent::{AgentPool, AgentRequest, MemoryEntry, MemoryStore, Usage};
use crate::budget::{BudgetEntry, BudgetLedger, ReserveDecision};
use crate::checkpoint::{
    Checkpoint, CheckpointId, CheckpointStore, CheckpointTrigger, CheckpointWriter, ContextMeter,
};
use crate::collab::{self, CollabConfig, CollabContext, CollabOutcome, InFlight, UsageSink};
use crate::config::Config;
use crate::errors::PipelineError;
use crate::gates::{BudgetSnapshot, GateContext, GateEngine, Tier, ValidationReport};
use crate::router::{AgentRegistry, CollaborationRouter, RoutingDecision, Strategy};
use crate::settings::StoryforgeToml;
use crate::story::{
    PhaseState, SprintStatus, Story, StoryDefinition, StorySnapshot, StoryStatus,
};
use crate::usage::{UsageEvent, UsageTracker};
use crate::util::write_atomic;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

fn default_agent_retries() -> u32 {
    2
}

fn default_checkpoint_context_tokens() -> u64 {
    100_000
}

fn default_checkpoint_timeout_ms() -> u64 {
    2000
}

fn default_agent_timeout_secs() -> u64 {
    1800
}

fn default_auto_fix() -> bool {
    true
}

/// `[pipeline]` section of `storyforge.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Additional attempts after a failed agent call.
    #[serde(default = "default_agent_retries")]
    pub agent_retries: u32,
    /// Estimated context size that triggers a checkpoint, and every multiple of it.
    #[serde(default = "default_checkpoint_context_tokens")]
    pub checkpoint_context_tokens: u64,
    /// How long a checkpoint write may hold up the run.
    #[serde(default = "default_checkpoint_timeout_ms")]
    pub checkpoint_timeout_ms: u64,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    /// Let gates apply their fix before failing.
    #[serde(default = "default_auto_fix")]
    pub auto_fix: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            agent_retries: default_agent_retries(),
            checkpoint_context_tokens: default_checkpoint_context_tokens(),
            checkpoint_timeout_ms: default_checkpoint_timeout_ms(),
            agent_timeout_secs: default_agent_timeout_secs(),
            auto_fix: default_auto_fix(),
        }
    }
}

impl PipelineConfig {
    pub fn checkpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.checkpoint_timeout_ms)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}

/// Bills every finished agent call of one phase to the tracker and ledger,
/// in completion order.
struct PhaseSink<'a> {
    tracker: &'a UsageTracker,
    ledger: &'a BudgetLedger,
    story: &'a str,
    phase: &'a str,
    category: &'a str,
    spent: Mutex<f64>,
}

impl<'a> PhaseSink<'a> {
    fn new(
        tracker: &'a UsageTracker,
        ledger: &'a BudgetLedger,
        story: &'a str,
        phase: &'a str,
        category: &'a str,
    ) -> Self {
        Self {
            tracker,
            ledger,
            story,
            phase,
            category,
            spent: Mutex::new(0.0),
        }
    }

    fn spent(&self) -> f64 {
        self.spent.lock().map(|s| *s).unwrap_or(0.0)
    }
}

impl UsageSink for PhaseSink<'_> {
    fn record(&self, agent: &str, usage: &Usage) {
        if usage.is_zero() {
            return;
        }
        self.tracker.record(
            UsageEvent::from_usage(usage).for_phase(self.story, self.phase, self.category),
        );
        let level = self.ledger.commit(self.story, self.category, usage.cost);
        if let Ok(mut spent) = self.spent.lock() {
            *spent += usage.cost;
        }
        debug!(
            story = self.story,
            phase = self.phase,
            category = self.category,
            agent,
            cost = usage.cost,
            level = %level,
            "usage committed"
        );
    }
}

/// Why a phase stopped without completing.
enum PhaseStop {
    Blocked(PipelineError, Option<ValidationReport>),
    Failed(PipelineError),
    Cancelled,
}

pub struct PhaseScheduler {
    config: Config,
    ledger: Arc<BudgetLedger>,
    store: Arc<CheckpointStore>,
    writer: CheckpointWriter,
    gates: GateEngine,
    router: CollaborationRouter,
    pool: AgentPool,
    tracker: Arc<UsageTracker>,
    memory: MemoryStore,
    locks: StoryLocks,
    pipeline: PipelineConfig,
    collab: CollabConfig,
    cancel: CancelHandle,
    strategy: Strategy,
}

impl PhaseScheduler {
    /// Build a scheduler from resolved settings. Must be called inside a
    /// tokio runtime; the checkpoint writer task is spawned here.
    pub fn new(config: Config, settings: &StoryforgeToml, pool: AgentPool) -> Self {
        let store = Arc::new(CheckpointStore::new(&config.checkpoints_dir));
        let writer = CheckpointWriter::spawn(store.clone(), settings.pipeline.checkpoint_timeout());
        Self {
            ledger: Arc::new(BudgetLedger::new(settings.budget.clone())),
            store,
            writer,
            gates: GateEngine::standard(&settings.gates).with_auto_fix(settings.pipeline.auto_fix),
            router: CollaborationRouter::new(
                AgentRegistry::builtin(),
                settings.collab.max_swarm_iterations,
            ),
            pool,
            tracker: Arc::new(UsageTracker::new(None)),
            memory: MemoryStore::new(&config.memory_dir),
            locks: StoryLocks::new(),
            pipeline: settings.pipeline.clone(),
            collab: settings.collab.clone(),
            cancel: CancelHandle::new(),
            strategy: Strategy::Sequential,
            config,
        }
    }

    /// Share a ledger with other schedulers.
    pub fn with_ledger(mut self, ledger: Arc<BudgetLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_locks(mut self, locks: StoryLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<UsageTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_gates(mut self, gates: GateEngine) -> Self {
        self.gates = gates;
        self
    }

    /// Requested strategy; `Auto` is resolved per story by the router.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<UsageTracker> {
        &self.tracker
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for queued checkpoint writes to finish.
    pub async fn shutdown(self) {
        self.writer.shutdown().await;
    }

    /// Materialize `key` from its definition in `backlog`.
    pub fn materialize(&self, key: &str) -> Result<Story, PipelineError> {
        crate::story::validate_key(key)?;
        let def = StoryDefinition::load(&self.config.stories_dir, key)
            .map_err(|e| PipelineError::ConfigInvalid(format!("{:#}", e)))?;
        Story::from_definition(key, &def, self.ledger.config())
    }

    /// Rebuild `key` from its latest checkpoint, or from its definition if it
    /// has none. Returns the story and its context-token estimate.
    ///
    /// Phases that were not done are reset to pending. Caps come from the
    /// current configuration; spend comes from the checkpoint. The status is
    /// taken from the sprint table when the story is listed there.
    pub fn load_story(&self, key: &str) -> Result<(Story, u64), PipelineError> {
        let fresh = self.materialize(key)?;
        let latest = self
            .store
            .latest(key)
            .map_err(|e| PipelineError::CheckpointUnavailable(e.to_string()))?;

        let (mut story, tokens) = match latest {
            Some(checkpoint) => {
                let snapshot: StorySnapshot = checkpoint
                    .state()
                    .map_err(|e| PipelineError::CheckpointUnavailable(e.to_string()))?;
                info!(story = key, checkpoint = %checkpoint.id(), "rehydrating from checkpoint");
                let mut story = snapshot.story;
                for phase in story.phases.iter_mut().filter(|p| !p.is_done()) {
                    phase.state = PhaseState::Pending;
                    phase.started_at = None;
                    phase.ended_at = None;
                }
                story.budget = rebase_budget(fresh.budget, &story.budget);
                (story, snapshot.context_tokens)
            }
            None => (fresh, 0),
        };

        match SprintStatus::load(&self.config.sprint_status_file) {
            Ok(table) => {
                if let Some(status) = table.get(key) {
                    story.status = status;
                }
            }
            Err(e) => warn!(story = key, error = %e, "sprint status unreadable"),
        }
        Ok((story, tokens))
    }

    /// Continue `key` from its latest checkpoint.
    pub async fn resume(&self, key: &str) -> Result<StoryOutcome, PipelineError> {
        let (story, tokens) = self.load_story(key)?;
        self.run(story, tokens).await
    }

    /// Drive `story` until it is done, blocked, failed or cancelled.
    ///
    /// `Err` is only returned for configuration problems found before the
    /// story moves; every other stop is reported in the outcome.
    pub async fn advance(&self, story: Story) -> Result<StoryOutcome, PipelineError> {
        self.run(story, 0).await
    }

    async fn run(&self, mut story: Story, context_tokens: u64) -> Result<StoryOutcome, PipelineError> {
        let _guard = self.locks.acquire(&story.key).await;
        if story.status.is_terminal() {
            return Ok(StoryOutcome::new(story));
        }
        self.check_agents(&story)?;

        let routing = self.route(&story);
        info!(
            story = %story.key,
            strategy = %routing.strategy,
            agents = %routing.agents.join(","),
            "story routed"
        );

        let key = story.key.clone();
        self.ledger.open_story(&key, story.budget.clone());
        self.set_status(&mut story, StoryStatus::Drafted);
        // A blocked story stays blocked until a phase passes preflight.
        story.budget = self.ledger.entries(&key);

        let mut meter = ContextMeter::resume(self.pipeline.checkpoint_context_tokens, context_tokens);
        let mut last_checkpoint = None;
        let mut transitions = Vec::new();

        while let Some(index) = story.next_phase() {
            if self.cancel.mode() != CancelMode::None {
                info!(story = %key, phase = %story.phases[index].name, "run cancelled before phase");
                let mut outcome = self.finish(story, last_checkpoint);
                outcome.cancelled = true;
                outcome.gate_transitions = transitions;
                return Ok(outcome);
            }

            let phase_name = story.phases[index].name.clone();
            match self
                .run_phase(&mut story, index, &routing, &mut meter, &mut last_checkpoint, &mut transitions)
                .await?
            {
                None => {}
                Some(stop) => {
                    let mut outcome = self
                        .stop(story, &phase_name, stop, meter.estimated_tokens(), last_checkpoint)
                        .await;
                    outcome.gate_transitions = transitions;
                    return Ok(outcome);
                }
            }
        }

        // Stories rehydrated past their last phase still walk the lifecycle.
        self.walk_to_in_progress(&mut story);
        self.set_status(&mut story, StoryStatus::Review);
        let ctx = self.gate_context(&key);
        let report = self.gates.run(Tier::PostCompletion, &ctx).await;
        transitions.extend(report.transitions());
        if !report.passed() {
            warn!(story = %key, gates = %report.failing_gates().join(","), "post-completion validation failed");
            let err = PipelineError::ValidationFailed {
                tier: Tier::PostCompletion,
                phase: "completion".to_string(),
                report: report.clone(),
            };
            let mut outcome = self
                .stop(
                    story,
                    "completion",
                    PhaseStop::Blocked(err, Some(report)),
                    meter.estimated_tokens(),
                    last_checkpoint,
                )
                .await;
            outcome.gate_transitions = transitions;
            return Ok(outcome);
        }

        self.set_status(&mut story, StoryStatus::Done);
        let mut outcome = self.finish(story, last_checkpoint);
        self.archive(&outcome.story);
        self.ledger.close_story(&key);
        info!(story = %key, spent = outcome.story.total_spent(), "story done");
        outcome.report = Some(report);
        outcome.gate_transitions = transitions;
        Ok(outcome)
    }

    /// Run one phase. `Ok(None)` means the phase completed.
    async fn run_phase(
        &self,
        story: &mut Story,
        index: usize,
        routing: &RoutingDecision,
        meter: &mut ContextMeter,
        last_checkpoint: &mut Option<CheckpointId>,
        transitions: &mut Vec<String>,
    ) -> Result<Option<PhaseStop>, PipelineError> {
        let key = story.key.clone();
        let phase = story.phases[index].clone();
        let requested = phase
            .estimate
            .unwrap_or(self.ledger.config().default_phase_estimate);

        // Tier 1: nothing is charged if this fails.
        let ctx = self.preflight_context(story, index, self.ledger.entry(&key, &phase.category));
        let report = self.gates.run(Tier::Preflight, &ctx).await;
        transitions.extend(report.transitions());
        if !report.passed() {
            warn!(story = %key, phase = %phase.name, gates = %report.failing_gates().join(","), "preflight failed");
            let err = PipelineError::ValidationFailed {
                tier: Tier::Preflight,
                phase: phase.name.clone(),
                report: report.clone(),
            };
            return Ok(Some(PhaseStop::Blocked(err, Some(report))));
        }

        self.walk_to_in_progress(story);

        if let ReserveDecision::Deny { requested, spent, cap } =
            self.ledger.reserve(&key, &phase.category, requested)
        {
            story.phases[index].state = PhaseState::Blocked;
            return Ok(Some(PhaseStop::Blocked(
                PipelineError::BudgetExceeded {
                    story: key,
                    phase: phase.name,
                    category: phase.category,
                    requested,
                    spent,
                    cap,
                },
                None,
            )));
        }

        story.phases[index].state = PhaseState::Running;
        story.phases[index].started_at = Some(Utc::now());
        info!(story = %key, phase = %phase.name, agent = %phase.agent, category = %phase.category, "phase started");
        self.checkpoint(story, &phase.name, CheckpointTrigger::PhaseStart, meter.estimated_tokens(), last_checkpoint)
            .await;

        let template = AgentRequest::new(&key, &phase.name, self.build_prompt(story, index))
            .with_context(story.prior_outputs(index));
        let input_chars = template.render().len();
        if meter.add(input_chars) {
            self.checkpoint(story, &phase.name, CheckpointTrigger::ContextThreshold, meter.estimated_tokens(), last_checkpoint)
                .await;
        }

        let in_flight = InFlight::new();
        let sink = PhaseSink::new(&self.tracker, &self.ledger, &key, &phase.name, &phase.category);
        let result = {
            let ctx = CollabContext::new(&self.pool, &sink, &in_flight, &self.collab)
                .with_retries(self.pipeline.agent_retries);
            tokio::select! {
                biased;
                _ = self.cancel.hard_cancelled() => None,
                result = collab::execute(&ctx, &routing.strategy, &phase.agent, &routing.agents, &template) => Some(result),
            }
        };

        let Some(result) = result else {
            // Abandoned calls still bill what they reported.
            for (agent, usage) in in_flight.drain() {
                sink.record(&agent, &usage);
            }
            let spent = sink.spent();
            let current = &mut story.phases[index];
            current.spent += spent;
            current.state = PhaseState::Pending;
            current.started_at = None;
            warn!(story = %key, phase = %phase.name, committed = spent, "phase abandoned by hard cancel");
            return Ok(Some(PhaseStop::Cancelled));
        };
        story.phases[index].spent += sink.spent();

        let CollabOutcome { output, detail, .. } = match result {
            Ok(outcome) => outcome,
            Err(PipelineError::ConfigInvalid(message)) => {
                story.phases[index].state = PhaseState::Pending;
                return Err(PipelineError::ConfigInvalid(message));
            }
            Err(err @ PipelineError::AgentError { .. }) => {
                story.phases[index].state = PhaseState::Failed;
                return Ok(Some(PhaseStop::Failed(err)));
            }
            Err(err) => {
                story.phases[index].state = PhaseState::Blocked;
                return Ok(Some(PhaseStop::Blocked(err, None)));
            }
        };
        debug!(story = %key, phase = %phase.name, detail = ?detail, "phase executed");

        if meter.add(output.len()) {
            self.checkpoint(story, &phase.name, CheckpointTrigger::ContextThreshold, meter.estimated_tokens(), last_checkpoint)
                .await;
        }

        let ctx = self.gate_context(&key).with_phase(&phase.name).with_output(&output);
        let report = self.gates.run(Tier::InterPhase, &ctx).await;
        transitions.extend(report.transitions());
        if !report.passed() {
            warn!(story = %key, phase = %phase.name, gates = %report.failing_gates().join(","), "inter-phase validation failed");
            story.phases[index].state = PhaseState::Blocked;
            story.phases[index].output = Some(output);
            let err = PipelineError::ValidationFailed {
                tier: Tier::InterPhase,
                phase: phase.name.clone(),
                report: report.clone(),
            };
            return Ok(Some(PhaseStop::Blocked(err, Some(report))));
        }

        self.remember(&key, &phase.agent, &phase.name, &output);
        let current = &mut story.phases[index];
        current.output = Some(output);
        current.state = PhaseState::Done;
        current.ended_at = Some(Utc::now());
        info!(story = %key, phase = %phase.name, spent = current.spent, "phase done");
        self.checkpoint(story, &phase.name, CheckpointTrigger::PhaseEnd, meter.estimated_tokens(), last_checkpoint)
            .await;

        // Overruns committed during the phase take effect at the checkpoint boundary.
        if let Some(overrun) = self.ledger.take_exceeded(&key).pop() {
            return Ok(Some(PhaseStop::Blocked(
                PipelineError::BudgetExceeded {
                    story: key,
                    phase: phase.name,
                    category: overrun.category,
                    requested: 0.0,
                    spent: overrun.spent,
                    cap: overrun.cap,
                },
                None,
            )));
        }
        Ok(None)
    }

    fn check_agents(&self, story: &Story) -> Result<(), PipelineError> {
        let missing: Vec<&str> = story
            .phases
            .iter()
            .map(|p| p.agent.as_str())
            .filter(|agent| !self.pool.contains(agent))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::ConfigInvalid(format!(
                "story {} uses agents that are not configured: {}",
                story.key,
                missing.join(", ")
            )))
        }
    }

    /// Route on the story description and drop agents the pool cannot run.
    fn route(&self, story: &Story) -> RoutingDecision {
        let task = story.description.as_deref().unwrap_or(&story.key);
        let mut decision = self.router.route(task, self.strategy.clone());
        decision.agents.retain(|a| self.pool.contains(a));
        if let Strategy::Swarm { agents, .. } = &mut decision.strategy {
            agents.retain(|a| self.pool.contains(a));
        }
        decision
    }

    /// Run one validation tier against `story` outside of a pipeline run.
    ///
    /// Preflight targets the next pending phase; inter-phase re-checks the
    /// most recent phase output.
    pub async fn validate(&self, story: &Story, tier: Tier) -> ValidationReport {
        let ctx = match tier {
            Tier::Preflight => match story.next_phase() {
                Some(index) => {
                    let category = &story.phases[index].category;
                    let entry = story.budget.iter().find(|e| &e.category == category).cloned();
                    self.preflight_context(story, index, entry)
                }
                None => self.gate_context(&story.key),
            },
            Tier::InterPhase => {
                let last = story.phases.iter().rev().find_map(|p| p.output.as_deref().map(|o| (p, o)));
                match last {
                    Some((phase, output)) => self
                        .gate_context(&story.key)
                        .with_phase(&phase.name)
                        .with_output(output),
                    None => self.gate_context(&story.key),
                }
            }
            Tier::PostCompletion => self.gate_context(&story.key),
        };
        self.gates.run(tier, &ctx).await
    }

    fn gate_context(&self, key: &str) -> GateContext {
        GateContext::new(self.config.project_dir.clone(), key, self.config.story_file(key))
    }

    fn preflight_context(&self, story: &Story, index: usize, entry: Option<BudgetEntry>) -> GateContext {
        let phase = &story.phases[index];
        let requested = phase
            .estimate
            .unwrap_or(self.ledger.config().default_phase_estimate);
        let sprint = SprintStatus::load(&self.config.sprint_status_file).unwrap_or_default();
        let unmet = story.unmet_dependencies(index, |dep| sprint.get(dep) == Some(StoryStatus::Done));
        self.gate_context(&story.key)
            .with_phase(&phase.name)
            .with_budget(BudgetSnapshot {
                category: phase.category.clone(),
                requested,
                cap: entry.as_ref().map(|e| e.cap),
                spent: entry.as_ref().map(|e| e.spent).unwrap_or(0.0),
            })
            .with_unmet_dependencies(unmet)
    }

    fn build_prompt(&self, story: &Story, index: usize) -> String {
        let phase = &story.phases[index];
        let story_text = std::fs::read_to_string(self.config.story_file(&story.key)).unwrap_or_default();
        format!(
            "You are the {} agent running phase '{}' ({} of {}) of story {}.\n\n{}",
            phase.agent,
            phase.name,
            index + 1,
            story.phases.len(),
            story.key,
            story_text.trim()
        )
    }

    fn walk_to_in_progress(&self, story: &mut Story) {
        for next in [StoryStatus::ReadyForDev, StoryStatus::InProgress] {
            self.set_status(story, next);
        }
    }

    /// Apply a lifecycle transition and mirror it into the sprint table.
    fn set_status(&self, story: &mut Story, next: StoryStatus) -> bool {
        let from = story.status;
        if !story.transition(next) {
            return false;
        }
        info!(story = %story.key, from = %from, to = %next, "story status changed");
        if let Err(e) = SprintStatus::update(&self.config.sprint_status_file, &story.key, next) {
            warn!(story = %story.key, error = %e, "failed to update sprint status");
        }
        true
    }

    /// Publish a checkpoint of the current state. Never fails the run.
    async fn checkpoint(
        &self,
        story: &mut Story,
        phase: &str,
        trigger: CheckpointTrigger,
        tokens: u64,
        last: &mut Option<CheckpointId>,
    ) {
        story.budget = self.ledger.entries(&story.key);
        let snapshot = StorySnapshot {
            story: story.clone(),
            context_tokens: tokens,
        };
        let published = match Checkpoint::capture(&story.key, phase, trigger, &snapshot, tokens) {
            Ok(checkpoint) => self.writer.publish(checkpoint).await,
            Err(e) => Err(PipelineError::CheckpointUnavailable(e.to_string())),
        };
        match published {
            Ok(id) => {
                debug!(story = %story.key, phase, trigger = %trigger, sequence = id.sequence, "checkpoint written");
                *last = Some(id);
            }
            Err(e) => {
                warn!(story = %story.key, phase, trigger = %trigger, error = %e, "recoverability degraded: checkpoint not written");
            }
        }
    }

    fn remember(&self, key: &str, agent: &str, phase: &str, output: &str) {
        let first_line = output.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
        let text = format!("Completed phase '{}' of {}: {}", phase, key, first_line);
        if let Err(e) = self.memory.append(agent, &MemoryEntry::new(Some(key), &text)) {
            warn!(story = key, agent, error = %e, "failed to append agent memory");
        }
    }

    fn archive(&self, story: &Story) {
        let path = self.config.archive_file(&story.key);
        let result = serde_json::to_vec_pretty(story)
            .map_err(anyhow::Error::from)
            .and_then(|json| write_atomic(&path, &json));
        if let Err(e) = result {
            warn!(story = %story.key, error = %e, "failed to archive story");
        }
    }

    fn finish(&self, mut story: Story, checkpoint: Option<CheckpointId>) -> StoryOutcome {
        story.budget = self.ledger.entries(&story.key);
        let mut outcome = StoryOutcome::new(story);
        outcome.checkpoint = checkpoint;
        outcome
    }

    async fn stop(
        &self,
        mut story: Story,
        phase: &str,
        stop: PhaseStop,
        tokens: u64,
        mut checkpoint: Option<CheckpointId>,
    ) -> StoryOutcome {
        // Spend committed since the last checkpoint must survive a resume.
        let mut unsaved = self.ledger.entries(&story.key) != story.budget;
        let (error, report, cancelled) = match stop {
            PhaseStop::Blocked(err, report) => {
                // Preflight failures leave the story where it was.
                let preflight = matches!(
                    err,
                    PipelineError::ValidationFailed { tier: Tier::Preflight, .. }
                );
                if !preflight {
                    self.set_status(&mut story, StoryStatus::Blocked);
                }
                warn!(story = %story.key, phase, error = %err, "story stopped");
                (Some(err), report, false)
            }
            PhaseStop::Failed(err) => {
                self.set_status(&mut story, StoryStatus::Failed);
                warn!(story = %story.key, phase, error = %err, "story failed");
                (Some(err), None, false)
            }
            PhaseStop::Cancelled => {
                unsaved = true;
                (None, None, true)
            }
        };
        if unsaved {
            self.checkpoint(&mut story, phase, CheckpointTrigger::Manual, tokens, &mut checkpoint)
                .await;
        }

        if checkpoint.is_none() {
            checkpoint = self.store.latest(&story.key).ok().flatten().map(|c| c.id());
        }
        let mut outcome = self.finish(story, checkpoint);
        outcome.blocked = error;
        outcome.report = report;
        outcome.phase = Some(phase.to_string());
        outcome.cancelled = cancelled;
        outcome
    }
}

/// Current caps with the spend recorded in `previous`.
fn rebase_budget(current: Vec<BudgetEntry>, previous: &[BudgetEntry]) -> Vec<BudgetEntry> {
    let mut rebased: Vec<BudgetEntry> = current
        .into_iter()
        .map(|mut entry| {
            if let Some(old) = previous.iter().find(|p| p.category == entry.category) {
                entry.spent = old.spent;
            }
            entry
        })
        .collect();
    for old in previous {
        if !rebased.iter().any(|e| e.category == old.category) {
            rebased.push(old.clone());
        }
    }
    rebased
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ScriptedAgent;
    use crate::collab::test_support::usage;
    use crate::gates::{Gate, GateCheck};
    use crate::story::PhaseDefinition;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        config: Config,
    }

    fn fixture(stories: &[&str]) -> Fixture {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        config.ensure_directories().unwrap();
        for key in stories {
            std::fs::write(config.story_file(key), format!("# {}\n\nAs a user I want it.", key)).unwrap();
        }
        Fixture { _dir: dir, config }
    }

    fn scripted(id: &str, output: &str, cost: f64) -> Arc<ScriptedAgent> {
        Arc::new(ScriptedAgent::new(id).repeat(output, usage(cost)))
    }

    fn standard_pool() -> AgentPool {
        AgentPool::new()
            .with(scripted("planner", "Plan: add login form", 0.5))
            .with(scripted("developer", "Implemented login form", 1.0))
            .with(scripted("reviewer", "Review: looks good", 0.25))
    }

    fn scheduler(fx: &Fixture, pool: AgentPool) -> PhaseScheduler {
        PhaseScheduler::new(fx.config.clone(), &StoryforgeToml::default(), pool)
    }

    fn phase(name: &str, agent: &str, category: &str, estimate: f64) -> PhaseDefinition {
        PhaseDefinition {
            estimate: Some(estimate),
            ..PhaseDefinition::new(name, agent, category)
        }
    }

    fn story_with(key: &str, phases: Vec<PhaseDefinition>, caps: &[(&str, f64)]) -> Story {
        let def = StoryDefinition {
            phases,
            budget: caps.iter().map(|(c, v)| (c.to_string(), *v)).collect::<BTreeMap<_, _>>(),
            ..Default::default()
        };
        Story::from_definition(key, &def, &crate::budget::BudgetConfig::default()).unwrap()
    }

    /// Tier-2 gate that fails until its fix has been applied.
    struct LintGate {
        fixed: AtomicBool,
    }

    #[async_trait]
    impl Gate for LintGate {
        fn name(&self) -> &str {
            "lint"
        }

        fn tier(&self) -> Tier {
            Tier::InterPhase
        }

        async fn evaluate(&self, _ctx: &GateContext) -> GateCheck {
            if self.fixed.load(Ordering::SeqCst) {
                GateCheck::pass("clean")
            } else {
                GateCheck::fail("2 warnings")
            }
        }

        fn has_fix(&self) -> bool {
            true
        }

        async fn fix(&self, _ctx: &GateContext) -> Result<String, String> {
            self.fixed.store(true, Ordering::SeqCst);
            Ok("formatted".into())
        }
    }

    /// Tier-2 gate that fails its first `failures` evaluations, without a fix.
    struct FlakyGate {
        failures: usize,
        seen: AtomicUsize,
    }

    #[async_trait]
    impl Gate for FlakyGate {
        fn name(&self) -> &str {
            "flaky"
        }

        fn tier(&self) -> Tier {
            Tier::InterPhase
        }

        async fn evaluate(&self, _ctx: &GateContext) -> GateCheck {
            if self.seen.fetch_add(1, Ordering::SeqCst) < self.failures {
                GateCheck::fail("transient")
            } else {
                GateCheck::pass("ok")
            }
        }
    }

    // =========================================
    // Happy path
    // =========================================

    #[tokio::test]
    async fn test_story_runs_to_done() {
        let fx = fixture(&["1-1-login"]);
        let scheduler = scheduler(&fx, standard_pool());
        let story = scheduler.materialize("1-1-login").unwrap();

        let outcome = scheduler.advance(story).await.unwrap();

        assert_eq!(outcome.status, StoryStatus::Done);
        assert_eq!(outcome.exit_code(), 0);
        assert!(outcome.story.is_complete());
        assert!((outcome.story.total_spent() - 1.75).abs() < 1e-9);
        assert_eq!(
            outcome.story.phase("implement").unwrap().output.as_deref(),
            Some("Implemented login form")
        );
        assert_eq!(scheduler.tracker().events().len(), 3);

        let table = SprintStatus::load(&fx.config.sprint_status_file).unwrap();
        assert_eq!(table.get("1-1-login"), Some(StoryStatus::Done));
        assert!(fx.config.archive_file("1-1-login").exists());

        // Start and end checkpoint per phase, strictly increasing.
        let checkpoints = scheduler.store().list("1-1-login").unwrap();
        assert_eq!(checkpoints.len(), 6);
        assert!(checkpoints.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert_eq!(checkpoints[5].trigger, CheckpointTrigger::PhaseEnd);

        let memory = MemoryStore::new(&fx.config.memory_dir).read("developer").unwrap();
        assert_eq!(memory.len(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_phases_see_prior_outputs() {
        let fx = fixture(&["S"]);
        let developer = scripted("developer", "code", 1.0);
        let pool = AgentPool::new()
            .with(scripted("planner", "the plan", 0.5))
            .with(developer.clone())
            .with(scripted("reviewer", "ok", 0.25));
        let scheduler = scheduler(&fx, pool);

        scheduler.advance(scheduler.materialize("S").unwrap()).await.unwrap();

        let calls = developer.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].context[0].contains("the plan"));
        assert!(calls[0].prompt.contains("As a user I want it."));
    }

    // =========================================
    // Preflight
    // =========================================

    #[tokio::test]
    async fn test_preflight_failure_spends_nothing() {
        let fx = fixture(&[]);
        let planner = scripted("planner", "plan", 0.5);
        let pool = AgentPool::new()
            .with(planner.clone())
            .with(scripted("developer", "code", 1.0))
            .with(scripted("reviewer", "ok", 0.25));
        let scheduler = scheduler(&fx, pool);

        let outcome = scheduler
            .advance(scheduler.materialize("missing-story").unwrap())
            .await
            .unwrap();

        assert_eq!(outcome.status, StoryStatus::Drafted);
        assert_eq!(outcome.exit_code(), 2);
        assert!(matches!(
            outcome.blocked,
            Some(PipelineError::ValidationFailed { tier: Tier::Preflight, .. })
        ));
        let report = outcome.report.unwrap();
        assert_eq!(report.failing_gates(), vec!["story-file"]);
        assert!(!report.skipped.is_empty());
        assert_eq!(planner.call_count(), 0);
        assert!(scheduler.tracker().events().is_empty());
        assert_eq!(scheduler.ledger().entry("missing-story", "planning").unwrap().spent, 0.0);
    }

    #[tokio::test]
    async fn test_validate_outside_run() {
        let fx = fixture(&["S"]);
        let scheduler = scheduler(&fx, AgentPool::new());

        let story = scheduler.materialize("S").unwrap();
        let report = scheduler.validate(&story, Tier::Preflight).await;
        assert!(report.passed(), "{}", report.render());

        let missing = scheduler.materialize("nope").unwrap();
        let report = scheduler.validate(&missing, Tier::Preflight).await;
        assert_eq!(report.failing_gates(), vec!["story-file"]);
        assert!(!fx.config.sprint_status_file.exists());
    }

    #[tokio::test]
    async fn test_missing_agent_is_config_invalid() {
        let fx = fixture(&["S"]);
        let scheduler = scheduler(&fx, AgentPool::new().with(scripted("planner", "p", 0.1)));
        let story = scheduler.materialize("S").unwrap();

        let err = scheduler.advance(story).await.unwrap_err();
        assert!(matches!(err, PipelineError::ConfigInvalid(_)));
        assert!(err.to_string().contains("developer"));
        // Story never left backlog.
        assert!(!fx.config.sprint_status_file.exists());
    }

    // =========================================
    // Budget
    // =========================================

    #[tokio::test]
    async fn test_reserve_denial_blocks_before_third_phase() {
        let fx = fixture(&["S"]);
        let developer = Arc::new(
            ScriptedAgent::new("developer")
                .respond("part one", usage(6.0))
                .respond("part two", usage(9.0))
                .respond("part three", usage(4.0)),
        );
        let scheduler = scheduler(&fx, AgentPool::new().with(developer.clone()));
        let story = story_with(
            "S",
            vec![
                phase("one", "developer", "implementation", 6.0),
                phase("two", "developer", "implementation", 9.0),
                phase("three", "developer", "implementation", 4.0),
            ],
            &[("implementation", 15.0)],
        );

        let outcome = scheduler.advance(story).await.unwrap();

        assert_eq!(outcome.status, StoryStatus::Blocked);
        assert_eq!(outcome.phase.as_deref(), Some("three"));
        match &outcome.blocked {
            Some(PipelineError::BudgetExceeded { category, requested, spent, cap, .. }) => {
                assert_eq!(category, "implementation");
                assert_eq!(*requested, 4.0);
                assert_eq!(*spent, 15.0);
                assert_eq!(*cap, 15.0);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(developer.call_count(), 2);
        assert_eq!(scheduler.ledger().entry("S", "implementation").unwrap().spent, 15.0);
        assert!(outcome.checkpoint.is_some());
        assert!(outcome.summary().contains("storyforge checkpoint restore S@"));
    }

    #[tokio::test]
    async fn test_post_hoc_overrun_blocks_after_phase_end_checkpoint() {
        let fx = fixture(&["S"]);
        let scheduler = scheduler(&fx, AgentPool::new().with(scripted("planner", "big plan", 3.0)));
        let story = story_with(
            "S",
            vec![
                phase("plan", "planner", "planning", 1.0),
                phase("replan", "planner", "planning", 1.0),
            ],
            &[("planning", 2.0)],
        );

        let outcome = scheduler.advance(story).await.unwrap();

        assert_eq!(outcome.status, StoryStatus::Blocked);
        assert!(matches!(outcome.blocked, Some(PipelineError::BudgetExceeded { .. })));
        assert!(outcome.story.phase("plan").unwrap().is_done());
        assert_eq!(outcome.story.phase("replan").unwrap().state, PhaseState::Pending);
        let latest = scheduler.store().latest("S").unwrap().unwrap();
        assert_eq!(latest.trigger, CheckpointTrigger::PhaseEnd);
        assert_eq!(latest.phase_name, "plan");
    }

    // =========================================
    // Agents
    // =========================================

    #[tokio::test]
    async fn test_agent_exhaustion_fails_story() {
        let fx = fixture(&["S"]);
        let planner = Arc::new(ScriptedAgent::new("planner"));
        let pool = AgentPool::new()
            .with(planner.clone())
            .with(scripted("developer", "code", 1.0))
            .with(scripted("reviewer", "ok", 0.25));
        let scheduler = scheduler(&fx, pool);

        let outcome = scheduler.advance(scheduler.materialize("S").unwrap()).await.unwrap();

        assert_eq!(outcome.status, StoryStatus::Failed);
        assert_eq!(outcome.exit_code(), 1);
        assert!(matches!(outcome.blocked, Some(PipelineError::AgentError { attempts: 3, .. })));
        assert_eq!(planner.call_count(), 3);
        assert_eq!(outcome.story.phase("plan").unwrap().state, PhaseState::Failed);
    }

    // =========================================
    // Inter-phase gates
    // =========================================

    #[tokio::test]
    async fn test_lint_fixed_and_story_proceeds() {
        let fx = fixture(&["S"]);
        let gates = GateEngine::standard(&Default::default())
            .with_auto_fix(true)
            .with_gate(Arc::new(LintGate {
                fixed: AtomicBool::new(false),
            }));
        let scheduler = scheduler(&fx, standard_pool()).with_gates(gates);

        let outcome = scheduler.advance(scheduler.materialize("S").unwrap()).await.unwrap();

        assert_eq!(outcome.status, StoryStatus::Done);
        assert_eq!(outcome.gate_transitions, vec!["lint: fail→fix→pass"]);
    }

    #[tokio::test]
    async fn test_resume_matches_uninterrupted_run() {
        let uninterrupted = {
            let fx = fixture(&["S"]);
            let scheduler = scheduler(&fx, standard_pool());
            scheduler.advance(scheduler.materialize("S").unwrap()).await.unwrap()
        };

        let fx = fixture(&["S"]);
        let gates = GateEngine::standard(&Default::default()).with_gate(Arc::new(FlakyGate {
            failures: 2,
            seen: AtomicUsize::new(0),
        }));
        let scheduler = scheduler(&fx, standard_pool()).with_gates(gates);

        // The plan phase runs, but its output fails validation.
        let first = scheduler.advance(scheduler.materialize("S").unwrap()).await.unwrap();
        assert_eq!(first.status, StoryStatus::Blocked);
        assert_eq!(first.phase.as_deref(), Some("plan"));
        assert!(first.blocked.as_ref().unwrap().is_resumable());

        let second = scheduler.resume("S").await.unwrap();
        assert_eq!(second.status, StoryStatus::Blocked);

        let third = scheduler.resume("S").await.unwrap();
        assert_eq!(third.status, uninterrupted.status);
        let outputs = |o: &StoryOutcome| -> Vec<Option<String>> {
            o.story.phases.iter().map(|p| p.output.clone()).collect()
        };
        assert_eq!(outputs(&third), outputs(&uninterrupted));

        // Every billed call stays on the ledger across both resumes.
        let events = scheduler.tracker().events();
        for entry in &third.story.budget {
            let billed: f64 = events
                .iter()
                .filter(|e| e.category.as_deref() == Some(entry.category.as_str()))
                .map(|e| e.cost)
                .sum();
            assert!((entry.spent - billed).abs() < 1e-9, "{}: {} != {}", entry.category, entry.spent, billed);
        }
        let planning = third.story.budget.iter().find(|e| e.category == "planning").unwrap();
        assert!((planning.spent - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_blocked_spend_survives_resume() {
        let fx = fixture(&["S"]);
        let gates = GateEngine::standard(&Default::default()).with_gate(Arc::new(FlakyGate {
            failures: 1,
            seen: AtomicUsize::new(0),
        }));
        let scheduler = scheduler(&fx, AgentPool::new().with(scripted("planner", "plan", 0.5)))
            .with_gates(gates);
        let story = story_with("S", vec![phase("plan", "planner", "planning", 1.0)], &[("planning", 5.0)]);

        let blocked = scheduler.advance(story).await.unwrap();
        assert_eq!(blocked.status, StoryStatus::Blocked);
        let latest = scheduler.store().latest("S").unwrap().unwrap();
        assert_eq!(latest.trigger, CheckpointTrigger::Manual);
        let (rehydrated, _) = scheduler.load_story("S").unwrap();
        let planning = rehydrated.budget.iter().find(|e| e.category == "planning").unwrap();
        assert!((planning.spent - 0.5).abs() < 1e-9);

        let done = scheduler.resume("S").await.unwrap();
        assert_eq!(done.status, StoryStatus::Done);
        let planning = done.story.budget.iter().find(|e| e.category == "planning").unwrap();
        assert!((planning.spent - 1.0).abs() < 1e-9);
        assert_eq!(scheduler.tracker().events().len(), 2);
    }

    #[tokio::test]
    async fn test_resume_failing_preflight_stays_blocked() {
        let fx = fixture(&["S"]);
        let planner = scripted("planner", "plan", 0.5);
        let gates = GateEngine::standard(&Default::default()).with_gate(Arc::new(FlakyGate {
            failures: 1,
            seen: AtomicUsize::new(0),
        }));
        let scheduler = scheduler(&fx, AgentPool::new().with(planner.clone())).with_gates(gates);
        let story = story_with("S", vec![phase("plan", "planner", "planning", 1.0)], &[("planning", 5.0)]);

        let blocked = scheduler.advance(story).await.unwrap();
        assert_eq!(blocked.status, StoryStatus::Blocked);

        std::fs::remove_file(fx.config.story_file("S")).unwrap();
        let outcome = scheduler.resume("S").await.unwrap();

        assert_eq!(outcome.status, StoryStatus::Blocked);
        assert!(matches!(
            outcome.blocked,
            Some(PipelineError::ValidationFailed { tier: Tier::Preflight, .. })
        ));
        assert_eq!(planner.call_count(), 1);
        let table = SprintStatus::load(&fx.config.sprint_status_file).unwrap();
        assert_eq!(table.get("S"), Some(StoryStatus::Blocked));
    }

    #[tokio::test]
    async fn test_resume_rehydrates_done_phases() {
        let fx = fixture(&["S"]);
        let planner = scripted("planner", "plan", 0.5);
        let pool = AgentPool::new()
            .with(planner.clone())
            .with(scripted("developer", "code", 1.0))
            .with(scripted("reviewer", "ok", 0.25));
        let gates = GateEngine::standard(&Default::default()).with_gate(Arc::new(FlakyGate {
            failures: 0,
            seen: AtomicUsize::new(0),
        }));
        let scheduler = scheduler(&fx, pool).with_gates(gates);
        let story = story_with(
            "S",
            vec![
                phase("plan", "planner", "planning", 1.0),
                phase("implement", "developer", "implementation", 20.0),
            ],
            &[],
        );

        let blocked = scheduler.advance(story).await.unwrap();
        assert_eq!(blocked.phase.as_deref(), Some("implement"));
        assert_eq!(planner.call_count(), 1);

        let (story, _) = scheduler.load_story("S").unwrap();
        assert_eq!(story.status, StoryStatus::Blocked);
        assert!(story.phase("plan").unwrap().is_done());
        assert_eq!(story.phase("implement").unwrap().state, PhaseState::Pending);
        let planning = story.budget.iter().find(|e| e.category == "planning").unwrap();
        assert!((planning.spent - 0.5).abs() < 1e-9);
    }

    // =========================================
    // Cancellation
    // =========================================

    #[tokio::test]
    async fn test_graceful_cancel_starts_no_phase() {
        let fx = fixture(&["S"]);
        let planner = scripted("planner", "plan", 0.5);
        let pool = AgentPool::new()
            .with(planner.clone())
            .with(scripted("developer", "code", 1.0))
            .with(scripted("reviewer", "ok", 0.25));
        let scheduler = scheduler(&fx, pool);
        scheduler.cancel_handle().cancel_graceful();

        let outcome = scheduler.advance(scheduler.materialize("S").unwrap()).await.unwrap();
        assert!(outcome.cancelled);
        assert_eq!(planner.call_count(), 0);
        assert_eq!(outcome.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_hard_cancel_commits_partial_usage() {
        let fx = fixture(&["S"]);
        let planner = Arc::new(
            ScriptedAgent::new("planner").report_then_hang(usage(0.3), Duration::from_secs(60)),
        );
        let pool = AgentPool::new()
            .with(planner.clone())
            .with(scripted("developer", "code", 1.0))
            .with(scripted("reviewer", "ok", 0.25));
        let scheduler = scheduler(&fx, pool);
        let cancel = scheduler.cancel_handle();
        let story = scheduler.materialize("S").unwrap();

        let (outcome, _) = tokio::join!(scheduler.advance(story), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel_hard();
        });
        let outcome = outcome.unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.status, StoryStatus::InProgress);
        assert_eq!(outcome.story.phase("plan").unwrap().state, PhaseState::Pending);
        let planning = scheduler.ledger().entry("S", "planning").unwrap();
        assert!((planning.spent - 0.3).abs() < 1e-9);
        assert_eq!(scheduler.tracker().events().len(), 1);
        let latest = scheduler.store().latest("S").unwrap().unwrap();
        assert_eq!(latest.trigger, CheckpointTrigger::Manual);
    }

    // =========================================
    // Locking
    // =========================================

    #[tokio::test]
    async fn test_runs_of_one_story_are_serialized() {
        let fx = fixture(&["S"]);
        let slow = Arc::new(
            ScriptedAgent::new("planner")
                .respond_after(Duration::from_millis(50), "plan", usage(0.1))
                .repeat("plan", usage(0.1)),
        );
        let pool = AgentPool::new()
            .with(slow)
            .with(scripted("developer", "code", 0.1))
            .with(scripted("reviewer", "ok", 0.1));
        let scheduler = scheduler(&fx, pool);
        let locks = StoryLocks::new();
        let scheduler = scheduler.with_locks(locks.clone());

        let run = scheduler.advance(scheduler.materialize("S").unwrap());
        let contender = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            locks.try_acquire("S").is_none()
        };
        let (outcome, held) = tokio::join!(run, contender);
        assert!(held);
        assert_eq!(outcome.unwrap().status, StoryStatus::Done);
    }

    #[test]
    fn test_rebase_budget_keeps_spend_and_new_caps() {
        let current = vec![BudgetEntry::new("planning", 10.0, "USD")];
        let mut old = BudgetEntry::new("planning", 5.0, "USD");
        old.spent = 4.0;
        let mut legacy = BudgetEntry::new("security", 2.0, "USD");
        legacy.spent = 1.0;
        let rebased = rebase_budget(current, &[old, legacy]);
        assert_eq!(rebased[0].cap, 10.0);
        assert_eq!(rebased[0].spent, 4.0);
        assert_eq!(rebased[1].category, "security");
    }

    #[test]
    fn test_pipeline_config_defaults() {
        let config: PipelineConfig = toml::from_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.checkpoint_timeout(), Duration::from_millis(2000));
        assert_eq!(config.agent_timeout(), Duration::from_secs(1800));
    }
}
