//! Swarm strategy: concurrent rounds until a quorum shares a position.
//!
//! Every member analyses the same input concurrently. A member's position is
//! the text of its `<position>` tag, or its first non-empty line, normalised.
//! Consensus needs `max(ceil(quorum * N), min(2, N))` members on the same
//! position, where N is the swarm size. Members that time out or fail are
//! left out of that round's count. Each round after the first sees the
//! positions of the previous one.

use super::{CollabContext, CollabDetail, CollabOutcome, fresh_request, invoke};
use crate::agent::{AgentRequest, Usage};
use crate::errors::PipelineError;
use futures::stream::{FuturesUnordered, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static POSITION_TAG: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)<position>\s*(.*?)\s*</position>").ok());

/// Position an output commits to, normalised for comparison.
pub fn extract_position(output: &str) -> Option<String> {
    let tagged = POSITION_TAG
        .as_ref()
        .and_then(|re| re.captures(output))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let raw = tagged.or_else(|| {
        output
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(String::from)
    })?;
    let normalised = normalize_position(&raw);
    (!normalised.is_empty()).then_some(normalised)
}

/// Lower-case, collapse whitespace, strip trailing punctuation.
pub fn normalize_position(text: &str) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(['.', '!', ',', ';', ':'])
        .trim_end()
        .to_string()
}

/// Members that must agree for consensus in a swarm of `swarm_size`.
pub fn required_votes(quorum: f64, swarm_size: usize) -> usize {
    let by_quorum = (quorum * swarm_size as f64).ceil() as usize;
    by_quorum.max(swarm_size.min(2)).min(swarm_size.max(1))
}

/// What happened in one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmRound {
    pub number: u32,
    /// (agent, position) for members that answered, in swarm order.
    pub positions: Vec<(String, String)>,
    /// Members that timed out, failed, or gave no position.
    pub excluded: Vec<String>,
}

/// A reached consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusReport {
    pub position: String,
    pub supporters: Vec<String>,
    pub swarm_size: usize,
    pub round: u32,
    pub rounds: Vec<SwarmRound>,
}

impl ConsensusReport {
    pub fn headline(&self) -> String {
        format!(
            "Consensus ({}/{} agents, round {}): {}",
            self.supporters.len(),
            self.swarm_size,
            self.round,
            self.position
        )
    }
}

fn positions_context(round: &SwarmRound) -> String {
    let mut out = format!("Positions after round {}:\n", round.number);
    for (agent, position) in &round.positions {
        out.push_str(&format!("- {}: {}\n", agent, position));
    }
    if !round.excluded.is_empty() {
        out.push_str(&format!("No answer from: {}\n", round.excluded.join(", ")));
    }
    out.push_str("Converge on a single position if you can; state it in a <position> tag.");
    out
}

/// Most supported position and its supporters in swarm order. Ties go to the
/// position named first by an earlier member.
fn leading_position(round: &SwarmRound) -> Option<(String, Vec<String>)> {
    let mut votes: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (agent, position) in &round.positions {
        votes.entry(position.as_str()).or_default().push(agent.clone());
    }
    let mut best: Option<(String, Vec<String>)> = None;
    for (_, position) in &round.positions {
        let supporters = &votes[position.as_str()];
        if best.as_ref().is_none_or(|(_, b)| supporters.len() > b.len()) {
            best = Some((position.clone(), supporters.clone()));
        }
    }
    best
}

pub async fn run(
    ctx: &CollabContext<'_>,
    members: &[String],
    max_iterations: u32,
    template: &AgentRequest,
) -> Result<CollabOutcome, PipelineError> {
    let agents = members
        .iter()
        .map(|id| ctx.agent(id))
        .collect::<Result<Vec<_>, _>>()?;
    let swarm_size = agents.len();
    let needed = required_votes(ctx.config.consensus_quorum, swarm_size);
    let limit = ctx.config.swarm_round_timeout();
    let max_iterations = max_iterations.max(1);

    let mut usage = Usage::default();
    let mut rounds: Vec<SwarmRound> = Vec::new();

    for number in 1..=max_iterations {
        let mut context = template.context.clone();
        if let Some(previous) = rounds.last() {
            context.push(positions_context(previous));
        }
        let request = template.clone().with_context(context);

        let mut pending = FuturesUnordered::new();
        for (index, agent) in agents.iter().enumerate() {
            let call = fresh_request(&request);
            pending.push(async move { (index, invoke(ctx, agent, call, Some(limit)).await) });
        }

        let mut outputs: Vec<Option<String>> = vec![None; swarm_size];
        while let Some((index, result)) = pending.next().await {
            match result {
                Ok(response) => {
                    usage.add(&response.usage);
                    outputs[index] = Some(response.output);
                }
                Err(e) => {
                    usage.add(e.usage());
                    warn!(
                        story = %template.story_key,
                        phase = %template.phase,
                        round = number,
                        agent = %members[index],
                        error = %e,
                        "swarm member excluded from round"
                    );
                }
            }
        }

        let mut round = SwarmRound {
            number,
            positions: Vec::new(),
            excluded: Vec::new(),
        };
        for (index, output) in outputs.iter().enumerate() {
            match output.as_deref().and_then(extract_position) {
                Some(position) => round.positions.push((members[index].clone(), position)),
                None => round.excluded.push(members[index].clone()),
            }
        }
        debug!(round = number, positions = ?round.positions, "swarm round finished");

        let leader = leading_position(&round);
        rounds.push(round);

        if let Some((position, supporters)) = leader
            && supporters.len() >= needed
        {
            let detail = supporters
                .first()
                .and_then(|s| members.iter().position(|m| m == s))
                .and_then(|i| outputs[i].clone())
                .unwrap_or_default();
            let report = ConsensusReport {
                position,
                supporters,
                swarm_size,
                round: number,
                rounds,
            };
            info!(
                story = %template.story_key,
                phase = %template.phase,
                "{}",
                report.headline()
            );
            return Ok(CollabOutcome {
                output: format!("{}\n\n{}", report.headline(), detail),
                usage,
                detail: CollabDetail::Swarm(report),
            });
        }
    }

    warn!(
        story = %template.story_key,
        phase = %template.phase,
        rounds = max_iterations,
        "swarm exhausted its rounds without consensus"
    );
    Err(PipelineError::ConsensusNotReached {
        phase: template.phase.clone(),
        rounds: max_iterations,
    })
}
