//! Pair strategy: an implementer and a reviewer alternating in increments.
//!
//! Each increment is a strict handshake. The implementer produces work, the
//! reviewer responds, and only then does the next increment start, carrying
//! the reviewer's feedback in its context. The session ends when the
//! reviewer's feedback contains the approval marker or the increment limit
//! is reached.

use super::sequential::invoke_with_retries;
use super::{CollabContext, CollabDetail, CollabOutcome};
use crate::agent::{AgentRequest, Usage};
use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairIncrement {
    pub number: u32,
    pub implementation: String,
    pub feedback: String,
    pub approved: bool,
}

/// Record of one pair session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairTranscript {
    pub implementer: String,
    pub reviewer: String,
    pub increments: Vec<PairIncrement>,
}

impl PairTranscript {
    pub fn approved(&self) -> bool {
        self.increments.last().is_some_and(|i| i.approved)
    }
}

fn review_prompt(phase: &str, number: u32, marker: &str) -> String {
    format!(
        "Review increment {} of phase '{}'. List concrete problems to fix in the next increment, \
         or reply with {} if the work is complete.",
        number, phase, marker
    )
}

pub async fn run(
    ctx: &CollabContext<'_>,
    implementer_id: &str,
    reviewer_id: &str,
    template: &AgentRequest,
) -> Result<CollabOutcome, PipelineError> {
    let implementer = ctx.agent(implementer_id)?;
    let reviewer = ctx.agent(reviewer_id)?;
    let max_increments = ctx.config.pair_max_increments.max(1);
    let marker = ctx.config.approval_marker.as_str();

    let mut transcript = PairTranscript {
        implementer: implementer_id.to_string(),
        reviewer: reviewer_id.to_string(),
        increments: Vec::new(),
    };
    let mut usage = Usage::default();
    let mut feedback: Option<String> = None;
    let mut output = String::new();

    for number in 1..=max_increments {
        let mut context = template.context.clone();
        if let Some(prior) = &feedback {
            context.push(format!(
                "Reviewer feedback on increment {}:\n{}",
                number - 1,
                prior
            ));
        }
        let request = template.clone().with_context(context);
        let (work, _) = invoke_with_retries(ctx, &implementer, &request).await?;
        usage.add(&work.usage);

        let review = AgentRequest::new(
            &template.story_key,
            &template.phase,
            review_prompt(&template.phase, number, marker),
        )
        .with_context(vec![work.output.clone()]);
        let (verdict, _) = invoke_with_retries(ctx, &reviewer, &review).await?;
        usage.add(&verdict.usage);

        let approved = verdict.output.contains(marker);
        info!(
            story = %template.story_key,
            phase = %template.phase,
            increment = number,
            approved,
            "pair increment reviewed"
        );
        transcript.increments.push(PairIncrement {
            number,
            implementation: work.output.clone(),
            feedback: verdict.output.clone(),
            approved,
        });
        output = work.output;
        if approved {
            break;
        }
        feedback = Some(verdict.output);
    }

    if !transcript.approved() {
        warn!(
            story = %template.story_key,
            phase = %template.phase,
            increments = max_increments,
            "pair session ended without reviewer approval"
        );
    }

    Ok(CollabOutcome {
        output,
        usage,
        detail: CollabDetail::Pair(transcript),
    })
}
