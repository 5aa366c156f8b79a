//! Single-agent execution with bounded retries.

use super::{CollabContext, CollabDetail, CollabOutcome, fresh_request, invoke};
use crate::agent::{Agent, AgentRequest, AgentResponse, Usage};
use crate::errors::PipelineError;
use std::sync::Arc;
use tracing::warn;

/// Call `agent` until it succeeds or `1 + agent_retries` attempts are spent.
///
/// The returned response's usage covers every attempt.
pub(crate) async fn invoke_with_retries(
    ctx: &CollabContext<'_>,
    agent: &Arc<dyn Agent>,
    template: &AgentRequest,
) -> Result<(AgentResponse, u32), PipelineError> {
    let attempts = ctx.agent_retries + 1;
    let mut spent = Usage::default();
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match invoke(ctx, agent, fresh_request(template), None).await {
            Ok(mut response) => {
                spent.add(&response.usage);
                response.usage = spent;
                return Ok((response, attempt));
            }
            Err(e) => {
                warn!(
                    story = %template.story_key,
                    phase = %template.phase,
                    agent = agent.id(),
                    attempt,
                    attempts,
                    error = %e,
                    "agent call failed"
                );
                spent.add(e.usage());
                last_error = e.to_string();
            }
        }
    }

    Err(PipelineError::AgentError {
        phase: template.phase.clone(),
        attempts,
        message: last_error,
    })
}

pub async fn run(
    ctx: &CollabContext<'_>,
    agent_id: &str,
    template: &AgentRequest,
) -> Result<CollabOutcome, PipelineError> {
    let agent = ctx.agent(agent_id)?;
    let (response, attempts) = invoke_with_retries(ctx, &agent, template).await?;
    Ok(CollabOutcome {
        output: response.output,
        usage: response.usage,
        detail: CollabDetail::Single {
            agent: agent_id.to_string(),
            attempts,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentPool, ScriptedAgent};
    use crate::collab::test_support::{RecordingSink, usage};
    use crate::collab::{CollabConfig, InFlight};

    #[tokio::test]
    async fn test_retries_until_success() {
        let agent = Arc::new(
            ScriptedAgent::new("developer")
                .fail_empty(usage(0.1))
                .fail_malformed("no result event", usage(0.2))
                .respond("implemented", usage(0.5)),
        );
        let pool = AgentPool::new().with(agent.clone());
        let sink = RecordingSink::default();
        let in_flight = InFlight::new();
        let config = CollabConfig::default();
        let ctx = CollabContext::new(&pool, &sink, &in_flight, &config).with_retries(2);

        let outcome = run(&ctx, "developer", &AgentRequest::new("S", "implement", "go"))
            .await
            .unwrap();
        assert_eq!(outcome.output, "implemented");
        assert_eq!(
            outcome.detail,
            CollabDetail::Single {
                agent: "developer".into(),
                attempts: 3
            }
        );
        assert!((outcome.usage.cost - 0.8).abs() < 1e-9);
        // Each attempt is billed as it completes.
        assert_eq!(sink.records.lock().unwrap().len(), 3);
        assert_eq!(agent.call_count(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate() {
        let agent = Arc::new(
            ScriptedAgent::new("planner")
                .fail_empty(usage(0.1))
                .fail_empty(usage(0.1)),
        );
        let pool = AgentPool::new().with(agent.clone());
        let sink = RecordingSink::default();
        let in_flight = InFlight::new();
        let config = CollabConfig::default();
        let ctx = CollabContext::new(&pool, &sink, &in_flight, &config).with_retries(1);

        let err = run(&ctx, "planner", &AgentRequest::new("S", "plan", "go"))
            .await
            .unwrap_err();
        match err {
            PipelineError::AgentError { phase, attempts, message } => {
                assert_eq!(phase, "plan");
                assert_eq!(attempts, 2);
                assert!(message.contains("empty output"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!((sink.total_cost() - 0.2).abs() < 1e-9);
    }
}
