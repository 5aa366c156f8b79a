//! Agent that replays a queue of scripted steps.
//!
//! Used by tests and `--dry-run` style flows where deterministic agent
//! output is required.

use super::{Agent, AgentRequest, AgentResponse, Usage};
use crate::errors::AgentError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
enum ScriptStep {
    Respond {
        output: String,
        usage: Usage,
        delay: Option<Duration>,
    },
    /// Report partial usage, then sleep (simulates a long in-flight call).
    ReportThenHang { partial: Usage, delay: Duration },
    Empty { usage: Usage },
    Malformed { message: String, usage: Usage },
}

/// Scripted agent returning queued responses in order.
///
/// When the queue is exhausted the fallback response (if any) is repeated,
/// otherwise the agent reports empty output.
pub struct ScriptedAgent {
    id: String,
    steps: Mutex<VecDeque<ScriptStep>>,
    fallback: Option<(String, Usage)>,
    calls: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            steps: Mutex::new(VecDeque::new()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn push(self, step: ScriptStep) -> Self {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_back(step);
        }
        self
    }

    pub fn respond(self, output: &str, usage: Usage) -> Self {
        self.push(ScriptStep::Respond {
            output: output.to_string(),
            usage,
            delay: None,
        })
    }

    pub fn respond_after(self, delay: Duration, output: &str, usage: Usage) -> Self {
        self.push(ScriptStep::Respond {
            output: output.to_string(),
            usage,
            delay: Some(delay),
        })
    }

    pub fn report_then_hang(self, partial: Usage, delay: Duration) -> Self {
        self.push(ScriptStep::ReportThenHang { partial, delay })
    }

    pub fn fail_empty(self, usage: Usage) -> Self {
        self.push(ScriptStep::Empty { usage })
    }

    pub fn fail_malformed(self, message: &str, usage: Usage) -> Self {
        self.push(ScriptStep::Malformed {
            message: message.to_string(),
            usage,
        })
    }

    /// Response repeated once the scripted queue runs dry.
    pub fn repeat(mut self, output: &str, usage: Usage) -> Self {
        self.fallback = Some((output.to_string(), usage));
        self
    }

    /// Requests received so far, in call order.
    pub fn calls(&self) -> Vec<AgentRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        let step = self.steps.lock().ok().and_then(|mut s| s.pop_front());

        let step = match step {
            Some(step) => step,
            None => match &self.fallback {
                Some((output, usage)) => ScriptStep::Respond {
                    output: output.clone(),
                    usage: usage.clone(),
                    delay: None,
                },
                None => ScriptStep::Empty {
                    usage: Usage::default(),
                },
            },
        };

        match step {
            ScriptStep::Respond {
                output,
                usage,
                delay,
            } => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(AgentResponse::new(output, usage))
            }
            ScriptStep::ReportThenHang { partial, delay } => {
                request.reporter.report(&partial);
                tokio::time::sleep(delay).await;
                Ok(AgentResponse::new("late output", partial))
            }
            ScriptStep::Empty { usage } => Err(AgentError::Empty {
                agent: self.id.clone(),
                usage,
            }),
            ScriptStep::Malformed { message, usage } => Err(AgentError::Malformed {
                agent: self.id.clone(),
                message,
                usage,
            }),
        }
    }
}
