use super::stream::{ContentBlock, StreamEvent, describe_tool_use};
use super::{Agent, AgentRequest, AgentResponse, ResolvedAgentConfig, Usage};
use crate::errors::AgentError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Settings shared by all command-backed agents of a run.
#[derive(Debug, Clone)]
pub struct CommandAgentConfig {
    pub agent_cmd: String,
    pub project_dir: PathBuf,
    pub timeout: Duration,
    pub skip_permissions: bool,
}

impl CommandAgentConfig {
    pub fn flags(&self, model: Option<&str>) -> Vec<String> {
        let mut flags = Vec::new();
        if self.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        if let Some(model) = model {
            flags.push("--model".to_string());
            flags.push(model.to_string());
        }
        flags
    }
}

/// Agent backed by the agent CLI process (stream-json protocol).
pub struct CommandAgent {
    id: String,
    persona: ResolvedAgentConfig,
    config: CommandAgentConfig,
}

impl CommandAgent {
    pub fn new(id: &str, persona: ResolvedAgentConfig, config: CommandAgentConfig) -> Self {
        Self {
            id: id.to_string(),
            persona,
            config,
        }
    }

    fn build_prompt(&self, request: &AgentRequest) -> String {
        format!(
            "{}\n\n## STORY\n{} (phase: {})\n\n## TASK\n{}",
            self.persona.render_preamble(),
            request.story_key,
            request.phase,
            request.render()
        )
    }

    async fn run_process(
        &self,
        prompt: &str,
        request: &AgentRequest,
    ) -> Result<AgentResponse, AgentError> {
        let flags = self.config.flags(self.persona.model.as_deref());
        debug!(agent = %self.id, cmd = %self.config.agent_cmd, ?flags, "spawning agent");

        let mut child = Command::new(&self.config.agent_cmd)
            .args(&flags)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .current_dir(&self.config.project_dir)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.process_error(format!("failed to spawn: {}", e), request))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| self.process_error(format!("failed to write prompt: {}", e), request))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| self.process_error(format!("failed to close stdin: {}", e), request))?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.process_error("no stdout handle".to_string(), request))?;
        let mut reader = BufReader::new(stdout).lines();

        let mut model = self.persona.model.clone().unwrap_or_default();
        let mut accumulated_text = String::new();
        let mut final_result: Option<String> = None;
        let mut final_usage: Option<Usage> = None;
        let mut is_error = false;

        while let Some(line) = reader
            .next_line()
            .await
            .map_err(|e| self.process_error(format!("failed to read output: {}", e), request))?
        {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StreamEvent>(&line) {
                Ok(StreamEvent::System { model: Some(m) }) => model = m,
                Ok(StreamEvent::Assistant { message }) => {
                    if let Some(usage) = &message.usage {
                        request.reporter.report(&usage.to_usage(&model, 0.0));
                    }
                    for block in message.content {
                        match block {
                            ContentBlock::ToolUse { name, input } => {
                                debug!(agent = %self.id, "{}", describe_tool_use(&name, &input));
                            }
                            ContentBlock::Text { text } => {
                                accumulated_text.push_str(&text);
                                accumulated_text.push('\n');
                            }
                            ContentBlock::Other => {}
                        }
                    }
                }
                Ok(StreamEvent::Result {
                    result,
                    is_error: err,
                    total_cost_usd,
                    usage,
                }) => {
                    final_result = result;
                    is_error = err;
                    final_usage = Some(
                        usage
                            .unwrap_or_default()
                            .to_usage(&model, total_cost_usd.unwrap_or(0.0)),
                    );
                }
                Ok(_) => {}
                Err(_) => {
                    accumulated_text.push_str(&line);
                    accumulated_text.push('\n');
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| self.process_error(format!("failed to wait: {}", e), request))?;
        let usage = final_usage.unwrap_or_else(|| request.reporter.snapshot());
        let output = final_result.unwrap_or(accumulated_text);

        if is_error || !status.success() {
            return Err(AgentError::Process {
                agent: self.id.clone(),
                message: format!(
                    "exit code {} ({})",
                    status.code().unwrap_or(-1),
                    output.lines().next().unwrap_or("no output")
                ),
                usage,
            });
        }
        if output.trim().is_empty() {
            return Err(AgentError::Empty {
                agent: self.id.clone(),
                usage,
            });
        }
        Ok(AgentResponse::new(output, usage))
    }

    fn process_error(&self, message: String, request: &AgentRequest) -> AgentError {
        AgentError::Process {
            agent: self.id.clone(),
            message,
            usage: request.reporter.snapshot(),
        }
    }
}

#[async_trait]
impl Agent for CommandAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        let prompt = self.build_prompt(&request);
        let start = Instant::now();
        info!(agent = %self.id, story = %request.story_key, phase = %request.phase, prompt_chars = prompt.len(), "invoking agent");

        match tokio::time::timeout(self.config.timeout, self.run_process(&prompt, &request)).await
        {
            Ok(result) => {
                info!(agent = %self.id, elapsed_secs = start.elapsed().as_secs_f64(), ok = result.is_ok(), "agent finished");
                result
            }
            Err(_) => {
                warn!(agent = %self.id, secs = self.config.timeout.as_secs(), "agent timed out");
                Err(AgentError::Timeout {
                    agent: self.id.clone(),
                    secs: self.config.timeout.as_secs(),
                    usage: request.reporter.snapshot(),
                })
            }
        }
    }
}
