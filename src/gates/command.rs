//! Gates backed by shell commands (build, test, lint, type check).

use super::{Gate, GateCheck, GateContext, Tier};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

fn default_timeout_secs() -> u64 {
    300
}

/// One `[[gates.commands]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandGateConfig {
    pub name: String,
    pub tier: Tier,
    pub command: String,
    /// Deterministic remediation, run at most once when the gate fails.
    #[serde(default)]
    pub fix: Option<String>,
    #[serde(default)]
    pub critical: bool,
    /// Report failures as warnings.
    #[serde(default)]
    pub warn_only: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

pub struct CommandGate {
    config: CommandGateConfig,
}

struct CommandRun {
    success: bool,
    summary: String,
}

impl CommandGate {
    pub fn new(config: CommandGateConfig) -> Self {
        Self { config }
    }

    async fn run(&self, command: &str, ctx: &GateContext) -> CommandRun {
        debug!(gate = %self.config.name, command, "running gate command");
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("STORYFORGE_STORY", &ctx.story_key)
            .env("STORYFORGE_PHASE", ctx.phase.as_deref().unwrap_or(""))
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return CommandRun {
                    success: false,
                    summary: format!("failed to spawn: {}", e),
                };
            }
        };

        let limit = Duration::from_secs(self.config.timeout_secs);
        match timeout(limit, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let text = if stderr.trim().is_empty() { stdout } else { stderr };
                let code = output.status.code().unwrap_or(-1);
                CommandRun {
                    success: output.status.success(),
                    summary: if text.trim().is_empty() {
                        format!("exit code {}", code)
                    } else {
                        format!("exit code {}: {}", code, tail(text.trim(), 3))
                    },
                }
            }
            Ok(Err(e)) => CommandRun {
                success: false,
                summary: format!("failed to wait: {}", e),
            },
            Err(_) => CommandRun {
                success: false,
                summary: format!("timed out after {}s", self.config.timeout_secs),
            },
        }
    }
}

/// Last `n` lines of `text`, joined with " | ".
fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join(" | ")
}

#[async_trait]
impl Gate for CommandGate {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn tier(&self) -> Tier {
        self.config.tier
    }

    fn critical(&self) -> bool {
        self.config.critical
    }

    async fn evaluate(&self, ctx: &GateContext) -> GateCheck {
        let run = self.run(&self.config.command, ctx).await;
        if run.success {
            return GateCheck::pass(run.summary);
        }
        let check = if self.config.warn_only {
            GateCheck::warn(run.summary)
        } else {
            GateCheck::fail(run.summary)
        };
        match &self.config.fix {
            Some(fix) => check.with_suggestion(format!("run `{}`", fix)),
            None => check.with_suggestion(format!("make `{}` succeed", self.config.command)),
        }
    }

    fn has_fix(&self) -> bool {
        self.config.fix.is_some()
    }

    async fn fix(&self, ctx: &GateContext) -> Result<String, String> {
        let Some(fix) = &self.config.fix else {
            return Err(format!("gate '{}' has no fix", self.config.name));
        };
        let run = self.run(fix, ctx).await;
        if run.success {
            Ok(run.summary)
        } else {
            Err(run.summary)
        }
    }
}
