//! Typed error hierarchy for the storyforge pipeline.
//!
//! Three top-level enums cover the three failure surfaces:
//! - `PipelineError`: story-level outcomes the scheduler surfaces to callers
//! - `AgentError`: a single agent invocation going wrong
//! - `CheckpointError`: checkpoint store I/O and integrity failures

use crate::agent::Usage;
use crate::gates::{Tier, ValidationReport};
use thiserror::Error;

/// Story-level failures. Every variant names the phase it happened in so the
/// user can see where the run stopped.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error(
        "Budget exceeded for story {story} in phase {phase}: category '{category}' has {spent:.2} of {cap:.2} spent, requested {requested:.2}"
    )]
    BudgetExceeded {
        story: String,
        phase: String,
        category: String,
        requested: f64,
        spent: f64,
        cap: f64,
    },

    #[error("Tier {tier} validation failed in phase {phase}: {}", .report.failing_gates().join(", "))]
    ValidationFailed {
        tier: Tier,
        phase: String,
        report: ValidationReport,
    },

    #[error("Swarm in phase {phase} did not reach consensus after {rounds} rounds")]
    ConsensusNotReached { phase: String, rounds: u32 },

    #[error("Agent failed in phase {phase} after {attempts} attempts: {message}")]
    AgentError {
        phase: String,
        attempts: u32,
        message: String,
    },

    #[error("Checkpoint store unavailable: {0}")]
    CheckpointUnavailable(String),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl PipelineError {
    /// Whether a story blocked by this error can continue from its latest checkpoint.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::BudgetExceeded { .. } | Self::ValidationFailed { .. } | Self::ConsensusNotReached { .. }
        )
    }

    /// Phase the error is attributed to, if any.
    pub fn phase(&self) -> Option<&str> {
        match self {
            Self::BudgetExceeded { phase, .. }
            | Self::ValidationFailed { phase, .. }
            | Self::ConsensusNotReached { phase, .. }
            | Self::AgentError { phase, .. } => Some(phase),
            Self::CheckpointUnavailable(_) | Self::ConfigInvalid(_) => None,
        }
    }

    /// Short label for the gate or budget category at fault.
    pub fn subject(&self) -> Option<String> {
        match self {
            Self::BudgetExceeded { category, .. } => Some(format!("budget category '{}'", category)),
            Self::ValidationFailed { report, .. } => {
                Some(format!("gates: {}", report.failing_gates().join(", ")))
            }
            Self::ConsensusNotReached { .. } => {
                Some("swarm consensus (change the agent set or strategy)".to_string())
            }
            _ => None,
        }
    }
}

/// Failures of a single agent invocation.
///
/// Every variant carries the usage consumed before the failure so partial
/// work is still billed.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("Agent {agent} returned empty output")]
    Empty { agent: String, usage: Usage },

    #[error("Agent {agent} returned malformed output: {message}")]
    Malformed {
        agent: String,
        message: String,
        usage: Usage,
    },

    #[error("Agent {agent} process failed: {message}")]
    Process {
        agent: String,
        message: String,
        usage: Usage,
    },

    #[error("Agent {agent} timed out after {secs}s")]
    Timeout { agent: String, secs: u64, usage: Usage },
}

impl AgentError {
    /// Usage consumed before the failure.
    pub fn usage(&self) -> &Usage {
        match self {
            Self::Empty { usage, .. }
            | Self::Malformed { usage, .. }
            | Self::Process { usage, .. }
            | Self::Timeout { usage, .. } => usage,
        }
    }

    pub fn agent(&self) -> &str {
        match self {
            Self::Empty { agent, .. }
            | Self::Malformed { agent, .. }
            | Self::Process { agent, .. }
            | Self::Timeout { agent, .. } => agent,
        }
    }
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Checkpoint {id} not found")]
    NotFound { id: String },

    #[error("Invalid story key for checkpoints: {story:?}")]
    InvalidStory { story: String },

    #[error("Failed to lock checkpoint series for story {story}: {source}")]
    Lock {
        story: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
