//! Durable, resumable snapshots of a story's pipeline state.
//!
//! - [`CheckpointStore`]: atomic per-story checkpoint series on disk
//! - [`ContextMeter`]: estimates context size and reports threshold crossings
//! - [`CheckpointWriter`]: background persistence task fed by a channel

pub mod meter;
pub mod store;
pub mod writer;

pub use meter::ContextMeter;
pub use store::CheckpointStore;
pub use writer::{CheckpointRequest, CheckpointWriter};

use crate::errors::CheckpointError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Why a checkpoint was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointTrigger {
    PhaseStart,
    ContextThreshold,
    PhaseEnd,
    Manual,
}

impl fmt::Display for CheckpointTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PhaseStart => "phase-start",
            Self::ContextThreshold => "context-threshold",
            Self::PhaseEnd => "phase-end",
            Self::Manual => "manual",
        };
        write!(f, "{}", s)
    }
}

/// Address of a checkpoint: `<story>@<sequence>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId {
    pub story_id: String,
    pub sequence: u64,
}

impl CheckpointId {
    pub fn new(story_id: &str, sequence: u64) -> Self {
        Self {
            story_id: story_id.to_string(),
            sequence,
        }
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.story_id, self.sequence)
    }
}

impl FromStr for CheckpointId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (story, seq) = s
            .rsplit_once('@')
            .ok_or_else(|| format!("Invalid checkpoint id '{}': expected <story>@<sequence>", s))?;
        if story.is_empty() {
            return Err(format!("Invalid checkpoint id '{}': empty story", s));
        }
        let sequence = seq
            .parse::<u64>()
            .map_err(|_| format!("Invalid checkpoint sequence '{}'", seq))?;
        Ok(Self::new(story, sequence))
    }
}

/// Immutable checkpoint record. `sequence` and `digest` are assigned by the
/// store on save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub story_id: String,
    pub phase_name: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub trigger: CheckpointTrigger,
    pub serialized_state: String,
    pub estimated_context_tokens: u64,
    #[serde(default)]
    pub digest: String,
}

impl Checkpoint {
    pub fn new(
        story_id: &str,
        phase_name: &str,
        trigger: CheckpointTrigger,
        serialized_state: String,
        estimated_context_tokens: u64,
    ) -> Self {
        Self {
            story_id: story_id.to_string(),
            phase_name: phase_name.to_string(),
            sequence: 0,
            timestamp: Utc::now(),
            trigger,
            serialized_state,
            estimated_context_tokens,
            digest: String::new(),
        }
    }

    /// Build a checkpoint whose state is `state` serialized as JSON.
    pub fn capture<T: Serialize>(
        story_id: &str,
        phase_name: &str,
        trigger: CheckpointTrigger,
        state: &T,
        estimated_context_tokens: u64,
    ) -> Result<Self, CheckpointError> {
        let serialized = serde_json::to_string(state).map_err(|e| CheckpointError::Corrupt {
            id: format!("{}@new", story_id),
            reason: format!("state does not serialize: {}", e),
        })?;
        Ok(Self::new(
            story_id,
            phase_name,
            trigger,
            serialized,
            estimated_context_tokens,
        ))
    }

    pub fn id(&self) -> CheckpointId {
        CheckpointId::new(&self.story_id, self.sequence)
    }

    pub fn compute_digest(&self) -> String {
        digest_of(&self.serialized_state)
    }

    pub fn verify(&self) -> Result<(), CheckpointError> {
        let actual = self.compute_digest();
        if actual != self.digest {
            return Err(CheckpointError::Corrupt {
                id: self.id().to_string(),
                reason: format!("digest mismatch (stored {}, computed {})", self.digest, actual),
            });
        }
        Ok(())
    }

    pub fn state<T: DeserializeOwned>(&self) -> Result<T, CheckpointError> {
        serde_json::from_str(&self.serialized_state).map_err(|e| CheckpointError::Corrupt {
            id: self.id().to_string(),
            reason: format!("state does not deserialize: {}", e),
        })
    }
}

fn digest_of(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display_and_parse() {
        let id = CheckpointId::new("1-2-login", 7);
        assert_eq!(id.to_string(), "1-2-login@7");
        assert_eq!("1-2-login@7".parse::<CheckpointId>().unwrap(), id);
    }

    #[test]
    fn test_id_parse_rejects_bad_input() {
        assert!("no-sequence".parse::<CheckpointId>().is_err());
        assert!("@3".parse::<CheckpointId>().is_err());
        assert!("story@three".parse::<CheckpointId>().is_err());
    }

    #[test]
    fn test_verify_detects_tampering() {
        let mut cp = Checkpoint::new("s", "plan", CheckpointTrigger::PhaseEnd, "{}".into(), 10);
        cp.digest = cp.compute_digest();
        assert!(cp.verify().is_ok());
        cp.serialized_state = "{\"x\":1}".into();
        assert!(matches!(cp.verify(), Err(CheckpointError::Corrupt { .. })));
    }

    #[test]
    fn test_capture_and_state_round_trip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct State {
            phase: usize,
        }
        let cp = Checkpoint::capture("s", "implement", CheckpointTrigger::PhaseStart, &State { phase: 2 }, 0)
            .unwrap();
        assert_eq!(cp.state::<State>().unwrap(), State { phase: 2 });
        assert_eq!(cp.trigger.to_string(), "phase-start");
    }
}
