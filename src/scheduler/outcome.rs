use crate::checkpoint::CheckpointId;
use crate::errors::PipelineError;
use crate::gates::ValidationReport;
use crate::story::{Story, StoryStatus};

/// Where a call to `advance` left the story.
#[derive(Debug, Clone)]
pub struct StoryOutcome {
    pub story: Story,
    pub status: StoryStatus,
    /// Why the run stopped short of `done`.
    pub blocked: Option<PipelineError>,
    /// Phase the run stopped in.
    pub phase: Option<String>,
    pub report: Option<ValidationReport>,
    /// Latest checkpoint to resume from.
    pub checkpoint: Option<CheckpointId>,
    pub cancelled: bool,
    /// Auto-fix transitions seen across all tiers, e.g. `lint: fail→fix→pass`.
    pub gate_transitions: Vec<String>,
}

impl StoryOutcome {
    pub(crate) fn new(story: Story) -> Self {
        Self {
            status: story.status,
            story,
            blocked: None,
            phase: None,
            report: None,
            checkpoint: None,
            cancelled: false,
            gate_transitions: Vec::new(),
        }
    }

    /// 0 when done, 1 when failed, 2 when the story can still move.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            StoryStatus::Done => 0,
            StoryStatus::Failed => 1,
            _ => 2,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == StoryStatus::Done
    }

    pub fn summary(&self) -> String {
        let story = &self.story;
        if self.is_done() {
            return format!(
                "Story {} done: {} phases, {:.2} {} spent",
                story.key,
                story.phases.len(),
                story.total_spent(),
                story.currency
            );
        }

        let mut out = format!("Story {} is {}", story.key, self.status);
        if let Some(phase) = &self.phase {
            out.push_str(&format!(" in phase '{}'", phase));
        }
        if self.cancelled {
            out.push_str(" (cancelled)");
        }
        out.push('\n');

        if let Some(err) = &self.blocked {
            out.push_str(&format!("  reason: {}\n", err));
            if let Some(subject) = err.subject() {
                out.push_str(&format!("  at:     {}\n", subject));
            }
        }
        if let Some(report) = &self.report {
            for line in report.render().lines() {
                out.push_str(&format!("  {}\n", line));
            }
        }

        let resumable = self.cancelled
            || self.blocked.as_ref().is_some_and(PipelineError::is_resumable)
            || self.status == StoryStatus::Blocked;
        if resumable && self.status != StoryStatus::Failed {
            match &self.checkpoint {
                Some(id) => out.push_str(&format!(
                    "  resume: storyforge checkpoint restore {} && storyforge story {}\n",
                    id, story.key
                )),
                None => out.push_str(&format!("  resume: storyforge story {}\n", story.key)),
            }
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetConfig;
    use crate::story::StoryDefinition;

    fn story(status: StoryStatus) -> Story {
        let mut story =
            Story::from_definition("2-1-cart", &StoryDefinition::default(), &BudgetConfig::default())
                .unwrap();
        story.status = status;
        story
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(StoryOutcome::new(story(StoryStatus::Done)).exit_code(), 0);
        assert_eq!(StoryOutcome::new(story(StoryStatus::Failed)).exit_code(), 1);
        assert_eq!(StoryOutcome::new(story(StoryStatus::Blocked)).exit_code(), 2);
        assert_eq!(StoryOutcome::new(story(StoryStatus::Drafted)).exit_code(), 2);
    }

    #[test]
    fn test_blocked_summary_names_phase_category_and_checkpoint() {
        let mut outcome = StoryOutcome::new(story(StoryStatus::Blocked));
        outcome.phase = Some("implement".into());
        outcome.checkpoint = Some(CheckpointId::new("2-1-cart", 4));
        outcome.blocked = Some(PipelineError::BudgetExceeded {
            story: "2-1-cart".into(),
            phase: "implement".into(),
            category: "implementation".into(),
            requested: 4.0,
            spent: 15.0,
            cap: 15.0,
        });
        let summary = outcome.summary();
        assert!(summary.contains("blocked in phase 'implement'"));
        assert!(summary.contains("budget category 'implementation'"));
        assert!(summary.contains("storyforge checkpoint restore 2-1-cart@4"));
    }

    #[test]
    fn test_failed_summary_has_no_resume_hint() {
        let mut outcome = StoryOutcome::new(story(StoryStatus::Failed));
        outcome.phase = Some("plan".into());
        outcome.blocked = Some(PipelineError::AgentError {
            phase: "plan".into(),
            attempts: 3,
            message: "empty output".into(),
        });
        let summary = outcome.summary();
        assert!(summary.contains("failed"));
        assert!(!summary.contains("resume:"));
    }

    #[test]
    fn test_done_summary() {
        let outcome = StoryOutcome::new(story(StoryStatus::Done));
        assert!(outcome.summary().starts_with("Story 2-1-cart done: 3 phases"));
    }
}
