//! Shared status icons and styling for CLI output.

use crate::budget::BudgetLevel;
use crate::gates::GateOutcome;
use crate::story::StoryStatus;
use console::{Emoji, StyledObject, style};

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");
pub static BLOCKER: Emoji<'_, '_> = Emoji("🚧 ", "[BLOCK]");
pub static STOP: Emoji<'_, '_> = Emoji("⏹️  ", "[STOP]");

/// Story status coloured by how far it is from done.
pub fn status(status: StoryStatus) -> StyledObject<String> {
    let text = style(status.to_string());
    match status {
        StoryStatus::Done => text.green(),
        StoryStatus::Failed => text.red().bold(),
        StoryStatus::Blocked => text.yellow().bold(),
        StoryStatus::InProgress | StoryStatus::Review => text.cyan(),
        _ => text.dim(),
    }
}

pub fn level(level: BudgetLevel) -> StyledObject<String> {
    let text = style(level.to_string());
    match level {
        BudgetLevel::Normal => text.green(),
        BudgetLevel::Warning => text.yellow(),
        BudgetLevel::Critical | BudgetLevel::Exceeded => text.red().bold(),
    }
}

pub fn outcome_icon(outcome: GateOutcome) -> Emoji<'static, 'static> {
    match outcome {
        GateOutcome::Pass => CHECK,
        GateOutcome::Warn => WARN,
        GateOutcome::Fail => CROSS,
    }
}
