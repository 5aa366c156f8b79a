//! Story execution commands: `storyforge story` and `storyforge collab`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;
use storyforge::router::Strategy;
use storyforge::scheduler::StoryOutcome;
use storyforge::story::StoryStatus;
use storyforge::ui;
use storyforge::usage::{SessionStore, UsageTracker};
use tracing::warn;

use super::{Workspace, spawn_interrupt_handler};

/// Run (or resume) `key` under `strategy`. Returns the process exit code.
pub async fn cmd_story(project_dir: &Path, verbose: bool, key: &str, strategy: Strategy) -> Result<i32> {
    let ws = Workspace::load(project_dir, verbose)?;
    let pool = ws.agent_pool()?;
    let tracker = Arc::new(UsageTracker::new(Some(key)));
    let scheduler = ws
        .scheduler(pool)?
        .with_strategy(strategy.clone())
        .with_tracker(tracker.clone());

    println!(
        "{} story {} ({})",
        style("Running").bold(),
        style(key).cyan(),
        strategy.label()
    );

    let interrupt = spawn_interrupt_handler(scheduler.cancel_handle());
    let result = scheduler.resume(key).await;
    interrupt.abort();
    scheduler.shutdown().await;

    if !tracker.events().is_empty() {
        let session = tracker.close();
        if let Err(e) = SessionStore::new(&ws.config.sessions_dir).save(&session) {
            warn!(story = key, error = %e, "failed to save usage session");
        }
    }

    let outcome = result?;
    print_outcome(&outcome);
    Ok(outcome.exit_code())
}

pub(crate) fn print_outcome(outcome: &StoryOutcome) {
    println!();
    for transition in &outcome.gate_transitions {
        println!("  {}auto-fixed {}", ui::WARN, transition);
    }
    let icon = match outcome.status {
        StoryStatus::Done => ui::CHECK,
        StoryStatus::Failed => ui::CROSS,
        _ if outcome.cancelled => ui::STOP,
        _ => ui::BLOCKER,
    };
    println!("{}{}", icon, outcome.summary());
    for entry in &outcome.story.budget {
        if entry.spent > 0.0 {
            println!(
                "  {:<16} {:>8.2} / {:<8.2} {}",
                entry.category, entry.spent, entry.cap, entry.currency
            );
        }
    }
}
