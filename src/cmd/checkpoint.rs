//! Checkpoint commands: `storyforge checkpoint save|restore|list`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use storyforge::agent::AgentPool;
use storyforge::checkpoint::{Checkpoint, CheckpointId, CheckpointStore, CheckpointTrigger};
use storyforge::story::{SprintStatus, StorySnapshot, StoryStatus};
use storyforge::ui;

use super::super::CheckpointCommands;
use super::Workspace;

pub async fn cmd_checkpoint(project_dir: &Path, verbose: bool, command: CheckpointCommands) -> Result<i32> {
    let ws = Workspace::load(project_dir, verbose)?;
    match command {
        CheckpointCommands::Save { key } => save(&ws, &key).await,
        CheckpointCommands::Restore { target } => restore(&ws, &target),
        CheckpointCommands::List { key } => list(&ws, &key),
    }
}

/// Checkpoint the story as it would be resumed right now.
async fn save(ws: &Workspace, key: &str) -> Result<i32> {
    let scheduler = ws.scheduler(AgentPool::new())?;
    let loaded = scheduler.load_story(key);
    scheduler.shutdown().await;
    let (story, tokens) = loaded?;

    let phase = story
        .next_phase()
        .or(story.phases.len().checked_sub(1))
        .map(|i| story.phases[i].name.clone())
        .unwrap_or_default();
    let snapshot = StorySnapshot {
        story,
        context_tokens: tokens,
    };
    let checkpoint = Checkpoint::capture(key, &phase, CheckpointTrigger::Manual, &snapshot, tokens)?;
    let id = CheckpointStore::new(&ws.config.checkpoints_dir).save(checkpoint)?;
    println!("{}Saved checkpoint {} (phase '{}')", ui::CHECK, style(&id).cyan(), phase);
    Ok(0)
}

/// Make `target` the story's resume point.
///
/// An older checkpoint is re-saved as a new manual checkpoint, since runs
/// always resume from the latest one. A story that stopped short of `done`
/// is marked blocked so the next run picks it up.
fn restore(ws: &Workspace, target: &str) -> Result<i32> {
    let store = CheckpointStore::new(&ws.config.checkpoints_dir);
    let (key, checkpoint) = if target.contains('@') {
        let id: CheckpointId = target.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        let checkpoint = store.restore(&id)?;
        (id.story_id, checkpoint)
    } else {
        let checkpoint = store
            .latest(target)?
            .with_context(|| format!("No checkpoints found for story {}", target))?;
        (target.to_string(), checkpoint)
    };

    let snapshot: StorySnapshot = checkpoint.state()?;
    let restored = checkpoint.id();
    let latest = store.latest(&key)?.map(|c| c.id());
    let resume_from = if latest.as_ref() == Some(&restored) {
        restored.clone()
    } else {
        let mut copy = checkpoint.clone();
        copy.trigger = CheckpointTrigger::Manual;
        store.save(copy)?
    };

    let table = SprintStatus::load(&ws.config.sprint_status_file)?;
    let resumable = table
        .get(&key)
        .is_some_and(|status| !matches!(status, StoryStatus::Done | StoryStatus::Blocked));
    if resumable && snapshot.story.status != StoryStatus::Done {
        SprintStatus::update(&ws.config.sprint_status_file, &key, StoryStatus::Blocked)?;
    }

    println!(
        "{}Restored {} as {} ({} of {} phases done, {:.2} {} spent)",
        ui::CHECK,
        style(&restored).cyan(),
        style(&resume_from).cyan(),
        snapshot.story.phases.iter().filter(|p| p.is_done()).count(),
        snapshot.story.phases.len(),
        snapshot.story.total_spent(),
        snapshot.story.currency
    );
    println!("  continue with: storyforge story {}", key);
    Ok(0)
}

fn list(ws: &Workspace, key: &str) -> Result<i32> {
    let checkpoints = CheckpointStore::new(&ws.config.checkpoints_dir).list(key)?;
    if checkpoints.is_empty() {
        println!("No checkpoints for story {}", key);
        return Ok(0);
    }

    println!();
    println!("{}", style(format!("Checkpoints for {}", key)).bold());
    println!(
        "  {:<6} {:<20} {:<18} {:<16} {:>10}",
        "SEQ", "TIMESTAMP", "TRIGGER", "PHASE", "TOKENS"
    );
    for cp in &checkpoints {
        println!(
            "  {:<6} {:<20} {:<18} {:<16} {:>10}",
            cp.sequence,
            cp.timestamp.format("%Y-%m-%d %H:%M:%S"),
            cp.trigger.to_string(),
            cp.phase_name,
            cp.estimated_context_tokens
        );
    }
    Ok(0)
}
