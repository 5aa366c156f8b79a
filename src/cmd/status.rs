//! Project status command: `storyforge status`.

use anyhow::Result;
use chrono::Utc;
use console::style;
use std::collections::BTreeMap;
use std::path::Path;
use storyforge::budget::{BudgetLedger, BudgetLevel};
use storyforge::checkpoint::CheckpointStore;
use storyforge::story::{SprintStatus, StorySnapshot};
use storyforge::ui;
use storyforge::usage::SessionStore;
use tracing::warn;

use super::Workspace;

pub fn cmd_status(project_dir: &Path, verbose: bool) -> Result<i32> {
    let ws = Workspace::load(project_dir, verbose)?;
    let table = SprintStatus::load(&ws.config.sprint_status_file)?;
    let store = CheckpointStore::new(&ws.config.checkpoints_dir);
    let ledger = BudgetLedger::new(ws.settings.toml.budget.clone());

    println!();
    println!("{}", style("Sprint status").bold());
    if table.development_status.is_empty() {
        println!("  No stories have started yet.");
    }

    // Spend per category, from each story's latest checkpoint.
    let mut totals: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    for (key, status) in &table.development_status {
        let snapshot = match store.latest(key) {
            Ok(Some(checkpoint)) => checkpoint.state::<StorySnapshot>().ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(story = %key, error = %e, "latest checkpoint unreadable");
                None
            }
        };
        match snapshot {
            Some(snapshot) => {
                let story = snapshot.story;
                let done = story.phases.iter().filter(|p| p.is_done()).count();
                println!(
                    "  {:<28} {:<14} {}/{} phases  {:>8.2} {}",
                    key,
                    ui::status(*status),
                    done,
                    story.phases.len(),
                    story.total_spent(),
                    story.currency
                );
                for entry in &story.budget {
                    let total = totals.entry(entry.category.clone()).or_default();
                    total.0 += entry.spent;
                    total.1 += entry.cap;
                }
                ledger.open_story(key, story.budget);
            }
            None => println!("  {:<28} {}", key, ui::status(*status)),
        }
    }

    let currency = &ws.settings.toml.budget.currency;
    if !totals.is_empty() {
        println!();
        println!("{}", style("Budget usage").bold());
        for (category, (spent, cap)) in &totals {
            let percent = ledger.category_usage_percent(category);
            println!(
                "  {:<16} {:>8.2} / {:<8.2} {} {:>5.1}%  {}",
                category,
                spent,
                cap,
                currency,
                percent,
                ui::level(BudgetLevel::classify(percent, ledger.config()))
            );
        }
    }

    let sessions = SessionStore::new(&ws.config.sessions_dir).list()?;
    let aggregate = ledger.rolling_aggregate(&sessions, Utc::now());
    println!();
    println!("{}", style("Rolling aggregate").bold());
    println!(
        "  last {} days: {:.2} {} across {} sessions (+ {:.2} baseline) = {:.2} {}",
        aggregate.window_days,
        aggregate.session_cost,
        currency,
        sessions.len(),
        aggregate.baseline_offset,
        aggregate.total,
        currency
    );
    Ok(0)
}
