//! Gate validation command: `storyforge validate`.

use anyhow::{Result, bail};
use console::style;
use std::path::Path;
use storyforge::agent::AgentPool;
use storyforge::gates::{GateEngine, Tier};
use storyforge::ui;

use super::Workspace;

/// `all`, or a single tier by number or name.
fn parse_tiers(value: &str) -> Result<Vec<Tier>> {
    if value.eq_ignore_ascii_case("all") {
        return Ok(Tier::ALL.to_vec());
    }
    match value.parse::<Tier>() {
        Ok(tier) => Ok(vec![tier]),
        Err(e) => bail!("{}", e),
    }
}

/// Exit code 0 when every requested tier passes, 2 otherwise.
pub async fn cmd_validate(
    project_dir: &Path,
    verbose: bool,
    key: &str,
    tier: &str,
    auto_fix: bool,
) -> Result<i32> {
    let tiers = parse_tiers(tier)?;
    let ws = Workspace::load(project_dir, verbose)?;
    let gates = GateEngine::standard(&ws.settings.toml.gates).with_auto_fix(auto_fix);
    let scheduler = ws.scheduler(AgentPool::new())?.with_gates(gates);

    let loaded = scheduler.load_story(key);
    let story = match loaded {
        Ok((story, _)) => story,
        Err(e) => {
            scheduler.shutdown().await;
            return Err(e.into());
        }
    };

    println!();
    println!("{}", style(format!("Validating {} ({})", key, story.status)).bold());

    let mut passed = true;
    for tier in tiers {
        let report = scheduler.validate(&story, tier).await;
        let rendered = report.render();
        let mut lines = rendered.lines();
        println!();
        if let Some(header) = lines.next() {
            println!("{}{}", ui::outcome_icon(report.outcome()), header);
        }
        for line in lines {
            println!("{}", line);
        }
        passed &= report.passed();
    }
    scheduler.shutdown().await;

    println!();
    if passed {
        println!("{}{}", ui::CHECK, style("All gates passed").green());
        Ok(0)
    } else {
        println!("{}{}", ui::CROSS, style("Validation failed").red().bold());
        Ok(2)
    }
}
