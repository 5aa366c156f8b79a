//! Task routing command: `storyforge route`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use storyforge::router::{AgentRegistry, CollaborationRouter, Strategy};
use storyforge::story::StoryDefinition;
use storyforge::util::{slugify, write_atomic};

use super::Workspace;
use super::story::cmd_story;

const SLUG_MAX: usize = 40;

/// Key of the ad-hoc story that runs `task`.
pub fn adhoc_key(task: &str) -> String {
    let slug = slugify(task, SLUG_MAX);
    if slug.is_empty() {
        "adhoc-task".to_string()
    } else {
        format!("adhoc-{}", slug)
    }
}

/// Print the routing decision for `task`; unless `route_only`, run it as an
/// ad-hoc story.
pub async fn cmd_route(project_dir: &Path, verbose: bool, task: &str, route_only: bool) -> Result<i32> {
    let ws = Workspace::load(project_dir, verbose)?;
    let router = CollaborationRouter::new(
        AgentRegistry::builtin(),
        ws.settings.toml.collab.max_swarm_iterations,
    );
    let decision = router.route(task, Strategy::Auto);

    println!();
    println!("{}", style("Routing decision").bold());
    for line in decision.render().lines() {
        println!("  {}", line);
    }
    if route_only {
        return Ok(0);
    }

    let key = adhoc_key(task);
    ws.config.ensure_directories()?;
    let story_file = ws.config.story_file(&key);
    if !story_file.exists() {
        write_atomic(&story_file, format!("# {}\n\n{}\n", key, task).as_bytes())?;
    }
    let definition_file = ws.config.stories_dir.join(format!("{}.yaml", key));
    if !definition_file.exists() {
        let definition = StoryDefinition {
            description: Some(task.to_string()),
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&definition).context("Failed to serialize story definition")?;
        write_atomic(&definition_file, yaml.as_bytes())?;
    }
    println!("  Story:      {}", style(&key).cyan());
    println!();

    cmd_story(project_dir, verbose, &key, decision.strategy).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adhoc_key() {
        assert_eq!(adhoc_key("Fix the login bug"), "adhoc-fix-the-login-bug");
        assert_eq!(adhoc_key("!!!"), "adhoc-task");
    }
}
