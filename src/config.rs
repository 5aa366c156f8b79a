use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::settings::Settings;

/// Runtime paths for one storyforge project.
///
/// Everything lives under `<project>/.storyforge/`. Paths are resolved once
/// from the canonical project directory and never re-derived.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub storyforge_dir: PathBuf,
    pub stories_dir: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub memory_dir: PathBuf,
    pub agents_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub log_dir: PathBuf,
    pub sprint_status_file: PathBuf,
    pub config_file: PathBuf,
    pub verbose: bool,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        Ok(Self::at(project_dir, verbose))
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::at(settings.project_dir.clone(), settings.verbose)
    }

    fn at(project_dir: PathBuf, verbose: bool) -> Self {
        let storyforge_dir = project_dir.join(".storyforge");
        Self {
            stories_dir: storyforge_dir.join("stories"),
            checkpoints_dir: storyforge_dir.join("checkpoints"),
            sessions_dir: storyforge_dir.join("sessions"),
            memory_dir: storyforge_dir.join("memory"),
            agents_dir: storyforge_dir.join("agents"),
            archive_dir: storyforge_dir.join("archive"),
            log_dir: storyforge_dir.join("logs"),
            sprint_status_file: storyforge_dir.join("sprint-status.yaml"),
            config_file: storyforge_dir.join("storyforge.toml"),
            storyforge_dir,
            project_dir,
            verbose,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.stories_dir).context("Failed to create stories directory")?;
        std::fs::create_dir_all(&self.checkpoints_dir)
            .context("Failed to create checkpoints directory")?;
        std::fs::create_dir_all(&self.sessions_dir).context("Failed to create sessions directory")?;
        std::fs::create_dir_all(&self.memory_dir).context("Failed to create memory directory")?;
        std::fs::create_dir_all(&self.agents_dir).context("Failed to create agents directory")?;
        std::fs::create_dir_all(&self.archive_dir).context("Failed to create archive directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    /// `stories/<key>.md`, the story file the preflight gate looks for.
    pub fn story_file(&self, key: &str) -> PathBuf {
        self.stories_dir.join(format!("{}.md", key))
    }

    pub fn archive_file(&self, key: &str) -> PathBuf {
        self.archive_dir.join(format!("{}.json", key))
    }

    /// Base persona and override files for `agent_id`.
    pub fn persona_files(&self, agent_id: &str) -> (PathBuf, PathBuf) {
        (
            self.agents_dir.join(format!("{}.yaml", agent_id)),
            self.agents_dir.join(format!("{}.override.yaml", agent_id)),
        )
    }

    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.project_dir).unwrap_or(path)
    }
}
