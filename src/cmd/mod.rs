//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `story`         | `Story`, `Collab`                                  |
//! | `checkpoint`    | `Checkpoint`                                       |
//! | `validate`      | `Validate`                                         |
//! | `route`         | `Route`                                            |
//! | `status`        | `Status`                                           |
//! | `config`        | `Config`                                           |
//!
//! Shared setup (settings, agent pool, scheduler, Ctrl-C handling) lives here.

pub mod checkpoint;
pub mod config;
pub mod route;
pub mod status;
pub mod story;
pub mod validate;

pub use checkpoint::cmd_checkpoint;
pub use config::cmd_config;
pub use route::cmd_route;
pub use status::cmd_status;
pub use story::cmd_story;
pub use validate::cmd_validate;

use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;
use storyforge::agent::{AgentPool, CommandAgent, CommandAgentConfig, MemoryStore, PersonaLayer, resolve};
use storyforge::config::Config;
use storyforge::router::AgentRegistry;
use storyforge::scheduler::{CancelHandle, CancelMode, PhaseScheduler};
use storyforge::settings::Settings;
use storyforge::ui;
use tracing::{info, warn};

/// Memory entries injected into each agent's persona.
const PERSONA_MEMORY_LIMIT: usize = 20;

/// Resolved settings and paths for one invocation.
pub struct Workspace {
    pub settings: Settings,
    pub config: Config,
}

impl Workspace {
    /// Load and validate configuration. Invalid settings fail here, before
    /// any story moves.
    pub fn load(project_dir: &Path, verbose: bool) -> Result<Self> {
        let settings = Settings::load(project_dir, verbose)?;
        for warning in settings.toml.validate()? {
            warn!(warning = %warning, "configuration warning");
        }
        let config = Config::from_settings(&settings);
        Ok(Self { settings, config })
    }

    /// One command-backed agent per registered role, personas resolved from
    /// `agents/<id>.yaml`, `[agents.<id>]`, `agents/<id>.override.yaml` and memory.
    pub fn agent_pool(&self) -> Result<AgentPool> {
        let registry = AgentRegistry::builtin();
        let memory = MemoryStore::new(&self.config.memory_dir);
        let command = CommandAgentConfig {
            agent_cmd: self.settings.agent_cmd(),
            project_dir: self.config.project_dir.clone(),
            timeout: self.settings.toml.pipeline.agent_timeout(),
            skip_permissions: self.settings.toml.project.skip_permissions,
        };

        let mut pool = AgentPool::new();
        for id in registry.ids() {
            let (base_path, override_path) = self.config.persona_files(id);
            let base = PersonaLayer::load_optional(&base_path)?.unwrap_or_else(|| registry.base_persona(id));
            let overrides = PersonaLayer::load_optional(&override_path)?;
            let recent = memory.recent(id, PERSONA_MEMORY_LIMIT)?;
            let persona = resolve(&base, self.settings.toml.agents.get(id), overrides.as_ref(), &recent);
            pool.insert(Arc::new(CommandAgent::new(id, persona, command.clone())));
        }
        info!(agents = pool.ids().len(), cmd = %command.agent_cmd, "agent pool ready");
        Ok(pool)
    }

    /// Scheduler over `pool`. Creates the `.storyforge/` layout on first use.
    pub fn scheduler(&self, pool: AgentPool) -> Result<PhaseScheduler> {
        self.config.ensure_directories()?;
        Ok(PhaseScheduler::new(self.config.clone(), &self.settings.toml, pool))
    }
}

/// First Ctrl-C finishes the current phase, the second abandons it.
pub fn spawn_interrupt_handler(cancel: CancelHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            match cancel.escalate() {
                CancelMode::Graceful => eprintln!(
                    "\n{}{}",
                    ui::STOP,
                    style("Stopping after the current phase. Press Ctrl-C again to abort it.").yellow()
                ),
                _ => eprintln!("\n{}{}", ui::STOP, style("Aborting the in-flight agent call.").red()),
            }
        }
    })
}
