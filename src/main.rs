use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use storyforge::config::Config;
use storyforge::router::Strategy;

mod cmd;

#[derive(Parser)]
#[command(name = "storyforge")]
#[command(version, about = "Story pipeline orchestrator for AI agent teams")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a story through its phases (a blocked story resumes from its latest checkpoint)
    Story { key: String },
    /// Run a story under a collaboration strategy
    Collab {
        key: String,
        #[command(flatten)]
        strategy: StrategyArgs,
    },
    /// Save, restore or list story checkpoints
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Run validation gates against a story without executing phases
    Validate {
        key: String,

        /// Tier to run: 1, 2, 3 or all
        #[arg(long, default_value = "all")]
        tier: String,

        /// Let gates apply their fix before failing
        #[arg(long)]
        auto_fix: bool,
    },
    /// Classify a task and pick a collaboration strategy
    Route {
        /// Task description
        #[arg(required = true, num_args = 1..)]
        task: Vec<String>,

        /// Print the routing decision without running it
        #[arg(long)]
        route_only: bool,
    },
    /// Show sprint status, budget usage and the rolling cost aggregate
    Status,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Clone, Default)]
#[group(multiple = false)]
pub struct StrategyArgs {
    /// Parallel agents with a consensus vote
    #[arg(long)]
    pub swarm: bool,
    /// Developer and reviewer alternate until approval
    #[arg(long)]
    pub pair: bool,
    /// Let the router pick from the task (default)
    #[arg(long)]
    pub auto: bool,
    /// One agent per phase
    #[arg(long)]
    pub sequential: bool,
}

impl StrategyArgs {
    pub fn strategy(&self) -> Strategy {
        if self.swarm {
            // Agents and rounds are filled in by the router.
            Strategy::Swarm {
                agents: Vec::new(),
                max_iterations: 0,
            }
        } else if self.pair {
            Strategy::Pair
        } else if self.sequential {
            Strategy::Sequential
        } else {
            Strategy::Auto
        }
    }
}

#[derive(Subcommand, Clone)]
pub enum CheckpointCommands {
    /// Checkpoint the story's current state
    Save { key: String },
    /// Make a checkpoint the resume point: `<key>` for the latest, `<key>@<seq>` for a specific one
    Restore { target: String },
    /// List a story's checkpoints
    List { key: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // File logging only once the project has a `.storyforge/` directory.
    let log_dir = Config::new(project_dir.clone(), cli.verbose)
        .ok()
        .filter(|config| config.storyforge_dir.is_dir())
        .map(|config| config.log_dir);
    let guard = storyforge::logging::init(cli.verbose, log_dir.as_deref());

    let code = match &cli.command {
        Commands::Story { key } => cmd::cmd_story(&project_dir, cli.verbose, key, Strategy::Sequential).await?,
        Commands::Collab { key, strategy } => {
            cmd::cmd_story(&project_dir, cli.verbose, key, strategy.strategy()).await?
        }
        Commands::Checkpoint { command } => cmd::cmd_checkpoint(&project_dir, cli.verbose, command.clone()).await?,
        Commands::Validate { key, tier, auto_fix } => {
            cmd::cmd_validate(&project_dir, cli.verbose, key, tier, *auto_fix).await?
        }
        Commands::Route { task, route_only } => {
            cmd::cmd_route(&project_dir, cli.verbose, &task.join(" "), *route_only).await?
        }
        Commands::Status => cmd::cmd_status(&project_dir, cli.verbose)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, cli.verbose, command.clone())?,
    };

    // Flush the file log before exiting with a non-zero code.
    drop(guard);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
