//! Configuration view and validation commands: `storyforge config`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use storyforge::settings::Settings;
use storyforge::ui;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, verbose: bool, command: Option<ConfigCommands>) -> Result<i32> {
    let settings = Settings::load(project_dir, verbose)?;
    let config_path = settings.config_path();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", style("Storyforge Configuration").bold());
            println!("========================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No storyforge.toml found at {}", config_path.display());
                println!("Using defaults.");
            }
            println!();
            println!("Effective values (with .env and environment overrides):");
            println!();
            let rendered =
                toml::to_string_pretty(&settings.toml).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();
            println!("agent command: {}", settings.agent_cmd());
            Ok(0)
        }
        Some(ConfigCommands::Validate) => match settings.toml.validate() {
            Ok(warnings) => {
                println!();
                if warnings.is_empty() {
                    println!("{}Configuration is valid", ui::CHECK);
                } else {
                    println!("{}Configuration is valid with warnings:", ui::WARN);
                    for warning in &warnings {
                        println!("  - {}", style(warning).yellow());
                    }
                }
                Ok(0)
            }
            Err(e) => {
                println!();
                println!("{}{}", ui::CROSS, style(e.to_string()).red());
                Ok(1)
            }
        },
    }
}
