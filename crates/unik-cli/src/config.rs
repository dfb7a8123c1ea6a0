use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use unik_config::Config;

const PROJECT_CONFIG: &str = ".unik/config.toml";

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Print the global and project config file locations
    Path,

    /// Write a default config file
    Init {
        /// Write ~/.unik/config.toml instead of .unik/config.toml
        #[arg(long)]
        global: bool,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn run(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = unik_config::config().clone();
            print!("{}", config.to_toml()?);
            Ok(())
        }
        ConfigCommands::Path => {
            let global = Config::global_config_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(no home directory)".to_string());
            println!("Global:  {}", global);
            println!("Project: {}", PROJECT_CONFIG);
            Ok(())
        }
        ConfigCommands::Init { global, force } => {
            let path = if global {
                Config::global_config_path().context("Cannot determine home directory")?
            } else {
                PathBuf::from(PROJECT_CONFIG)
            };
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).with_context(|| format!("Cannot create {}", parent.display()))?;
            }
            fs::write(&path, Config::default_toml()).with_context(|| format!("Cannot write {}", path.display()))?;
            println!("Created {}", path.display());
            Ok(())
        }
    }
}
