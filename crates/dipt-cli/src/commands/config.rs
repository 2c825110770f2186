//! Config command implementation.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use dipt_core::ConfigLoader;

/// Arguments for the config command.
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,

    /// Change a user setting (os, arch, save_dir)
    Set {
        /// Setting name
        key: String,
        /// New value
        value: String,
    },

    /// Write an example config.json in the current directory
    Init,
}

/// Runs the config command.
pub fn run(args: ConfigArgs) -> Result<()> {
    let loader = ConfigLoader::discover();
    match args.command {
        ConfigCommand::Show => {
            let config = loader.load().context("Failed to load configuration")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            if config.has_credentials() {
                println!("(registry credentials are set)");
            }
        }
        ConfigCommand::Set { key, value } => {
            loader
                .set_value(&key, &value)
                .with_context(|| format!("Failed to set {key}"))?;
            println!("Set {key} = {value}");
        }
        ConfigCommand::Init => {
            let path = loader.init_project()?;
            println!("Created {}", path.display());
        }
    }
    Ok(())
}
