//! CLI commands and argument parsing.

pub mod config;
pub mod mirror;
pub mod plan;

use clap::{Parser, Subcommand};

/// dipt - resilient container image puller
#[derive(Parser)]
#[command(name = "dipt")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Show debug output, including retry and mirror failures
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Show what a pull would do, without transferring anything
    Plan(plan::PlanArgs),

    /// Manage registry mirrors
    Mirror(mirror::MirrorArgs),

    /// Show or change configuration
    Config(config::ConfigArgs),

    /// Print version information
    Version,
}
