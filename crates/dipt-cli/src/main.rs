//! dipt CLI - plans image pulls and manages registry mirrors.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "dipt=debug" } else { "dipt=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Plan(args) => commands::plan::run(&args),
        Commands::Mirror(args) => commands::mirror::run(args, cli.verbose).await,
        Commands::Config(args) => commands::config::run(args),
        Commands::Version => {
            println!("dipt {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
