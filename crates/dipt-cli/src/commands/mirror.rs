//! Mirror command implementation.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use dipt_core::{ChannelSink, ConfigLoader, EventSink, PullEvent, TracingSink};
use dipt_pull::{HttpProbe, MirrorManager};
use tracing::info;

/// Arguments for the mirror command.
#[derive(Args)]
pub struct MirrorArgs {
    #[command(subcommand)]
    pub command: MirrorCommand,
}

/// Mirror subcommands.
#[derive(Subcommand)]
pub enum MirrorCommand {
    /// List configured mirrors
    List,

    /// Add a mirror
    Add {
        /// Mirror URL (e.g. https://mirror.example.com)
        url: String,
    },

    /// Remove a mirror
    Del {
        /// Mirror URL as configured
        url: String,
    },

    /// Remove all mirrors
    Clear,

    /// Query a mirror's /v2/ endpoint and show the raw answer
    Test {
        /// Mirror URL
        url: String,
    },

    /// Probe every effective mirror concurrently
    Probe,
}

/// Runs the mirror command.
pub async fn run(args: MirrorArgs, verbose: bool) -> Result<()> {
    let loader = ConfigLoader::discover();
    match args.command {
        MirrorCommand::List => {
            let mirrors = loader.mirrors().context("Failed to read mirrors")?;
            if mirrors.is_empty() {
                println!("No mirrors configured");
            }
            for (i, mirror) in mirrors.iter().enumerate() {
                println!("{}. {mirror}", i + 1);
            }
        }
        MirrorCommand::Add { url } => {
            loader
                .add_mirror(&url)
                .with_context(|| format!("Failed to add mirror {url}"))?;
            println!("Added mirror {url}");
        }
        MirrorCommand::Del { url } => {
            loader
                .remove_mirror(&url)
                .with_context(|| format!("Failed to remove mirror {url}"))?;
            println!("Removed mirror {url}");
        }
        MirrorCommand::Clear => {
            loader.clear_mirrors().context("Failed to clear mirrors")?;
            println!("Cleared all mirrors");
        }
        MirrorCommand::Test { url } => test_mirror(&url).await?,
        MirrorCommand::Probe => probe_mirrors(&loader, verbose).await?,
    }
    Ok(())
}

async fn test_mirror(url: &str) -> Result<()> {
    let report = HttpProbe::new()?
        .inspect(url)
        .await
        .with_context(|| format!("Failed to reach mirror {url}"))?;

    println!("GET {}", report.url);
    println!("Status: {}", report.status);
    println!("Headers:");
    for (name, value) in &report.headers {
        println!("  {name}: {value}");
    }
    println!("Body (first 512 bytes):");
    println!("{}", report.body_preview);
    println!();
    if report.available {
        println!("Mirror is usable");
    } else {
        println!("Mirror is not usable (expected status 200 or 401)");
    }
    Ok(())
}

async fn probe_mirrors(loader: &ConfigLoader, verbose: bool) -> Result<()> {
    let config = loader.load().context("Failed to load configuration")?;
    if config.registry.mirrors.is_empty() {
        println!("No mirrors configured");
        return Ok(());
    }
    info!(count = config.registry.mirrors.len(), "Probing mirrors");

    let (sink, mut events) = ChannelSink::new();
    let printer = tokio::spawn(async move {
        let log = TracingSink::new(verbose);
        while let Some(event) = events.recv().await {
            if let PullEvent::Probe(probe) = &event {
                let status = if probe.available { "ok" } else { "unavailable" };
                let detail = probe.error.as_deref().unwrap_or("");
                println!(
                    "{:<40} {:<12} {:>6}ms {detail}",
                    probe.url,
                    status,
                    probe.latency.as_millis()
                );
            }
            log.emit(event);
        }
    });

    let manager = MirrorManager::with_mirrors(
        config.registry.mirrors.iter().cloned(),
        Arc::new(HttpProbe::new()?),
    )
    .with_sink(Arc::new(sink));
    let available = manager.probe_all().await;
    let total = manager.len();
    drop(manager);
    printer.await.context("Probe output task failed")?;

    println!("{available}/{total} mirrors available");
    Ok(())
}
