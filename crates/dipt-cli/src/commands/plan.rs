//! Plan command implementation.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use dipt_core::{ConfigLoader, EffectiveConfig, Platform, PullOverrides, SUPPORTED_ARCH, SUPPORTED_OS};
use dipt_pull::{plan_pull, PullPlan, PullRequest};
use tracing::info;

/// Arguments for the plan command.
#[derive(Args)]
pub struct PlanArgs {
    /// Image to pull (e.g. nginx:1.25, ghcr.io/org/app:v1)
    pub image: String,

    /// Archive path (defaults to the configured save directory)
    pub output: Option<PathBuf>,

    /// Target operating system
    #[arg(long)]
    pub os: Option<String>,

    /// Target architecture
    #[arg(long)]
    pub arch: Option<String>,

    /// Mirror to try before the configured ones
    #[arg(long, env = "DIPT_CUSTOM_MIRROR")]
    pub mirror: Option<String>,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

/// Runs the plan command.
pub fn run(args: &PlanArgs) -> Result<()> {
    let config = ConfigLoader::discover()
        .load()
        .context("Failed to load configuration")?;

    let request = build_request(args, &config)?;
    let mut overrides = PullOverrides::from_env().with_dry_run(true);
    if let Some(mirror) = &args.mirror {
        overrides = overrides.with_custom_mirror(mirror.clone());
    }

    let plan = plan_pull(&request, &config, &overrides)
        .with_context(|| format!("Invalid image reference '{}'", args.image))?;
    info!(image = %plan.reference, platform = %plan.platform, "Planned pull");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan_json(&plan))?);
    } else {
        print_plan(&plan);
    }
    Ok(())
}

fn build_request(args: &PlanArgs, config: &EffectiveConfig) -> Result<PullRequest> {
    if let Some(os) = args.os.as_deref() {
        if !SUPPORTED_OS.contains(&os) {
            bail!("Unsupported OS '{os}', expected one of: {}", SUPPORTED_OS.join(", "));
        }
    }
    if let Some(arch) = args.arch.as_deref() {
        if !SUPPORTED_ARCH.contains(&arch) {
            bail!(
                "Unsupported architecture '{arch}', expected one of: {}",
                SUPPORTED_ARCH.join(", ")
            );
        }
    }

    let mut request = PullRequest::new(&args.image);
    if args.os.is_some() || args.arch.is_some() {
        request = request.with_platform(Platform::new(
            args.os.clone().unwrap_or_else(|| config.default_os.clone()),
            args.arch.clone().unwrap_or_else(|| config.default_arch.clone()),
        ));
    }
    if let Some(output) = &args.output {
        request = request.with_output(output);
    }
    Ok(request)
}

fn plan_json(plan: &PullPlan) -> serde_json::Value {
    serde_json::json!({
        "image": plan.image,
        "reference": plan.reference.to_string(),
        "platform": plan.platform,
        "output": plan.output,
        "authenticated": !plan.auth.is_anonymous(),
        "mirrors": plan.mirrors,
        "use_mirrors": plan.use_mirrors,
        "timeout_secs": plan.timeout.as_secs(),
    })
}

fn print_plan(plan: &PullPlan) {
    println!("Image:     {}", plan.reference);
    println!("Platform:  {}", plan.platform);
    println!("Output:    {}", plan.output.display());
    println!(
        "Auth:      {}",
        if plan.auth.is_anonymous() {
            "anonymous"
        } else {
            "basic"
        }
    );
    println!("Timeout:   {}s", plan.timeout.as_secs());
    if plan.use_mirrors {
        println!("Mirrors:");
        for (i, mirror) in plan.mirrors.iter().enumerate() {
            println!("  {}. {mirror}", i + 1);
        }
    } else if plan.mirrors.is_empty() {
        println!("Mirrors:   none configured");
    } else {
        println!("Mirrors:   skipped ({} is not the default registry)", plan.reference.registry());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(image: &str) -> PlanArgs {
        PlanArgs {
            image: image.to_string(),
            output: None,
            os: None,
            arch: None,
            mirror: None,
            json: false,
        }
    }

    #[test]
    fn test_request_uses_config_platform_when_unset() {
        let request = build_request(&args("nginx"), &EffectiveConfig::default()).unwrap();
        assert_eq!(request.platform, None);
    }

    #[test]
    fn test_request_fills_missing_half_of_platform() {
        let mut args = args("nginx");
        args.arch = Some("arm64".into());
        let request = build_request(&args, &EffectiveConfig::default()).unwrap();
        assert_eq!(request.platform, Some(Platform::new("linux", "arm64")));
    }

    #[test]
    fn test_request_rejects_unsupported_os() {
        let mut args = args("nginx");
        args.os = Some("plan9".into());
        assert!(build_request(&args, &EffectiveConfig::default()).is_err());
    }

    #[test]
    fn test_plan_json_hides_credentials() {
        let config = EffectiveConfig::default().with_credentials("alice", "s3cret");
        let plan = plan_pull(&PullRequest::new("nginx"), &config, &PullOverrides::default()).unwrap();
        let json = plan_json(&plan).to_string();
        assert!(json.contains("\"authenticated\":true"));
        assert!(!json.contains("s3cret"));
    }
}
