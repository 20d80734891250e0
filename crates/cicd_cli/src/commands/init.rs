//! Init command - Write a default configuration file.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use tracing::info;

use cicd_iac::{WorkshopConfig, DEFAULT_CONFIG_FILE};

use super::Context;

#[derive(Args)]
pub struct InitArgs {
    /// Path of the configuration file (`.toml` writes TOML, anything else YAML)
    #[arg(short, long)]
    path: Option<PathBuf>,

    /// AWS region to record in the configuration
    #[arg(short, long)]
    region: Option<String>,

    /// Overwrite an existing file
    #[arg(short, long)]
    force: bool,
}

pub async fn execute(args: InitArgs, ctx: &Context) -> Result<()> {
    let path = args
        .path
        .or_else(|| ctx.config.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if path.exists() && !args.force {
        anyhow::bail!(
            "Configuration already exists at {:?}. Use --force to overwrite.",
            path
        );
    }

    let mut config = WorkshopConfig::default();
    if let Some(region) = args.region {
        config = config.with_region(region);
    }

    info!("Writing default configuration to {:?}", path);
    config
        .save(&path)
        .with_context(|| format!("Failed to write {:?}", path))?;

    ctx.say(format!("✅ Configuration written to {}", path.display()));
    ctx.say("");
    ctx.say("Next steps:");
    ctx.say("  cicd synth --out cdk.out");

    Ok(())
}
