//! Synth command - Generate the stack templates.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use tracing::info;

use cicd_iac::{CloudApp, TemplateFormat};

use super::{out_dir, CliError, Context};

#[derive(Args)]
pub struct SynthArgs {
    /// Output directory
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Template format (json or yaml)
    #[arg(short, long, default_value = "json")]
    format: String,
}

pub async fn execute(args: SynthArgs, ctx: &Context) -> Result<()> {
    let format = TemplateFormat::from_str(&args.format)
        .ok_or_else(|| CliError::InvalidArgument(format!("unknown template format '{}'", args.format)))?;
    let out = out_dir(args.out);

    let config = ctx.load_config()?;
    let assembly = CloudApp::synth(&config).context("Failed to synthesize stacks")?;

    info!("Writing assembly to {:?}", out);
    let manifest = assembly
        .write_to(&out, format)
        .with_context(|| format!("Failed to write assembly to {:?}", out))?;

    ctx.say(format!("✅ Synthesized {} stacks to {}", manifest.stacks.len(), out.display()));
    for entry in &manifest.stacks {
        ctx.say(format!("   📄 {}", entry.template_file));
    }

    Ok(())
}
