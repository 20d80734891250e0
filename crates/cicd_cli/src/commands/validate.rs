//! Validate command - Check a synthesized assembly.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::Args;
use tracing::{info, warn};
use walkdir::WalkDir;

use cicd_iac::{Assembly, Manifest, TemplateAssertions};

use super::{out_dir, CliError, Context};

#[derive(Args)]
pub struct ValidateArgs {
    /// Directory written by `cicd synth`
    #[arg(short, long)]
    out: Option<PathBuf>,
}

pub async fn execute(args: ValidateArgs, ctx: &Context) -> Result<()> {
    let out = out_dir(args.out);
    info!("Validating assembly in {:?}", out);

    let config = ctx.load_config()?;
    let (manifest, assembly) =
        Assembly::load(&out).with_context(|| format!("Failed to read assembly from {:?}", out))?;

    for stray in unlisted_templates(&out, &manifest) {
        warn!("Template not listed in manifest: {}", stray.display());
    }

    let report = TemplateAssertions::new(&config.health_check).check(&assembly);

    ctx.say(format!("📋 Checking {} stacks...", manifest.stacks.len()));
    for check in &report.checks {
        let mark = if check.passed { "✅" } else { "❌" };
        ctx.say(format!("   {} {}: {}", mark, check.name, check.message));
    }

    let failed = report.failures().count();
    if failed > 0 {
        return Err(CliError::ValidationFailed(failed).into());
    }

    ctx.say("");
    ctx.say("✅ All checks passed!");
    Ok(())
}

/// Template files in `dir` the manifest does not mention.
fn unlisted_templates(dir: &Path, manifest: &Manifest) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().contains(".template."))
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            !manifest.stacks.iter().any(|s| s.template_file == name)
        })
        .map(|e| e.into_path())
        .collect()
}
