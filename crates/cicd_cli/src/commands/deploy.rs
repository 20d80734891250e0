//! Deploy command - Deploy the stacks through the AWS CLI.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Args;
use tracing::info;

use cicd_iac::{Assembly, CloudApp, DeployOptions, ProcessRunner, StackDeployer, TemplateFormat, MANIFEST_FILE};

use super::{out_dir, Context};

#[derive(Args)]
pub struct DeployArgs {
    /// Directory written by `cicd synth` (synthesized first if missing)
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Deploy only this stack
    #[arg(short, long)]
    stack: Option<String>,

    /// AWS region (overrides the configuration)
    #[arg(short, long)]
    region: Option<String>,

    /// Print the commands without running them
    #[arg(long)]
    dry_run: bool,

    /// Create change sets without executing them
    #[arg(long)]
    no_execute: bool,
}

pub async fn execute(args: DeployArgs, ctx: &Context) -> Result<()> {
    let config = ctx.load_config()?;
    let out = out_dir(args.out);

    if !out.join(MANIFEST_FILE).exists() {
        info!("No assembly in {:?}, synthesizing", out);
        CloudApp::synth(&config)
            .context("Failed to synthesize stacks")?
            .write_to(&out, TemplateFormat::Json)
            .with_context(|| format!("Failed to write assembly to {:?}", out))?;
    }
    let (manifest, _) = Assembly::load(&out).with_context(|| format!("Failed to read assembly from {:?}", out))?;

    let options = DeployOptions {
        region: args.region.or(config.region),
        dry_run: args.dry_run,
        no_execute: args.no_execute,
    };
    let deployer = StackDeployer::new(Arc::new(ProcessRunner), options);

    if !args.dry_run {
        let version = deployer.check_available().await.context("AWS CLI check failed")?;
        info!("Using {}", version);
    }

    let report = deployer
        .deploy(&out, &manifest, args.stack.as_deref())
        .await
        .context("Deploy failed")?;

    if report.dry_run {
        for stack in &report.stacks {
            println!("{}", stack.command.join(" "));
        }
    } else {
        ctx.say(format!("✅ Deployed {}", report.stack_names().join(", ")));
    }

    Ok(())
}
