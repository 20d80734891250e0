//! List command - Show the stacks in deployment order.

use anyhow::{Context as _, Result};
use clap::Args;

use cicd_iac::{CloudApp, StackRole};

use super::Context;

#[derive(Args)]
pub struct ListArgs {
    /// Print as JSON
    #[arg(long)]
    json: bool,
}

pub async fn execute(args: ListArgs, ctx: &Context) -> Result<()> {
    let config = ctx.load_config()?;
    let assembly = CloudApp::synth(&config).context("Failed to synthesize stacks")?;

    if args.json {
        let stacks: Vec<_> = assembly
            .stacks()
            .iter()
            .map(|s| {
                serde_json::json!({
                    "stack_name": s.stack.name(),
                    "role": s.role,
                    "dependencies": s.stack.dependencies(),
                    "resources": s.stack.template().resources.len(),
                    "exports": s.stack.template().export_names(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&stacks)?);
        return Ok(());
    }

    for (index, entry) in assembly.stacks().iter().enumerate() {
        let template = entry.stack.template();
        println!(
            "{}. {} [{}] - {} resources, {} exports",
            index + 1,
            entry.stack.name(),
            role_label(&entry.role),
            template.resources.len(),
            template.export_names().len()
        );
        if !entry.stack.dependencies().is_empty() {
            println!("   depends on: {}", entry.stack.dependencies().join(", "));
        }
    }

    Ok(())
}

fn role_label(role: &StackRole) -> String {
    match role {
        StackRole::Registry => "registry".to_string(),
        StackRole::Environment {
            environment,
            blue_green: true,
        } => format!("environment {} (blue/green)", environment),
        StackRole::Environment { environment, .. } => format!("environment {}", environment),
        StackRole::Pipeline => "pipeline".to_string(),
    }
}
