//! CLI command definitions.
//!
//! Each subcommand maps to one step of getting the workshop stacks from
//! configuration to a deployed account.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use thiserror::Error;

use cicd_iac::WorkshopConfig;

pub mod deploy;
pub mod init;
pub mod list;
pub mod synth;
pub mod validate;

/// Default directory for the synthesized assembly.
pub const DEFAULT_OUT_DIR: &str = "cdk.out";

/// CI/CD workshop - registry, environment and pipeline stacks
#[derive(Parser)]
#[command(name = "cicd")]
#[command(version, about = "Synthesize and deploy the CI/CD workshop stacks")]
#[command(long_about = r#"
Generates the CloudFormation stacks of the CI/CD workshop: a container
registry, a test and a production environment (blue/green on production)
and the delivery pipeline that builds, tests and promotes the application.

WORKFLOW:
  init      → Write a default configuration file
  synth     → Generate templates and manifest.json
  validate  → Check a synthesized assembly
  list      → Show the stacks and their dependencies
  deploy    → Deploy the stacks with the AWS CLI

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments
  3 - Validation failure
  5 - IaC error
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Configuration file (YAML or TOML)
    #[arg(short, long, global = true, env = "CICD_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default configuration file
    Init(init::InitArgs),

    /// Generate the stack templates
    Synth(synth::SynthArgs),

    /// Validate a synthesized assembly
    Validate(validate::ValidateArgs),

    /// List the stacks in deployment order
    List(list::ListArgs),

    /// Deploy the stacks through the AWS CLI
    Deploy(deploy::DeployArgs),
}

/// Errors raised by the CLI itself.
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Validation failed: {0} check(s) did not pass")]
    ValidationFailed(usize),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Global options shared by every command.
pub struct Context {
    pub config: Option<PathBuf>,
    pub quiet: bool,
}

impl From<&Cli> for Context {
    fn from(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            quiet: cli.quiet,
        }
    }
}

impl Context {
    pub fn load_config(&self) -> Result<WorkshopConfig> {
        WorkshopConfig::load_or_default(self.config.as_deref()).with_context(|| match &self.config {
            Some(path) => format!("Failed to load configuration from {:?}", path),
            None => "Failed to load configuration".to_string(),
        })
    }

    /// Print unless `--quiet`.
    pub fn say(&self, message: impl AsRef<str>) {
        if !self.quiet {
            println!("{}", message.as_ref());
        }
    }
}

pub fn out_dir(out: Option<PathBuf>) -> PathBuf {
    out.unwrap_or_else(|| Path::new(DEFAULT_OUT_DIR).to_path_buf())
}
