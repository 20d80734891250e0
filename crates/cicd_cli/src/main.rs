//! CI/CD workshop CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments
//! - 3: Validation failure
//! - 5: IaC error

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cicd_iac::IacError;

mod commands;

use commands::{Cli, CliError, Commands, Context};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const VALIDATION_FAILURE: u8 = 3;
    pub const IAC_ERROR: u8 = 5;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let ctx = Context::from(&cli);
    let result = match cli.command {
        Commands::Init(args) => commands::init::execute(args, &ctx).await,
        Commands::Synth(args) => commands::synth::execute(args, &ctx).await,
        Commands::Validate(args) => commands::validate::execute(args, &ctx).await,
        Commands::List(args) => commands::list::execute(args, &ctx).await,
        Commands::Deploy(args) => commands::deploy::execute(args, &ctx).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("❌ Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cicd={},warn", level)));

    let (plain, json) = if cli.log_json {
        (None, Some(fmt::layer().json().with_target(false)))
    } else {
        (Some(fmt::layer().with_target(false)), None)
    };

    // Ignore failure: a subscriber is already installed.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .try_init();
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(cli_error) = cause.downcast_ref::<CliError>() {
            return match cli_error {
                CliError::ValidationFailed(_) => ExitCodes::VALIDATION_FAILURE,
                CliError::InvalidArgument(_) => ExitCodes::INVALID_ARGS,
            };
        }
        if let Some(iac_error) = cause.downcast_ref::<IacError>() {
            return match iac_error {
                IacError::InvalidConfig(_) | IacError::StackNotFound(_) => ExitCodes::INVALID_ARGS,
                IacError::LinkFailed(_) => ExitCodes::VALIDATION_FAILURE,
                IacError::Io(_) => ExitCodes::GENERAL_ERROR,
                _ => ExitCodes::IAC_ERROR,
            };
        }
    }
    ExitCodes::GENERAL_ERROR
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;

    #[test]
    fn test_categorize_wrapped_iac_error() {
        let err = Err::<(), _>(IacError::DeployFailed {
            stack: "prod-app-stack".to_string(),
            message: "ROLLBACK_COMPLETE".to_string(),
        })
        .context("Deploy failed")
        .unwrap_err();
        assert_eq!(categorize_error(&err), ExitCodes::IAC_ERROR);
    }

    #[test]
    fn test_categorize_validation_and_args() {
        let validation = anyhow::Error::new(CliError::ValidationFailed(2));
        assert_eq!(categorize_error(&validation), ExitCodes::VALIDATION_FAILURE);

        let config = anyhow::Error::new(IacError::InvalidConfig("bad".to_string()));
        assert_eq!(categorize_error(&config), ExitCodes::INVALID_ARGS);

        assert_eq!(categorize_error(&anyhow::anyhow!("boom")), ExitCodes::GENERAL_ERROR);
    }
}
