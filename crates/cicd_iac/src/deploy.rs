//! Stack deployment through the AWS CLI.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::app::{Manifest, ManifestEntry};
use crate::error::{IacError, IacResult};

const AWS_CLI: &str = "aws";

/// Captured output of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Get combined output (stdout + stderr).
    pub fn combined_output(&self) -> String {
        if self.stdout.is_empty() {
            self.stderr.clone()
        } else if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Runs external commands.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> IacResult<CommandOutput>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> IacResult<CommandOutput> {
        debug!("Executing {} {:?}", program, args);
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => IacError::CliNotAvailable(format!("{} not found on PATH", program)),
                _ => IacError::Io(e),
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        })
    }
}

/// Deploy options.
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub region: Option<String>,
    /// Only report the commands.
    pub dry_run: bool,
    /// Create change sets without executing them.
    pub no_execute: bool,
}

/// One deployed (or planned) stack.
#[derive(Debug, Clone)]
pub struct StackDeployment {
    pub stack_name: String,
    pub command: Vec<String>,
    pub output: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeployReport {
    pub dry_run: bool,
    pub stacks: Vec<StackDeployment>,
}

impl DeployReport {
    pub fn stack_names(&self) -> Vec<&str> {
        self.stacks.iter().map(|s| s.stack_name.as_str()).collect()
    }
}

/// Deploys a written assembly stack by stack, in manifest order.
pub struct StackDeployer {
    runner: Arc<dyn CommandRunner>,
    options: DeployOptions,
}

impl StackDeployer {
    pub fn new(runner: Arc<dyn CommandRunner>, options: DeployOptions) -> Self {
        Self { runner, options }
    }

    /// Check the AWS CLI is installed, returning its version string.
    pub async fn check_available(&self) -> IacResult<String> {
        let output = self.runner.run(AWS_CLI, &["--version".to_string()]).await?;
        if !output.success() {
            return Err(IacError::CliNotAvailable(output.combined_output()));
        }
        Ok(output.combined_output())
    }

    /// Arguments for `aws cloudformation deploy` of one stack.
    pub fn deploy_args(&self, dir: &Path, entry: &ManifestEntry) -> Vec<String> {
        let mut args = vec![
            "cloudformation".to_string(),
            "deploy".to_string(),
            "--stack-name".to_string(),
            entry.stack_name.clone(),
            "--template-file".to_string(),
            dir.join(&entry.template_file).display().to_string(),
            "--capabilities".to_string(),
            "CAPABILITY_NAMED_IAM".to_string(),
            "--no-fail-on-empty-changeset".to_string(),
        ];
        if let Some(region) = &self.options.region {
            args.push("--region".to_string());
            args.push(region.clone());
        }
        if self.options.no_execute {
            args.push("--no-execute-changeset".to_string());
        }
        args
    }

    /// Deploy every stack in `manifest`, or only `only` when given.
    /// Stops at the first failing stack.
    pub async fn deploy(&self, dir: &Path, manifest: &Manifest, only: Option<&str>) -> IacResult<DeployReport> {
        let entries: Vec<&ManifestEntry> = match only {
            Some(name) => {
                let entry = manifest
                    .entry(name)
                    .ok_or_else(|| IacError::StackNotFound(name.to_string()))?;
                if !entry.dependencies.is_empty() {
                    warn!(
                        "Deploying {} alone; it depends on {}",
                        name,
                        entry.dependencies.join(", ")
                    );
                }
                vec![entry]
            }
            None => manifest.stacks.iter().collect(),
        };

        let mut report = DeployReport {
            dry_run: self.options.dry_run,
            stacks: Vec::with_capacity(entries.len()),
        };

        for entry in entries {
            let args = self.deploy_args(dir, entry);
            let mut command = vec![AWS_CLI.to_string()];
            command.extend(args.iter().cloned());

            if self.options.dry_run {
                info!("[dry-run] {}", command.join(" "));
                report.stacks.push(StackDeployment {
                    stack_name: entry.stack_name.clone(),
                    command,
                    output: None,
                });
                continue;
            }

            info!("Deploying stack {}", entry.stack_name);
            let output = self.runner.run(AWS_CLI, &args).await?;
            if !output.success() {
                return Err(IacError::DeployFailed {
                    stack: entry.stack_name.clone(),
                    message: output.combined_output(),
                });
            }
            debug!(stack = %entry.stack_name, "Deploy finished");
            report.stacks.push(StackDeployment {
                stack_name: entry.stack_name.clone(),
                command,
                output: Some(output.combined_output()),
            });
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{StackRole, TemplateFormat, MANIFEST_VERSION};
    use chrono::Utc;

    fn manifest() -> Manifest {
        let entry = |name: &str, role: StackRole, deps: &[&str]| ManifestEntry {
            stack_name: name.to_string(),
            template_file: format!("{}.template.json", name),
            role,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        };
        Manifest {
            version: MANIFEST_VERSION.to_string(),
            generated_at: Utc::now(),
            format: TemplateFormat::Json,
            stacks: vec![
                entry("ecr-stack", StackRole::Registry, &[]),
                entry(
                    "test-app-stack",
                    StackRole::Environment {
                        environment: "test".to_string(),
                        blue_green: false,
                    },
                    &["ecr-stack"],
                ),
                entry("pipeline-stack", StackRole::Pipeline, &["ecr-stack", "test-app-stack"]),
            ],
        }
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[tokio::test]
    async fn test_deploys_in_manifest_order() {
        let mut runner = MockCommandRunner::new();
        let mut seq = mockall::Sequence::new();
        for stack in ["ecr-stack", "test-app-stack", "pipeline-stack"] {
            runner
                .expect_run()
                .withf(move |program, args| program == "aws" && args[3] == stack)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(ok("done")));
        }

        let deployer = StackDeployer::new(Arc::new(runner), DeployOptions::default());
        let report = deployer.deploy(Path::new("cdk.out"), &manifest(), None).await.unwrap();

        assert_eq!(report.stack_names(), vec!["ecr-stack", "test-app-stack", "pipeline-stack"]);
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|_, args| args[3] == "ecr-stack")
            .times(1)
            .returning(|_, _| Ok(ok("")));
        runner
            .expect_run()
            .withf(|_, args| args[3] == "test-app-stack")
            .times(1)
            .returning(|_, _| {
                Ok(CommandOutput {
                    exit_code: 255,
                    stdout: String::new(),
                    stderr: "ROLLBACK_COMPLETE".to_string(),
                })
            });

        let deployer = StackDeployer::new(Arc::new(runner), DeployOptions::default());
        let err = deployer.deploy(Path::new("out"), &manifest(), None).await.unwrap_err();

        match err {
            IacError::DeployFailed { stack, message } => {
                assert_eq!(stack, "test-app-stack");
                assert!(message.contains("ROLLBACK_COMPLETE"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_dry_run_executes_nothing() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(0);

        let options = DeployOptions {
            dry_run: true,
            ..Default::default()
        };
        let deployer = StackDeployer::new(Arc::new(runner), options);
        let report = deployer.deploy(Path::new("out"), &manifest(), None).await.unwrap();

        assert!(report.dry_run);
        assert_eq!(report.stacks.len(), 3);
        assert!(report.stacks.iter().all(|s| s.output.is_none()));
        assert_eq!(report.stacks[0].command[0], "aws");
    }

    #[tokio::test]
    async fn test_single_stack_and_unknown_stack() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|_, _| Ok(ok("")));
        let deployer = StackDeployer::new(Arc::new(runner), DeployOptions::default());

        let report = deployer
            .deploy(Path::new("out"), &manifest(), Some("pipeline-stack"))
            .await
            .unwrap();
        assert_eq!(report.stack_names(), vec!["pipeline-stack"]);

        let err = deployer
            .deploy(Path::new("out"), &manifest(), Some("missing-stack"))
            .await
            .unwrap_err();
        assert!(matches!(err, IacError::StackNotFound(_)));
    }

    #[test]
    fn test_deploy_args_with_region_and_no_execute() {
        let options = DeployOptions {
            region: Some("eu-west-1".to_string()),
            dry_run: false,
            no_execute: true,
        };
        let deployer = StackDeployer::new(Arc::new(MockCommandRunner::new()), options);
        let manifest = manifest();
        let args = deployer.deploy_args(Path::new("out"), &manifest.stacks[0]);

        assert_eq!(&args[..4], ["cloudformation", "deploy", "--stack-name", "ecr-stack"]);
        assert!(args.contains(&"CAPABILITY_NAMED_IAM".to_string()));
        assert!(args.windows(2).any(|w| w == ["--region", "eu-west-1"]));
        assert_eq!(args.last().map(String::as_str), Some("--no-execute-changeset"));
    }

    #[tokio::test]
    async fn test_check_available() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|program, args| program == "aws" && args == ["--version".to_string()])
            .returning(|_, _| Ok(ok("aws-cli/2.15.0")));

        let deployer = StackDeployer::new(Arc::new(runner), DeployOptions::default());
        assert_eq!(deployer.check_available().await.unwrap(), "aws-cli/2.15.0");
    }
}
