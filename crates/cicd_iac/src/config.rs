//! Workshop configuration.
//!
//! Every field defaults to the values the stacks were originally written
//! with, so an empty config file (or none at all) synthesizes the reference
//! topology. Files are read as TOML when the extension is `.toml` and as YAML
//! otherwise.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::deployment::DeploymentPacing;
use crate::error::{IacError, IacResult};
use crate::network::subnet_cidrs;
use crate::template::validate_stack_name;

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "cicd.yaml";

/// Upper bound on availability zones a network spreads across.
pub const MAX_AZS: u8 = 6;

/// Container and load balancer settings shared by every environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub container_name: String,
    pub container_port: u16,
    pub cpu: u32,
    pub memory_mib: u32,
    pub desired_count: u32,
    /// Port of the primary (blue) listener.
    pub listener_port: u16,
    /// Port of the staging (green) listener used during blue/green cutover.
    pub green_listener_port: u16,
    pub health_check_grace_period_seconds: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            container_name: "my-app".to_string(),
            container_port: 8081,
            cpu: 256,
            memory_mib: 512,
            desired_count: 1,
            listener_port: 80,
            green_listener_port: 8080,
            health_check_grace_period_seconds: 60,
        }
    }
}

/// Target group health check, identical for every target group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub path: String,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub timeout_seconds: u32,
    pub interval_seconds: u32,
    pub deregistration_delay_seconds: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/my-app".to_string(),
            healthy_threshold: 2,
            unhealthy_threshold: 2,
            timeout_seconds: 10,
            interval_seconds: 11,
            deregistration_delay_seconds: 5,
        }
    }
}

/// Virtual network layout of each environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub cidr: String,
    pub cidr_mask: u8,
    pub max_azs: u8,
    pub nat_gateways: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cidr: "10.0.0.0/16".to_string(),
            cidr_mask: 24,
            max_azs: 2,
            nat_gateways: 0,
        }
    }
}

/// Image registry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub stack_name: String,
    /// Physical repository name; generated by CloudFormation when unset.
    pub repository_name: Option<String>,
    pub scan_on_push: bool,
    pub max_image_count: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stack_name: "ecr-stack".to_string(),
            repository_name: None,
            scan_on_push: true,
            max_image_count: 10,
        }
    }
}

/// Source repository the pipeline is triggered from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub owner: String,
    pub repository: String,
    pub branch: String,
    pub connection_name: String,
    /// Existing connection to reuse instead of declaring a new one.
    pub connection_arn: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            owner: "cicd-workshop".to_string(),
            repository: "cicd-workshop-app".to_string(),
            branch: "main".to_string(),
            connection_name: "cicdWorkshopConnection".to_string(),
            connection_arn: None,
        }
    }
}

/// Release pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stack_name: String,
    pub pipeline_name: String,
    pub signing_profile_name: String,
    pub build_image: String,
    pub quality_buildspec: String,
    pub docker_buildspec: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stack_name: "pipeline-stack".to_string(),
            pipeline_name: "CICD_Pipeline".to_string(),
            signing_profile_name: "cicd_workshop_signing_profile".to_string(),
            build_image: "aws/codebuild/amazonlinux2-x86_64-standard:5.0".to_string(),
            quality_buildspec: "buildspec_test.yml".to_string(),
            docker_buildspec: "buildspec_docker.yml".to_string(),
        }
    }
}

/// Production cutover settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlueGreenConfig {
    pub pacing: DeploymentPacing,
    pub auto_rollback: bool,
    pub termination_wait_minutes: u32,
}

impl Default for BlueGreenConfig {
    fn default() -> Self {
        Self {
            pacing: DeploymentPacing::default(),
            auto_rollback: true,
            termination_wait_minutes: 5,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkshopConfig {
    pub region: Option<String>,
    pub test_environment: String,
    pub production_environment: String,
    pub registry: RegistryConfig,
    pub network: NetworkConfig,
    pub service: ServiceConfig,
    pub health_check: HealthCheckConfig,
    pub source: SourceConfig,
    pub pipeline: PipelineConfig,
    pub blue_green: BlueGreenConfig,
}

impl Default for WorkshopConfig {
    fn default() -> Self {
        Self {
            region: None,
            test_environment: "test".to_string(),
            production_environment: "prod".to_string(),
            registry: RegistryConfig::default(),
            network: NetworkConfig::default(),
            service: ServiceConfig::default(),
            health_check: HealthCheckConfig::default(),
            source: SourceConfig::default(),
            pipeline: PipelineConfig::default(),
            blue_green: BlueGreenConfig::default(),
        }
    }
}

impl WorkshopConfig {
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_environments(mut self, test: impl Into<String>, prod: impl Into<String>) -> Self {
        self.test_environment = test.into();
        self.production_environment = prod.into();
        self
    }

    /// Stack name of an environment stack.
    pub fn environment_stack_name(&self, environment: &str) -> String {
        format!("{}-app-stack", environment)
    }

    /// Every stack name, in deployment order.
    pub fn stack_names(&self) -> [String; 4] {
        [
            self.registry.stack_name.clone(),
            self.environment_stack_name(&self.test_environment),
            self.environment_stack_name(&self.production_environment),
            self.pipeline.stack_name.clone(),
        ]
    }

    /// Whether `environment` is the one that gets the blue/green topology.
    pub fn is_production(&self, environment: &str) -> bool {
        environment == self.production_environment
    }

    /// Load from a YAML or TOML file.
    pub fn load(path: &Path) -> IacResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: WorkshopConfig = if is_toml(path) {
            toml::from_str(&content)?
        } else if content.trim().is_empty() {
            WorkshopConfig::default()
        } else {
            serde_yaml::from_str(&content)?
        };
        info!("Loaded configuration from {:?}", path);
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default file if present, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> IacResult<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    debug!("No configuration file found, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    /// Save to a YAML or TOML file.
    pub fn save(&self, path: &Path) -> IacResult<()> {
        let content = if is_toml(path) {
            toml::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };
        fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the stacks cannot be generated from.
    pub fn validate(&self) -> IacResult<()> {
        let mut errors = Vec::new();

        for env in [&self.test_environment, &self.production_environment] {
            if validate_stack_name(&self.environment_stack_name(env)).is_err() {
                errors.push(format!("invalid environment name '{}'", env));
            }
        }
        if self.test_environment == self.production_environment {
            errors.push(format!(
                "test and production environments must differ (both '{}')",
                self.test_environment
            ));
        }
        for name in [&self.registry.stack_name, &self.pipeline.stack_name] {
            if validate_stack_name(name).is_err() {
                errors.push(format!("invalid stack name '{}'", name));
            }
        }
        let mut stack_names = BTreeSet::new();
        for name in self.stack_names() {
            if !stack_names.insert(name.clone()) {
                errors.push(format!("stack name '{}' is used twice", name));
            }
        }

        let hc = &self.health_check;
        for (label, value) in [
            ("healthy_threshold", hc.healthy_threshold),
            ("unhealthy_threshold", hc.unhealthy_threshold),
        ] {
            if !(2..=10).contains(&value) {
                errors.push(format!("{} must be between 2 and 10, got {}", label, value));
            }
        }
        if hc.timeout_seconds >= hc.interval_seconds {
            errors.push(format!(
                "health check timeout ({}s) must be shorter than interval ({}s)",
                hc.timeout_seconds, hc.interval_seconds
            ));
        }
        if !hc.path.starts_with('/') {
            errors.push(format!("health check path '{}' must start with '/'", hc.path));
        }

        let svc = &self.service;
        if svc.container_name.is_empty() {
            errors.push("container name cannot be empty".to_string());
        }
        if svc.listener_port == svc.green_listener_port {
            errors.push(format!(
                "blue and green listeners cannot share port {}",
                svc.listener_port
            ));
        }
        if !is_valid_fargate_size(svc.cpu, svc.memory_mib) {
            errors.push(format!(
                "unsupported Fargate size: cpu {} / memory {} MiB",
                svc.cpu, svc.memory_mib
            ));
        }

        if self.network.nat_gateways != 0 {
            errors.push("services run in public subnets; nat_gateways must be 0".to_string());
        }
        if !(16..=28).contains(&self.network.cidr_mask) || !(1..=MAX_AZS).contains(&self.network.max_azs) {
            errors.push(format!(
                "invalid subnet layout: mask /{} across {} AZs (1 to {} AZs)",
                self.network.cidr_mask, self.network.max_azs, MAX_AZS
            ));
        } else if let Err(IacError::InvalidConfig(message)) =
            subnet_cidrs(&self.network.cidr, self.network.cidr_mask, self.network.max_azs)
        {
            errors.push(message);
        }

        if self.source.owner.is_empty() || self.source.repository.is_empty() || self.source.branch.is_empty() {
            errors.push("source owner, repository and branch are required".to_string());
        }

        if let Err(e) = self.blue_green.pacing.validate() {
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(IacError::InvalidConfig(errors.join("; ")))
        }
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("toml")
}

/// Fargate task sizes for the smaller CPU tiers.
fn is_valid_fargate_size(cpu: u32, memory_mib: u32) -> bool {
    match cpu {
        256 => matches!(memory_mib, 512 | 1024 | 2048),
        512 => (1024..=4096).contains(&memory_mib) && memory_mib % 1024 == 0,
        1024 => (2048..=8192).contains(&memory_mib) && memory_mib % 1024 == 0,
        2048 => (4096..=16384).contains(&memory_mib) && memory_mib % 1024 == 0,
        4096 => (8192..=30720).contains(&memory_mib) && memory_mib % 1024 == 0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkshopConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.health_check.interval_seconds, 11);
        assert_eq!(config.service.container_port, 8081);
    }

    #[test]
    fn test_same_environment_names_rejected() {
        let config = WorkshopConfig::default().with_environments("prod", "prod");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn test_colliding_stack_names_rejected() {
        let mut config = WorkshopConfig::default();
        config.registry.stack_name = "prod-app-stack".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, IacError::InvalidConfig(_)));
        assert!(err.to_string().contains("'prod-app-stack' is used twice"));
    }

    #[test]
    fn test_network_layout_checked() {
        let mut config = WorkshopConfig::default();
        config.network.max_azs = 40;
        assert!(config.validate().is_err());

        let mut config = WorkshopConfig::default();
        config.network.cidr = "10.0.0.5/16".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("host bits"));
    }

    #[test]
    fn test_timeout_must_be_below_interval() {
        let mut config = WorkshopConfig::default();
        config.health_check.timeout_seconds = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cicd.yaml");
        fs::write(&path, "region: eu-west-1\nsource:\n  branch: release\n").unwrap();

        let config = WorkshopConfig::load(&path).unwrap();
        assert_eq!(config.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.source.branch, "release");
        assert_eq!(config.source.connection_name, "cicdWorkshopConnection");
        assert_eq!(config.health_check, HealthCheckConfig::default());
    }

    #[test]
    fn test_toml_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cicd.toml");
        let config = WorkshopConfig::default().with_region("us-west-2");

        config.save(&path).unwrap();
        let loaded = WorkshopConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_fargate_sizes() {
        assert!(is_valid_fargate_size(256, 512));
        assert!(!is_valid_fargate_size(256, 4096));
        assert!(is_valid_fargate_size(1024, 3072));
    }
}
