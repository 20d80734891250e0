//! # cicd_iac
//!
//! CloudFormation generation for the CI/CD workshop application.
//!
//! This crate builds the container registry, one stack per environment and
//! the delivery pipeline, links them through CloudFormation exports and
//! writes them out as a deployable assembly.
//!
//! ## Features
//!
//! - Registry, environment and pipeline stack generation
//! - Blue/green traffic topology for the production environment
//! - CodeDeploy deployment group with linear, canary or all-at-once pacing
//! - Cross-stack export/import linking and structural assertions
//! - Deployment through `aws cloudformation deploy`
//!
//! ## Example
//!
//! ```rust,no_run
//! use cicd_iac::{CloudApp, TemplateFormat, WorkshopConfig};
//! use std::path::Path;
//!
//! let config = WorkshopConfig::default().with_region("eu-west-1");
//! let assembly = CloudApp::synth(&config).unwrap();
//! assembly.write_to(Path::new("cdk.out"), TemplateFormat::Json).unwrap();
//! ```

pub mod app;
pub mod assertions;
pub mod config;
pub mod deploy;
pub mod deployment;
pub mod environment;
pub mod error;
pub mod iam;
pub mod intrinsic;
pub mod linker;
pub mod network;
pub mod pipeline;
pub mod registry;
pub mod template;

pub use app::{Assembly, AssemblyStack, CloudApp, Manifest, ManifestEntry, StackRole, TemplateFormat, MANIFEST_FILE};
pub use assertions::{TemplateAssertions, ValidationCheck, ValidationReport};
pub use config::{
    BlueGreenConfig, HealthCheckConfig, NetworkConfig, PipelineConfig, RegistryConfig, ServiceConfig, SourceConfig,
    WorkshopConfig, DEFAULT_CONFIG_FILE,
};
pub use deploy::{CommandOutput, CommandRunner, DeployOptions, DeployReport, ProcessRunner, StackDeployer};
pub use deployment::{DeploymentGroupSpec, DeploymentPacing, DeploymentRefs};
pub use environment::{EnvironmentExports, EnvironmentStack, Topology, TopologyKind, TrafficPair};
pub use error::{IacError, IacResult};
pub use linker::{CrossStackLink, LinkReport, StackLinker};
pub use pipeline::{PipelineAction, PipelineStack, PipelineStage};
pub use registry::{RegistryRef, RegistryStack};
pub use template::{Output, Resource, Stack, Template};
