//! Container image registry stack.

use serde_json::{json, Value};
use tracing::info;

use crate::config::RegistryConfig;
use crate::error::IacResult;
use crate::intrinsic;
use crate::template::{Resource, Stack};

const REPOSITORY_ID: &str = "EcrRepository";

/// Cross-stack handle to the shared repository.
///
/// Consumers never hold the repository resource itself; they import the
/// exported identifiers by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRef {
    pub stack_name: String,
    pub uri_export: String,
    pub name_export: String,
    pub arn_export: String,
}

impl RegistryRef {
    pub fn uri(&self) -> Value {
        intrinsic::import_value(&self.uri_export)
    }

    pub fn name(&self) -> Value {
        intrinsic::import_value(&self.name_export)
    }

    pub fn arn(&self) -> Value {
        intrinsic::import_value(&self.arn_export)
    }

    /// Image reference for a tag, e.g. `<uri>:latest`.
    pub fn image(&self, tag: &str) -> Value {
        intrinsic::join("", vec![self.uri(), Value::String(format!(":{}", tag))])
    }
}

/// Stack declaring the single image repository.
#[derive(Debug, Clone)]
pub struct RegistryStack {
    stack: Stack,
    reference: RegistryRef,
}

impl RegistryStack {
    pub fn build(config: &RegistryConfig) -> IacResult<Self> {
        info!("Building registry stack {}", config.stack_name);
        let mut stack = Stack::new(&config.stack_name, "Shared container image registry")?;

        let lifecycle = json!({
            "rules": [{
                "rulePriority": 1,
                "description": format!("Keep only the last {} images", config.max_image_count),
                "selection": {
                    "tagStatus": "any",
                    "countType": "imageCountMoreThan",
                    "countNumber": config.max_image_count,
                },
                "action": { "type": "expire" },
            }],
        });

        let mut repository = Resource::new("AWS::ECR::Repository")
            .property(
                "ImageScanningConfiguration",
                json!({ "ScanOnPush": config.scan_on_push }),
            )
            .property(
                "LifecyclePolicy",
                json!({ "LifecyclePolicyText": lifecycle.to_string() }),
            )
            .retain();
        if let Some(name) = &config.repository_name {
            repository = repository.property("RepositoryName", name.as_str());
        }
        stack.add_resource(REPOSITORY_ID, repository)?;

        let uri_export = stack.export(
            "RepositoryUri",
            intrinsic::get_att(REPOSITORY_ID, "RepositoryUri"),
            Some("Image repository URI"),
        )?;
        let name_export = stack.export(
            "RepositoryName",
            intrinsic::reference(REPOSITORY_ID),
            Some("Image repository name"),
        )?;
        let arn_export = stack.export(
            "RepositoryArn",
            intrinsic::get_att(REPOSITORY_ID, "Arn"),
            Some("Image repository ARN"),
        )?;

        let reference = RegistryRef {
            stack_name: config.stack_name.clone(),
            uri_export,
            name_export,
            arn_export,
        };

        Ok(Self { stack, reference })
    }

    pub fn reference(&self) -> &RegistryRef {
        &self.reference
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn into_stack(self) -> Stack {
        self.stack
    }
}
