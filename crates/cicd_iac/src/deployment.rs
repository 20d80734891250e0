//! CodeDeploy blue/green binding for the production service.
//!
//! The deployment engine performs the actual traffic shifting, health gating
//! and rollback. This module only declares the application, the pacing rule
//! and the deployment group that ties the service to its two target groups.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{IacError, IacResult};
use crate::iam::RoleBuilder;
use crate::intrinsic;
use crate::template::{logical_id, Resource, Stack};

/// How fast traffic moves from blue to green.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentPacing {
    AllAtOnce,
    Linear { percent: u8, interval_minutes: u32 },
    Canary { percent: u8, interval_minutes: u32 },
}

impl Default for DeploymentPacing {
    fn default() -> Self {
        Self::Linear {
            percent: 10,
            interval_minutes: 1,
        }
    }
}

impl DeploymentPacing {
    /// Name of the matching `CodeDeployDefault.ECS*` config, if one exists.
    pub fn predefined_name(&self) -> Option<&'static str> {
        match *self {
            Self::AllAtOnce => Some("CodeDeployDefault.ECSAllAtOnce"),
            Self::Linear { percent: 10, interval_minutes: 1 } => {
                Some("CodeDeployDefault.ECSLinear10PercentEvery1Minutes")
            }
            Self::Linear { percent: 10, interval_minutes: 3 } => {
                Some("CodeDeployDefault.ECSLinear10PercentEvery3Minutes")
            }
            Self::Canary { percent: 10, interval_minutes: 5 } => {
                Some("CodeDeployDefault.ECSCanary10Percent5Minutes")
            }
            Self::Canary { percent: 10, interval_minutes: 15 } => {
                Some("CodeDeployDefault.ECSCanary10Percent15Minutes")
            }
            _ => None,
        }
    }

    /// Name of the deployment config used by the deployment group.
    pub fn config_name(&self, prefix: &str) -> String {
        match (self.predefined_name(), *self) {
            (Some(name), _) => name.to_string(),
            (None, Self::Linear { percent, interval_minutes }) => {
                format!("{}-Linear{}PercentEvery{}Minutes", prefix, percent, interval_minutes)
            }
            (None, Self::Canary { percent, interval_minutes }) => {
                format!("{}-Canary{}Percent{}Minutes", prefix, percent, interval_minutes)
            }
            (None, Self::AllAtOnce) => "CodeDeployDefault.ECSAllAtOnce".to_string(),
        }
    }

    pub fn validate(&self) -> IacResult<()> {
        match *self {
            Self::AllAtOnce => Ok(()),
            Self::Linear { percent, interval_minutes } | Self::Canary { percent, interval_minutes } => {
                if !(1..=99).contains(&percent) {
                    return Err(IacError::InvalidConfig(format!(
                        "deployment percentage must be between 1 and 99, got {}",
                        percent
                    )));
                }
                if interval_minutes == 0 {
                    return Err(IacError::InvalidConfig(
                        "deployment interval must be at least one minute".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    fn traffic_routing(&self) -> Value {
        match *self {
            Self::AllAtOnce => json!({ "Type": "AllAtOnce" }),
            Self::Linear { percent, interval_minutes } => json!({
                "Type": "TimeBasedLinear",
                "TimeBasedLinear": {
                    "LinearPercentage": percent,
                    "LinearInterval": interval_minutes,
                },
            }),
            Self::Canary { percent, interval_minutes } => json!({
                "Type": "TimeBasedCanary",
                "TimeBasedCanary": {
                    "CanaryPercentage": percent,
                    "CanaryInterval": interval_minutes,
                },
            }),
        }
    }
}

/// Everything the deployment group needs from the production stack.
#[derive(Debug, Clone)]
pub struct DeploymentGroupSpec {
    pub application_name: String,
    pub deployment_group_name: String,
    pub cluster_name: String,
    pub service_name: String,
    pub blue_listener_arn: Value,
    pub green_listener_arn: Value,
    pub blue_target_group: Value,
    pub green_target_group: Value,
    pub pacing: DeploymentPacing,
    pub auto_rollback: bool,
    pub termination_wait_minutes: u32,
}

/// Names the pipeline's deploy action refers to.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentRefs {
    pub application_name: String,
    pub deployment_group_name: String,
    pub deployment_config_name: String,
}

impl DeploymentGroupSpec {
    /// Declare the CodeDeploy application, pacing config and deployment group.
    pub fn declare(&self, stack: &mut Stack) -> IacResult<DeploymentRefs> {
        self.pacing.validate()?;

        let app_id = logical_id(&[self.application_name.as_str(), "application"]);
        stack.add_resource(
            &app_id,
            Resource::new("AWS::CodeDeploy::Application")
                .property("ApplicationName", self.application_name.as_str())
                .property("ComputePlatform", "ECS"),
        )?;

        let config_name = self.pacing.config_name(&self.application_name);
        let config_id = logical_id(&[self.application_name.as_str(), "deployment-config"]);
        let custom_config = self.pacing.predefined_name().is_none();
        if custom_config {
            debug!(config = %config_name, "Declaring custom deployment config");
            stack.add_resource(
                &config_id,
                Resource::new("AWS::CodeDeploy::DeploymentConfig")
                    .property("DeploymentConfigName", config_name.as_str())
                    .property("ComputePlatform", "ECS")
                    .property("TrafficRoutingConfig", self.pacing.traffic_routing()),
            )?;
        }

        let role_id = logical_id(&[self.application_name.as_str(), "deploy-role"]);
        stack.add_resource(
            &role_id,
            RoleBuilder::for_service("codedeploy.amazonaws.com")
                .managed_policy("AWSCodeDeployRoleForECS")
                .build()?,
        )?;

        let mut group = Resource::new("AWS::CodeDeploy::DeploymentGroup")
            .property("ApplicationName", intrinsic::reference(&app_id))
            .property("DeploymentGroupName", self.deployment_group_name.as_str())
            .property("ServiceRoleArn", intrinsic::get_att(&role_id, "Arn"))
            .property("DeploymentConfigName", config_name.as_str())
            .property(
                "DeploymentStyle",
                json!({ "DeploymentType": "BLUE_GREEN", "DeploymentOption": "WITH_TRAFFIC_CONTROL" }),
            )
            .property(
                "BlueGreenDeploymentConfiguration",
                json!({
                    "DeploymentReadyOption": {
                        "ActionOnTimeout": "CONTINUE_DEPLOYMENT",
                        "WaitTimeInMinutes": 0,
                    },
                    "TerminateBlueInstancesOnDeploymentSuccess": {
                        "Action": "TERMINATE",
                        "TerminationWaitTimeInMinutes": self.termination_wait_minutes,
                    },
                }),
            )
            .property(
                "ECSServices",
                json!([{ "ClusterName": self.cluster_name, "ServiceName": self.service_name }]),
            )
            .property(
                "LoadBalancerInfo",
                json!({
                    "TargetGroupPairInfoList": [{
                        "ProdTrafficRoute": { "ListenerArns": [self.blue_listener_arn] },
                        "TestTrafficRoute": { "ListenerArns": [self.green_listener_arn] },
                        "TargetGroups": [
                            { "Name": self.blue_target_group },
                            { "Name": self.green_target_group },
                        ],
                    }],
                }),
            )
            .property(
                "AutoRollbackConfiguration",
                json!({
                    "Enabled": self.auto_rollback,
                    "Events": ["DEPLOYMENT_FAILURE", "DEPLOYMENT_STOP_ON_REQUEST"],
                }),
            );
        if custom_config {
            group = group.depends_on(config_id);
        }

        stack.add_resource(
            logical_id(&[self.deployment_group_name.as_str(), "group"]),
            group,
        )?;

        Ok(DeploymentRefs {
            application_name: self.application_name.clone(),
            deployment_group_name: self.deployment_group_name.clone(),
            deployment_config_name: config_name,
        })
    }
}
