//! Release pipeline stack.
//!
//! Stage order is fixed: source, quality check, image build and push, deploy
//! to test, then manual approval followed by the blue/green production
//! deploy. Nothing here decides whether a stage runs; gating, health checks
//! and rollback belong to the pipeline and deployment services.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::config::WorkshopConfig;
use crate::deployment::{DeploymentGroupSpec, DeploymentRefs};
use crate::environment::EnvironmentStack;
use crate::error::{IacError, IacResult};
use crate::iam::{PolicyDocument, PolicyStatement, RoleBuilder};
use crate::intrinsic;
use crate::registry::RegistryRef;
use crate::template::{Resource, Stack};

pub const SOURCE_STAGE: &str = "Source";
pub const QUALITY_STAGE: &str = "Code-Quality-Testing";
pub const BUILD_STAGE: &str = "Docker-Push-ECR";
pub const DEPLOY_TEST_STAGE: &str = "Deploy-Test";
pub const DEPLOY_PRODUCTION_STAGE: &str = "Deploy-Production";

/// Stage names in execution order.
pub const STAGE_ORDER: [&str; 5] = [
    SOURCE_STAGE,
    QUALITY_STAGE,
    BUILD_STAGE,
    DEPLOY_TEST_STAGE,
    DEPLOY_PRODUCTION_STAGE,
];

pub const APPROVAL_ACTION: &str = "Manual-Approval";
pub const BLUE_GREEN_ACTION: &str = "Deploy-Blue-Green";

const SOURCE_ARTIFACT: &str = "SourceOutput";
const IMAGE_ARTIFACT: &str = "DockerBuildOutput";

const PIPELINE_ID: &str = "Pipeline";
const PIPELINE_ROLE_ID: &str = "PipelineRole";
const ARTIFACT_BUCKET_ID: &str = "ArtifactBucket";
const CONNECTION_ID: &str = "CicdWorkshopConnection";
const QUALITY_PROJECT_ID: &str = "CodeQualityProject";
const QUALITY_ROLE_ID: &str = "CodeQualityProjectRole";
const DOCKER_PROJECT_ID: &str = "DockerBuildProject";
const DOCKER_ROLE_ID: &str = "DockerBuildProjectRole";

/// Pipeline action category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionCategory {
    Source,
    Build,
    Test,
    Deploy,
    Approval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActionTypeId {
    pub category: ActionCategory,
    pub owner: String,
    pub provider: String,
    pub version: String,
}

impl ActionTypeId {
    fn aws(category: ActionCategory, provider: &str) -> Self {
        Self {
            category,
            owner: "AWS".to_string(),
            provider: provider.to_string(),
            version: "1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArtifactRef {
    pub name: String,
}

impl ArtifactRef {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

/// A pipeline action as laid out in `AWS::CodePipeline::Pipeline`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PipelineAction {
    pub name: String,
    pub action_type_id: ActionTypeId,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub configuration: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_artifacts: Vec<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_artifacts: Vec<ArtifactRef>,
    pub run_order: u32,
}

impl PipelineAction {
    fn new(name: &str, action_type_id: ActionTypeId, configuration: Value) -> Self {
        let configuration = match configuration {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            name: name.to_string(),
            action_type_id,
            configuration,
            input_artifacts: Vec::new(),
            output_artifacts: Vec::new(),
            run_order: 1,
        }
    }

    fn input(mut self, artifact: &str) -> Self {
        self.input_artifacts.push(ArtifactRef::new(artifact));
        self
    }

    fn output(mut self, artifact: &str) -> Self {
        self.output_artifacts.push(ArtifactRef::new(artifact));
        self
    }

    fn run_order(mut self, order: u32) -> Self {
        self.run_order = order;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PipelineStage {
    pub name: String,
    pub actions: Vec<PipelineAction>,
}

impl PipelineStage {
    fn new(name: &str, actions: Vec<PipelineAction>) -> Self {
        Self {
            name: name.to_string(),
            actions,
        }
    }

    pub fn action(&self, name: &str) -> Option<&PipelineAction> {
        self.actions.iter().find(|a| a.name == name)
    }
}

/// Generated pipeline stack.
#[derive(Debug, Clone)]
pub struct PipelineStack {
    stack: Stack,
    stages: Vec<PipelineStage>,
}

impl PipelineStack {
    /// Build the pipeline from the registry and both environments.
    ///
    /// Cluster and service names are taken by value. Listener and target
    /// group identifiers are imported from the production stack's exports.
    pub fn build(
        registry: &RegistryRef,
        test: &EnvironmentStack,
        prod: &EnvironmentStack,
        config: &WorkshopConfig,
    ) -> IacResult<Self> {
        let pipeline = &config.pipeline;
        info!("Building pipeline stack {}", pipeline.stack_name);

        let blue_green = prod.exports().blue_green.as_ref().ok_or_else(|| {
            IacError::InvalidConfig(format!(
                "environment '{}' has no blue/green topology to deploy to",
                prod.environment()
            ))
        })?;

        let mut stack = Stack::new(&pipeline.stack_name, "Release pipeline: source to blue/green production")?;
        stack.add_dependency(&registry.stack_name);
        stack.add_dependency(test.stack().name());
        stack.add_dependency(prod.stack().name());

        let connection_arn = declare_connection(&mut stack, config)?;

        stack.add_resource(
            ARTIFACT_BUCKET_ID,
            Resource::new("AWS::S3::Bucket")
                .property(
                    "BucketEncryption",
                    json!({
                        "ServerSideEncryptionConfiguration": [{
                            "ServerSideEncryptionByDefault": { "SSEAlgorithm": "aws:kms" },
                        }],
                    }),
                )
                .property(
                    "PublicAccessBlockConfiguration",
                    json!({
                        "BlockPublicAcls": true,
                        "BlockPublicPolicy": true,
                        "IgnorePublicAcls": true,
                        "RestrictPublicBuckets": true,
                    }),
                )
                .retain(),
        )?;

        declare_build_projects(&mut stack, registry, config)?;

        let deployment = DeploymentGroupSpec {
            application_name: format!("{}-app", prod.environment()),
            deployment_group_name: format!("{}-deployment-group", prod.environment()),
            cluster_name: prod.cluster_name().to_string(),
            service_name: prod.service_name().to_string(),
            blue_listener_arn: intrinsic::import_value(&blue_green.blue_listener_arn),
            green_listener_arn: intrinsic::import_value(&blue_green.green_listener_arn),
            blue_target_group: intrinsic::import_value(&blue_green.blue_target_group_name),
            green_target_group: intrinsic::import_value(&blue_green.green_target_group_name),
            pacing: config.blue_green.pacing,
            auto_rollback: config.blue_green.auto_rollback,
            termination_wait_minutes: config.blue_green.termination_wait_minutes,
        }
        .declare(&mut stack)?;

        let stages = stages(config, connection_arn.clone(), test, prod, &deployment);

        stack.add_resource(PIPELINE_ROLE_ID, pipeline_role(connection_arn)?)?;
        stack.add_resource(
            PIPELINE_ID,
            Resource::new("AWS::CodePipeline::Pipeline")
                .property("Name", pipeline.pipeline_name.as_str())
                .property("PipelineType", "V2")
                .property("ExecutionMode", "QUEUED")
                .property("RoleArn", intrinsic::get_att(PIPELINE_ROLE_ID, "Arn"))
                .property(
                    "ArtifactStore",
                    json!({ "Type": "S3", "Location": intrinsic::reference(ARTIFACT_BUCKET_ID) }),
                )
                .property("Stages", serde_json::to_value(&stages)?)
                .depends_on(PIPELINE_ROLE_ID),
        )?;

        stack.add_output(
            "PipelineName",
            intrinsic::reference(PIPELINE_ID),
            Some("Release pipeline name"),
        )?;

        Ok(Self { stack, stages })
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn into_stack(self) -> Stack {
        self.stack
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Declare the source connection unless one is configured; returns its ARN.
fn declare_connection(stack: &mut Stack, config: &WorkshopConfig) -> IacResult<Value> {
    if let Some(arn) = &config.source.connection_arn {
        return Ok(Value::String(arn.clone()));
    }

    stack.add_resource(
        CONNECTION_ID,
        Resource::new("AWS::CodeConnections::Connection")
            .property("ConnectionName", config.source.connection_name.as_str())
            .property("ProviderType", "GitHub"),
    )?;
    stack.add_output(
        "sourceConnectionArn",
        intrinsic::get_att(CONNECTION_ID, "ConnectionArn"),
        Some("Complete the connection handshake in the console before the first run"),
    )?;
    stack.add_output(
        "sourceConnectionStatus",
        intrinsic::get_att(CONNECTION_ID, "ConnectionStatus"),
        None,
    )?;
    Ok(intrinsic::get_att(CONNECTION_ID, "ConnectionArn"))
}

fn signing_profile_arn(name: &str) -> Value {
    intrinsic::sub(&format!(
        "arn:${{AWS::Partition}}:signer:${{AWS::Region}}:${{AWS::AccountId}}:/signing-profiles/{}",
        name
    ))
}

/// Statements every CodeBuild project needs: logs and the artifact bucket.
fn build_base_statements() -> Vec<PolicyStatement> {
    vec![
        PolicyStatement::allow([
            "logs:CreateLogGroup",
            "logs:CreateLogStream",
            "logs:PutLogEvents",
        ])
        .on_all(),
        PolicyStatement::allow(["s3:GetObject", "s3:GetObjectVersion", "s3:PutObject"]).on(
            intrinsic::join(
                "",
                vec![intrinsic::get_att(ARTIFACT_BUCKET_ID, "Arn"), json!("/*")],
            ),
        ),
    ]
}

fn declare_build_projects(
    stack: &mut Stack,
    registry: &RegistryRef,
    config: &WorkshopConfig,
) -> IacResult<()> {
    let pipeline = &config.pipeline;

    stack.add_resource(
        QUALITY_ROLE_ID,
        RoleBuilder::for_service("codebuild.amazonaws.com")
            .inline_policy("code-quality", PolicyDocument::new(build_base_statements()))
            .build()?,
    )?;
    stack.add_resource(
        QUALITY_PROJECT_ID,
        build_project(
            &format!("{}-code-quality", pipeline.pipeline_name),
            &pipeline.quality_buildspec,
            &pipeline.build_image,
            false,
            QUALITY_ROLE_ID,
            Vec::new(),
        ),
    )?;

    let mut docker_statements = build_base_statements();
    docker_statements.push(PolicyStatement::ecr_authorization());
    docker_statements.push(PolicyStatement::ecr_push(registry.arn()));
    docker_statements.push(PolicyStatement::code_signing(signing_profile_arn(
        &pipeline.signing_profile_name,
    )));
    stack.add_resource(
        DOCKER_ROLE_ID,
        RoleBuilder::for_service("codebuild.amazonaws.com")
            .inline_policy("docker-build-push-sign", PolicyDocument::new(docker_statements))
            .build()?,
    )?;
    stack.add_resource(
        DOCKER_PROJECT_ID,
        build_project(
            &format!("{}-docker-build", pipeline.pipeline_name),
            &pipeline.docker_buildspec,
            &pipeline.build_image,
            true,
            DOCKER_ROLE_ID,
            vec![
                json!({ "Name": "ECR_REPO_URI", "Type": "PLAINTEXT", "Value": registry.uri() }),
                json!({ "Name": "CONTAINER_NAME", "Type": "PLAINTEXT", "Value": config.service.container_name }),
                json!({ "Name": "SIGNING_PROFILE_NAME", "Type": "PLAINTEXT", "Value": pipeline.signing_profile_name }),
                json!({ "Name": "AWS_ACCOUNT_ID", "Type": "PLAINTEXT", "Value": intrinsic::reference("AWS::AccountId") }),
            ],
        ),
    )?;
    Ok(())
}

fn build_project(
    name: &str,
    buildspec: &str,
    image: &str,
    privileged: bool,
    role_id: &str,
    environment_variables: Vec<Value>,
) -> Resource {
    let mut environment = json!({
        "Type": "LINUX_CONTAINER",
        "ComputeType": "BUILD_GENERAL1_SMALL",
        "Image": image,
        "PrivilegedMode": privileged,
    });
    if !environment_variables.is_empty() {
        environment["EnvironmentVariables"] = Value::Array(environment_variables);
    }

    Resource::new("AWS::CodeBuild::Project")
        .property("Name", name)
        .property("ServiceRole", intrinsic::get_att(role_id, "Arn"))
        .property("Source", json!({ "Type": "CODEPIPELINE", "BuildSpec": buildspec }))
        .property("Artifacts", json!({ "Type": "CODEPIPELINE" }))
        .property("Environment", environment)
        .depends_on(role_id)
}

fn pipeline_role(connection_arn: Value) -> IacResult<Resource> {
    RoleBuilder::for_service("codepipeline.amazonaws.com")
        .inline_policy(
            "pipeline",
            PolicyDocument::new(vec![
                PolicyStatement::allow([
                    "s3:GetBucketVersioning",
                    "s3:GetObject",
                    "s3:GetObjectVersion",
                    "s3:PutObject",
                ])
                .on(intrinsic::get_att(ARTIFACT_BUCKET_ID, "Arn"))
                .on(intrinsic::join(
                    "",
                    vec![intrinsic::get_att(ARTIFACT_BUCKET_ID, "Arn"), json!("/*")],
                )),
                PolicyStatement::allow(["codestar-connections:UseConnection", "codeconnections:UseConnection"])
                    .on(connection_arn),
                PolicyStatement::allow(["codebuild:BatchGetBuilds", "codebuild:StartBuild"])
                    .on(intrinsic::get_att(QUALITY_PROJECT_ID, "Arn"))
                    .on(intrinsic::get_att(DOCKER_PROJECT_ID, "Arn")),
                PolicyStatement::allow([
                    "ecs:DescribeServices",
                    "ecs:DescribeTaskDefinition",
                    "ecs:DescribeTasks",
                    "ecs:ListTasks",
                    "ecs:RegisterTaskDefinition",
                    "ecs:TagResource",
                    "ecs:UpdateService",
                ])
                .on_all(),
                PolicyStatement::allow([
                    "codedeploy:CreateDeployment",
                    "codedeploy:GetApplication",
                    "codedeploy:GetApplicationRevision",
                    "codedeploy:GetDeployment",
                    "codedeploy:GetDeploymentConfig",
                    "codedeploy:RegisterApplicationRevision",
                ])
                .on_all(),
                PolicyStatement::allow(["iam:PassRole"]).on_all(),
            ]),
        )
        .build()
}

/// The fixed stage list.
fn stages(
    config: &WorkshopConfig,
    connection_arn: Value,
    test: &EnvironmentStack,
    prod: &EnvironmentStack,
    deployment: &DeploymentRefs,
) -> Vec<PipelineStage> {
    let source = &config.source;

    vec![
        PipelineStage::new(
            SOURCE_STAGE,
            vec![PipelineAction::new(
                "Source",
                ActionTypeId::aws(ActionCategory::Source, "CodeStarSourceConnection"),
                json!({
                    "ConnectionArn": connection_arn,
                    "FullRepositoryId": format!("{}/{}", source.owner, source.repository),
                    "BranchName": source.branch,
                    "OutputArtifactFormat": "CODE_ZIP",
                    "DetectChanges": true,
                }),
            )
            .output(SOURCE_ARTIFACT)],
        ),
        PipelineStage::new(
            QUALITY_STAGE,
            vec![PipelineAction::new(
                "Code-Quality-Testing",
                ActionTypeId::aws(ActionCategory::Test, "CodeBuild"),
                json!({ "ProjectName": intrinsic::reference(QUALITY_PROJECT_ID) }),
            )
            .input(SOURCE_ARTIFACT)],
        ),
        PipelineStage::new(
            BUILD_STAGE,
            vec![PipelineAction::new(
                "Docker-Build-Push-Sign",
                ActionTypeId::aws(ActionCategory::Build, "CodeBuild"),
                json!({ "ProjectName": intrinsic::reference(DOCKER_PROJECT_ID) }),
            )
            .input(SOURCE_ARTIFACT)
            .output(IMAGE_ARTIFACT)],
        ),
        PipelineStage::new(
            DEPLOY_TEST_STAGE,
            vec![PipelineAction::new(
                "Deploy-Fargate-Test",
                ActionTypeId::aws(ActionCategory::Deploy, "ECS"),
                json!({
                    "ClusterName": test.cluster_name(),
                    "ServiceName": test.service_name(),
                    "FileName": "imagedefinitions.json",
                }),
            )
            .input(IMAGE_ARTIFACT)],
        ),
        PipelineStage::new(
            DEPLOY_PRODUCTION_STAGE,
            vec![
                PipelineAction::new(
                    APPROVAL_ACTION,
                    ActionTypeId::aws(ActionCategory::Approval, "Manual"),
                    json!({
                        "CustomData": format!(
                            "Approve deployment of {} to {}",
                            prod.service_name(),
                            prod.cluster_name()
                        ),
                    }),
                )
                .run_order(1),
                PipelineAction::new(
                    BLUE_GREEN_ACTION,
                    ActionTypeId::aws(ActionCategory::Deploy, "CodeDeployToECS"),
                    json!({
                        "ApplicationName": deployment.application_name,
                        "DeploymentGroupName": deployment.deployment_group_name,
                        "TaskDefinitionTemplateArtifact": IMAGE_ARTIFACT,
                        "TaskDefinitionTemplatePath": "taskdef.json",
                        "AppSpecTemplateArtifact": IMAGE_ARTIFACT,
                        "AppSpecTemplatePath": "appspec.yaml",
                        "Image1ArtifactName": IMAGE_ARTIFACT,
                        "Image1ContainerName": "IMAGE1_NAME",
                    }),
                )
                .input(IMAGE_ARTIFACT)
                .run_order(2),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryStack;

    fn build(config: &WorkshopConfig) -> PipelineStack {
        let registry = RegistryStack::build(&config.registry).unwrap();
        let test = EnvironmentStack::build("test", registry.reference(), config).unwrap();
        let prod = EnvironmentStack::build("prod", registry.reference(), config).unwrap();
        PipelineStack::build(registry.reference(), &test, &prod, config).unwrap()
    }

    #[test]
    fn test_stage_order_is_fixed() {
        let pipeline = build(&WorkshopConfig::default());
        assert_eq!(pipeline.stage_names(), STAGE_ORDER.to_vec());
    }

    #[test]
    fn test_approval_precedes_blue_green_deploy() {
        let pipeline = build(&WorkshopConfig::default());
        let production = pipeline.stages().last().unwrap();

        let approval = production.action(APPROVAL_ACTION).unwrap();
        let deploy = production.action(BLUE_GREEN_ACTION).unwrap();
        assert_eq!(approval.run_order, 1);
        assert_eq!(deploy.run_order, 2);
        assert_eq!(deploy.action_type_id.provider, "CodeDeployToECS");
    }

    #[test]
    fn test_deploy_test_uses_names_by_value() {
        let pipeline = build(&WorkshopConfig::default());
        let deploy_test = &pipeline.stages()[3].actions[0];
        assert_eq!(deploy_test.configuration["ClusterName"], "test-ecs-cluster");
        assert_eq!(deploy_test.configuration["ServiceName"], "test-fargate-service");
    }

    #[test]
    fn test_actions_bind_exactly_one_input() {
        let pipeline = build(&WorkshopConfig::default());
        for stage in pipeline.stages() {
            for action in &stage.actions {
                let expected = match action.action_type_id.category {
                    ActionCategory::Source | ActionCategory::Approval => 0,
                    _ => 1,
                };
                assert_eq!(
                    action.input_artifacts.len(),
                    expected,
                    "{} binds {} inputs",
                    action.name,
                    action.input_artifacts.len()
                );
            }
        }
        let source = &pipeline.stages()[0].actions[0];
        assert_eq!(source.output_artifacts, vec![ArtifactRef::new(SOURCE_ARTIFACT)]);
    }

    #[test]
    fn test_existing_connection_is_reused() {
        let mut config = WorkshopConfig::default();
        config.source.connection_arn =
            Some("arn:aws:codeconnections:us-east-1:123456789012:connection/abc".to_string());
        let pipeline = build(&config);
        let template = pipeline.stack().template();

        assert_eq!(template.count_of_type("AWS::CodeConnections::Connection"), 0);
        assert!(!template.outputs.contains_key("sourceConnectionArn"));
        assert_eq!(
            pipeline.stages()[0].actions[0].configuration["ConnectionArn"],
            "arn:aws:codeconnections:us-east-1:123456789012:connection/abc"
        );
    }

    #[test]
    fn test_docker_role_grants_ecr_and_signing() {
        let pipeline = build(&WorkshopConfig::default());
        let template = pipeline.stack().template();
        let role = &template.resources[DOCKER_ROLE_ID];
        let statements = &role.prop("Policies").unwrap()[0]["PolicyDocument"]["Statement"];

        let actions: Vec<&str> = statements
            .as_array()
            .unwrap()
            .iter()
            .flat_map(|s| s["Action"].as_array().unwrap().iter().filter_map(Value::as_str))
            .collect();
        assert!(actions.contains(&"ecr:PutImage"));
        assert!(actions.contains(&"signer:SignPayload"));
    }

    #[test]
    fn test_pipeline_without_blue_green_prod_is_rejected() {
        let config = WorkshopConfig::default();
        let registry = RegistryStack::build(&config.registry).unwrap();
        let test = EnvironmentStack::build("test", registry.reference(), &config).unwrap();
        let also_test = EnvironmentStack::build("qa", registry.reference(), &config).unwrap();

        let err = PipelineStack::build(registry.reference(), &test, &also_test, &config).unwrap_err();
        assert!(matches!(err, IacError::InvalidConfig(_)));
    }
}
