//! Integration tests for stack generation.

use std::fs;

use cicd_iac::pipeline::{APPROVAL_ACTION, BLUE_GREEN_ACTION, DEPLOY_PRODUCTION_STAGE};
use cicd_iac::{
    Assembly, CloudApp, DeploymentPacing, EnvironmentStack, IacError, PipelineStack, RegistryStack, StackRole,
    TemplateAssertions, TemplateFormat, TopologyKind, WorkshopConfig, MANIFEST_FILE,
};
use tempfile::tempdir;

const TARGET_GROUP: &str = "AWS::ElasticLoadBalancingV2::TargetGroup";
const LISTENER: &str = "AWS::ElasticLoadBalancingV2::Listener";

fn build_all(config: &WorkshopConfig) -> (RegistryStack, EnvironmentStack, EnvironmentStack, PipelineStack) {
    let registry = RegistryStack::build(&config.registry).unwrap();
    let test = EnvironmentStack::build(&config.test_environment, registry.reference(), config).unwrap();
    let prod = EnvironmentStack::build(&config.production_environment, registry.reference(), config).unwrap();
    let pipeline = PipelineStack::build(registry.reference(), &test, &prod, config).unwrap();
    (registry, test, prod, pipeline)
}

#[test]
fn test_prod_has_two_pairs_and_blue_is_default() {
    let config = WorkshopConfig::default();
    let (_, _, prod, _) = build_all(&config);
    let template = prod.stack().template();

    assert_eq!(prod.topology().kind(), TopologyKind::BlueGreen);
    assert_eq!(template.count_of_type(TARGET_GROUP), 2);
    assert_eq!(template.count_of_type(LISTENER), 2);

    let blue = prod.topology().live();
    let (_, service) = template.resources_of_type("AWS::ECS::Service").next().unwrap();
    assert_eq!(
        service.prop("LoadBalancers").unwrap()[0]["TargetGroupArn"]["Ref"],
        blue.target_group_id.as_str()
    );
    assert_eq!(
        *service.prop_path(&["DeploymentController", "Type"]).unwrap(),
        "CODE_DEPLOY"
    );
}

#[test]
fn test_other_environments_have_one_pair() {
    let config = WorkshopConfig::default();
    let (registry, test, _, _) = build_all(&config);
    assert_eq!(test.topology().kind(), TopologyKind::Simple);
    assert_eq!(test.stack().template().count_of_type(TARGET_GROUP), 1);
    assert_eq!(test.stack().template().count_of_type(LISTENER), 1);

    let staging = EnvironmentStack::build("staging", registry.reference(), &config).unwrap();
    assert_eq!(staging.topology().pairs().len(), 1);
    assert!(staging.exports().blue_green.is_none());
}

#[test]
fn test_pipeline_stage_order_and_approval() {
    let config = WorkshopConfig::default();
    let (_, _, _, pipeline) = build_all(&config);

    assert_eq!(
        pipeline.stage_names(),
        vec![
            "Source",
            "Code-Quality-Testing",
            "Docker-Push-ECR",
            "Deploy-Test",
            "Deploy-Production"
        ]
    );

    let production = pipeline
        .stages()
        .iter()
        .find(|s| s.name == DEPLOY_PRODUCTION_STAGE)
        .unwrap();
    let approval = production.action(APPROVAL_ACTION).unwrap();
    let deploy = production.action(BLUE_GREEN_ACTION).unwrap();
    assert!(approval.run_order < deploy.run_order);
    assert_eq!((approval.run_order, deploy.run_order), (1, 2));
}

#[test]
fn test_health_checks_identical_everywhere() {
    let config = WorkshopConfig::default();
    let assembly = CloudApp::synth(&config).unwrap();

    let mut seen = 0;
    for entry in assembly.stacks() {
        for (_, tg) in entry.stack.template().resources_of_type(TARGET_GROUP) {
            seen += 1;
            assert_eq!(*tg.prop("HealthCheckPath").unwrap(), "/my-app");
            assert_eq!(*tg.prop("HealthyThresholdCount").unwrap(), 2);
            assert_eq!(*tg.prop("UnhealthyThresholdCount").unwrap(), 2);
            assert_eq!(*tg.prop("HealthCheckTimeoutSeconds").unwrap(), 10);
            assert_eq!(*tg.prop("HealthCheckIntervalSeconds").unwrap(), 11);
        }
    }
    assert_eq!(seen, 3);
}

#[test]
fn test_registry_identifier_consumed_by_every_stack() {
    let assembly = CloudApp::synth(&WorkshopConfig::default()).unwrap();
    let links = assembly.link();
    assert!(links.is_ok(), "{:?}", links.errors);

    for name in ["test-app-stack", "prod-app-stack", "pipeline-stack"] {
        let imports = links.imports_between(name, "ecr-stack");
        assert!(!imports.is_empty(), "{} imports nothing from the registry", name);
        assert!(imports.iter().all(|i| i.starts_with("ecr-stack:")));
    }
}

#[test]
fn test_assertions_pass_on_written_assembly() {
    let dir = tempdir().unwrap();
    let config = WorkshopConfig::default();
    CloudApp::synth(&config)
        .unwrap()
        .write_to(dir.path(), TemplateFormat::Json)
        .unwrap();

    let (manifest, assembly) = Assembly::load(dir.path()).unwrap();
    assert_eq!(manifest.stacks.len(), 4);

    let report = TemplateAssertions::new(&config.health_check).check(&assembly);
    assert!(report.passed, "{:?}", report.failures().collect::<Vec<_>>());
}

#[test]
fn test_assertions_catch_edited_template() {
    let dir = tempdir().unwrap();
    let config = WorkshopConfig::default();
    CloudApp::synth(&config)
        .unwrap()
        .write_to(dir.path(), TemplateFormat::Json)
        .unwrap();

    // Point the green listener at the blue target group.
    let path = dir.path().join("prod-app-stack.template.json");
    let content = fs::read_to_string(&path).unwrap();
    let edited = content.replace(
        "\"Ref\": \"ProdFargateServiceGreenTargetGroup\"",
        "\"Ref\": \"ProdFargateServiceTargetGroup\"",
    );
    assert_ne!(content, edited);
    fs::write(&path, edited).unwrap();

    let (_, assembly) = Assembly::load(dir.path()).unwrap();
    let report = TemplateAssertions::new(&config.health_check).check(&assembly);
    assert!(!report.passed);
    assert!(!report.check("traffic-pairs:prod").unwrap().passed);
}

#[test]
fn test_manifest_lists_stacks_in_deploy_order() {
    let dir = tempdir().unwrap();
    let manifest = CloudApp::synth(&WorkshopConfig::default())
        .unwrap()
        .write_to(dir.path(), TemplateFormat::Yaml)
        .unwrap();

    assert!(dir.path().join(MANIFEST_FILE).exists());
    let names: Vec<_> = manifest.stacks.iter().map(|e| e.stack_name.as_str()).collect();
    assert_eq!(names, vec!["ecr-stack", "test-app-stack", "prod-app-stack", "pipeline-stack"]);
    assert_eq!(manifest.stacks[0].role, StackRole::Registry);
    assert!(manifest.stacks[3].dependencies.contains(&"prod-app-stack".to_string()));
}

#[test]
fn test_custom_environment_names() {
    let config = WorkshopConfig::default().with_environments("qa", "live");
    let assembly = CloudApp::synth(&config).unwrap();

    assert!(assembly.stack("qa-app-stack").is_some());
    let live = assembly.stack("live-app-stack").unwrap();
    assert_eq!(
        live.role,
        StackRole::Environment {
            environment: "live".to_string(),
            blue_green: true
        }
    );
}

#[test]
fn test_custom_pacing_declares_deployment_config() {
    let mut config = WorkshopConfig::default();
    config.blue_green.pacing = DeploymentPacing::Canary {
        percent: 20,
        interval_minutes: 3,
    };
    let (_, _, _, pipeline) = build_all(&config);

    assert_eq!(
        pipeline
            .stack()
            .template()
            .count_of_type("AWS::CodeDeploy::DeploymentConfig"),
        1
    );
}

#[test]
fn test_invalid_config_rejected() {
    let mut config = WorkshopConfig::default();
    config.blue_green.pacing = DeploymentPacing::Linear {
        percent: 0,
        interval_minutes: 1,
    };
    assert!(matches!(CloudApp::synth(&config), Err(IacError::InvalidConfig(_))));
}

#[test]
fn test_unaligned_vpc_cidr_rejected_before_synthesis() {
    let mut config = WorkshopConfig::default();
    config.network.cidr = "10.0.0.5/16".to_string();
    assert!(matches!(CloudApp::synth(&config), Err(IacError::InvalidConfig(_))));
}

#[test]
fn test_stack_name_collision_is_config_error() {
    let mut config = WorkshopConfig::default();
    config.pipeline.stack_name = "test-app-stack".to_string();
    assert!(matches!(CloudApp::synth(&config), Err(IacError::InvalidConfig(_))));
}
