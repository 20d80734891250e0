//! Structural checks on a synthesized assembly.
//!
//! These run on templates (in memory or read back from disk), not on the
//! builders, so they catch hand edits to generated files as well.

use serde_json::Value;
use tracing::{debug, info};

use crate::app::{Assembly, StackRole};
use crate::config::HealthCheckConfig;
use crate::environment::DEREGISTRATION_DELAY_KEY;
use crate::intrinsic;
use crate::pipeline::{PipelineStage, APPROVAL_ACTION, BLUE_GREEN_ACTION, DEPLOY_PRODUCTION_STAGE, STAGE_ORDER};
use crate::template::{Resource, Template};

const TARGET_GROUP: &str = "AWS::ElasticLoadBalancingV2::TargetGroup";
const LISTENER: &str = "AWS::ElasticLoadBalancingV2::Listener";
const SERVICE: &str = "AWS::ECS::Service";
const PIPELINE: &str = "AWS::CodePipeline::Pipeline";

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

/// Report of all checks.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub checks: Vec<ValidationCheck>,
    pub passed: bool,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            checks: Vec::new(),
            passed: true,
        }
    }

    pub fn add_check(&mut self, name: &str, passed: bool, message: impl Into<String>) {
        if !passed {
            self.passed = false;
        }
        self.checks.push(ValidationCheck {
            name: name.to_string(),
            passed,
            message: message.into(),
        });
    }

    pub fn failures(&self) -> impl Iterator<Item = &ValidationCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }

    pub fn check(&self, name: &str) -> Option<&ValidationCheck> {
        self.checks.iter().find(|c| c.name == name)
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks an assembly against the expected topology.
pub struct TemplateAssertions<'a> {
    health_check: &'a HealthCheckConfig,
}

impl<'a> TemplateAssertions<'a> {
    pub fn new(health_check: &'a HealthCheckConfig) -> Self {
        Self { health_check }
    }

    /// Run every check.
    pub fn check(&self, assembly: &Assembly) -> ValidationReport {
        info!("Checking {} stacks", assembly.stacks().len());
        let mut report = ValidationReport::new();

        self.check_links(assembly, &mut report);
        self.check_traffic_pairs(assembly, &mut report);
        self.check_health_checks(assembly, &mut report);
        self.check_registry_identifier(assembly, &mut report);
        self.check_pipeline(assembly, &mut report);

        debug!(passed = report.passed, checks = report.checks.len(), "Checks finished");
        report
    }

    fn check_links(&self, assembly: &Assembly, report: &mut ValidationReport) {
        let links = assembly.link();
        if links.is_ok() {
            report.add_check("cross-stack-links", true, format!("{} imports resolved", links.links.len()));
        } else {
            report.add_check("cross-stack-links", false, links.errors.join("; "));
        }
    }

    fn check_traffic_pairs(&self, assembly: &Assembly, report: &mut ValidationReport) {
        for entry in assembly.environments() {
            let StackRole::Environment { environment, blue_green } = &entry.role else {
                continue;
            };
            let template = entry.stack.template();
            let name = format!("traffic-pairs:{}", environment);

            let expected = if *blue_green { 2 } else { 1 };
            let target_groups = template.count_of_type(TARGET_GROUP);
            let listeners = template.count_of_type(LISTENER);
            if target_groups != expected || listeners != expected {
                report.add_check(
                    &name,
                    false,
                    format!(
                        "expected {} listener/target-group pair(s), found {} listeners and {} target groups",
                        expected, listeners, target_groups
                    ),
                );
                continue;
            }

            if *blue_green {
                match blue_is_service_default(template) {
                    Ok(()) => report.add_check(&name, true, "blue pair is the service default; green is separate"),
                    Err(message) => report.add_check(&name, false, message),
                }
            } else {
                report.add_check(&name, true, "single pair");
            }
        }
    }

    fn check_health_checks(&self, assembly: &Assembly, report: &mut ValidationReport) {
        let hc = self.health_check;
        let expected: [(&str, Value); 5] = [
            ("HealthCheckPath", Value::from(hc.path.as_str())),
            ("HealthyThresholdCount", Value::from(hc.healthy_threshold)),
            ("UnhealthyThresholdCount", Value::from(hc.unhealthy_threshold)),
            ("HealthCheckTimeoutSeconds", Value::from(hc.timeout_seconds)),
            ("HealthCheckIntervalSeconds", Value::from(hc.interval_seconds)),
        ];
        let delay = hc.deregistration_delay_seconds.to_string();

        let mut mismatches = Vec::new();
        let mut checked = 0;
        for entry in assembly.stacks() {
            for (id, target_group) in entry.stack.template().resources_of_type(TARGET_GROUP) {
                checked += 1;
                for (key, value) in &expected {
                    if target_group.prop(key) != Some(value) {
                        mismatches.push(format!("{}/{}: {} is {:?}", entry.stack.name(), id, key, target_group.prop(key)));
                    }
                }
                if deregistration_delay(target_group) != Some(delay.as_str()) {
                    mismatches.push(format!("{}/{}: deregistration delay differs", entry.stack.name(), id));
                }
            }
        }

        if mismatches.is_empty() {
            report.add_check("health-checks", true, format!("{} target groups share identical settings", checked));
        } else {
            report.add_check("health-checks", false, mismatches.join("; "));
        }
    }

    fn check_registry_identifier(&self, assembly: &Assembly, report: &mut ValidationReport) {
        let Some(registry) = assembly.registry() else {
            report.add_check("registry-identifier", false, "no registry stack");
            return;
        };
        let registry_name = registry.stack.name();
        let links = assembly.link();

        let missing: Vec<&str> = assembly
            .stacks()
            .iter()
            .filter(|s| s.role != StackRole::Registry)
            .map(|s| s.stack.name())
            .filter(|consumer| links.imports_between(consumer, registry_name).is_empty())
            .collect();

        if missing.is_empty() {
            report.add_check(
                "registry-identifier",
                true,
                format!("every stack imports the repository from {}", registry_name),
            );
        } else {
            report.add_check(
                "registry-identifier",
                false,
                format!("stacks not consuming {}: {}", registry_name, missing.join(", ")),
            );
        }
    }

    fn check_pipeline(&self, assembly: &Assembly, report: &mut ValidationReport) {
        let stages = match assembly.pipeline().map(|p| pipeline_stages(p.stack.template())) {
            Some(Ok(stages)) => stages,
            Some(Err(message)) => {
                report.add_check("stage-order", false, message);
                return;
            }
            None => {
                report.add_check("stage-order", false, "no pipeline stack");
                return;
            }
        };

        let names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        report.add_check(
            "stage-order",
            names == STAGE_ORDER,
            format!("stages: {}", names.join(" -> ")),
        );

        let production = stages.iter().find(|s| s.name == DEPLOY_PRODUCTION_STAGE);
        let orders = production.and_then(|stage| {
            Some((
                stage.action(APPROVAL_ACTION)?.run_order,
                stage.action(BLUE_GREEN_ACTION)?.run_order,
            ))
        });
        match orders {
            Some((1, 2)) => report.add_check("approval-before-deploy", true, "approval runs 1, deploy runs 2"),
            Some((approval, deploy)) => report.add_check(
                "approval-before-deploy",
                false,
                format!("approval runs {}, deploy runs {}", approval, deploy),
            ),
            None => report.add_check(
                "approval-before-deploy",
                false,
                format!("{} lacks approval or blue/green action", DEPLOY_PRODUCTION_STAGE),
            ),
        }
    }
}

fn deregistration_delay(target_group: &Resource) -> Option<&str> {
    target_group
        .prop("TargetGroupAttributes")?
        .as_array()?
        .iter()
        .find(|attr| attr["Key"] == DEREGISTRATION_DELAY_KEY)
        .and_then(|attr| attr["Value"].as_str())
}

/// Target group a listener forwards to by default.
fn listener_target(template: &Template, listener_id: &str) -> Option<String> {
    let listener = template.resources.get(listener_id)?;
    let target = &listener.prop("DefaultActions")?[0]["TargetGroupArn"];
    intrinsic::as_ref(target).map(str::to_string)
}

fn output_ref<'t>(template: &'t Template, output: &str) -> Option<&'t str> {
    intrinsic::as_ref(&template.outputs.get(output)?.value)
}

fn blue_is_service_default(template: &Template) -> Result<(), String> {
    let (_, service) = template
        .resources_of_type(SERVICE)
        .next()
        .ok_or("no ECS service")?;
    let service_target = service
        .prop("LoadBalancers")
        .and_then(|lbs| intrinsic::as_ref(&lbs[0]["TargetGroupArn"]))
        .ok_or("service has no load balancer target group")?;

    let blue_listener = output_ref(template, "BlueListenerArn").ok_or("missing BlueListenerArn output")?;
    let green_listener = output_ref(template, "GreenListenerArn").ok_or("missing GreenListenerArn output")?;

    let blue_target = listener_target(template, blue_listener).ok_or("blue listener has no target group")?;
    let green_target = listener_target(template, green_listener).ok_or("green listener has no target group")?;

    if blue_target != service_target {
        return Err(format!(
            "service is registered with {} but blue listener forwards to {}",
            service_target, blue_target
        ));
    }
    if green_target == blue_target {
        return Err("green listener forwards to the blue target group".to_string());
    }
    Ok(())
}

fn pipeline_stages(template: &Template) -> Result<Vec<PipelineStage>, String> {
    let (_, pipeline) = template
        .resources_of_type(PIPELINE)
        .next()
        .ok_or("no pipeline resource")?;
    let stages = pipeline.prop("Stages").ok_or("pipeline has no stages")?;
    serde_json::from_value(stages.clone()).map_err(|e| format!("malformed stages: {}", e))
}
