//! Environment stack: network, cluster and load-balanced Fargate service.
//!
//! Every environment gets the same resources. The production environment
//! additionally declares a second (green) listener and target group so that
//! the deployment engine can shift traffic between two pools. Which of the
//! two shapes is built is decided once, up front, by [`TopologyKind`].

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::{HealthCheckConfig, ServiceConfig, WorkshopConfig};
use crate::error::IacResult;
use crate::iam::{PolicyDocument, PolicyStatement, RoleBuilder};
use crate::intrinsic;
use crate::network::{NetworkRefs, NetworkSpec};
use crate::registry::RegistryRef;
use crate::template::{logical_id, Resource, Stack};

pub const DEREGISTRATION_DELAY_KEY: &str = "deregistration_delay.timeout_seconds";

/// Which traffic topology an environment gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyKind {
    /// One listener and one target group; ECS rolling deployments.
    Simple,
    /// Blue (live) and green (staging) pairs; CodeDeploy-controlled cutover.
    BlueGreen,
}

impl TopologyKind {
    pub fn for_environment(environment: &str, config: &WorkshopConfig) -> Self {
        if config.is_production(environment) {
            Self::BlueGreen
        } else {
            Self::Simple
        }
    }

    /// ECS deployment controller type for this topology.
    pub fn deployment_controller(&self) -> &'static str {
        match self {
            Self::Simple => "ECS",
            Self::BlueGreen => "CODE_DEPLOY",
        }
    }
}

/// A listener bound to the target group it forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficPair {
    pub listener_id: String,
    pub target_group_id: String,
    pub port: u16,
}

/// The declared traffic topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    Simple { primary: TrafficPair },
    BlueGreen { blue: TrafficPair, green: TrafficPair },
}

impl Topology {
    pub fn kind(&self) -> TopologyKind {
        match self {
            Self::Simple { .. } => TopologyKind::Simple,
            Self::BlueGreen { .. } => TopologyKind::BlueGreen,
        }
    }

    /// The pair the service is registered with and live traffic hits.
    pub fn live(&self) -> &TrafficPair {
        match self {
            Self::Simple { primary } => primary,
            Self::BlueGreen { blue, .. } => blue,
        }
    }

    pub fn pairs(&self) -> Vec<&TrafficPair> {
        match self {
            Self::Simple { primary } => vec![primary],
            Self::BlueGreen { blue, green } => vec![blue, green],
        }
    }
}

/// Export names of the blue/green pairs, imported by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlueGreenExports {
    pub blue_listener_arn: String,
    pub green_listener_arn: String,
    pub blue_target_group_name: String,
    pub green_target_group_name: String,
}

/// Export names of an environment stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentExports {
    pub cluster_name: String,
    pub service_name: String,
    pub vpc_id: String,
    pub load_balancer_dns: String,
    pub service_url: String,
    pub blue_green: Option<BlueGreenExports>,
}

/// Generated environment stack.
#[derive(Debug, Clone)]
pub struct EnvironmentStack {
    environment: String,
    stack: Stack,
    cluster_name: String,
    service_name: String,
    topology: Topology,
    exports: EnvironmentExports,
}

impl EnvironmentStack {
    /// Build the stack for `environment`, pulling its image from `registry`.
    pub fn build(
        environment: &str,
        registry: &RegistryRef,
        config: &WorkshopConfig,
    ) -> IacResult<Self> {
        let kind = TopologyKind::for_environment(environment, config);
        let stack_name = config.environment_stack_name(environment);
        info!("Building environment stack {} ({:?})", stack_name, kind);

        let mut stack = Stack::new(
            &stack_name,
            format!("{} environment: VPC, ECS cluster and Fargate service", environment),
        )?;
        stack.add_dependency(&registry.stack_name);

        let cluster_name = format!("{}-ecs-cluster", environment);
        let service_name = format!("{}-fargate-service", environment);

        let network = NetworkSpec::new(format!("{}-vpc", environment), &config.network)
            .declare(&mut stack)?;

        let cluster_id = logical_id(&[cluster_name.as_str()]);
        stack.add_resource(
            &cluster_id,
            Resource::new("AWS::ECS::Cluster").property("ClusterName", cluster_name.as_str()),
        )?;

        let builder = ServiceBuilder {
            environment,
            service_name: &service_name,
            service: &config.service,
            health_check: &config.health_check,
            registry,
            network: &network,
        };
        let task_definition_id = builder.declare_task_definition(&mut stack)?;
        let security = builder.declare_security_groups(&mut stack, kind)?;
        let load_balancer_id = builder.declare_load_balancer(&mut stack, &security.load_balancer)?;

        let primary = builder.declare_pair(
            &mut stack,
            &load_balancer_id,
            "",
            config.service.listener_port,
        )?;
        let topology = match kind {
            TopologyKind::Simple => Topology::Simple { primary },
            TopologyKind::BlueGreen => {
                let green = builder.declare_pair(
                    &mut stack,
                    &load_balancer_id,
                    "green",
                    config.service.green_listener_port,
                )?;
                Topology::BlueGreen {
                    blue: primary,
                    green,
                }
            }
        };

        let service_id = builder.declare_service(
            &mut stack,
            &cluster_id,
            &task_definition_id,
            &security.service,
            &topology,
        )?;

        let exports = declare_outputs(
            &mut stack,
            &cluster_id,
            &service_id,
            &network,
            &load_balancer_id,
            &topology,
        )?;

        Ok(Self {
            environment: environment.to_string(),
            stack,
            cluster_name,
            service_name,
            topology,
            exports,
        })
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn into_stack(self) -> Stack {
        self.stack
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn exports(&self) -> &EnvironmentExports {
        &self.exports
    }
}

/// Logical IDs of the two security groups.
struct SecurityGroups {
    load_balancer: String,
    service: String,
}

struct ServiceBuilder<'a> {
    environment: &'a str,
    service_name: &'a str,
    service: &'a ServiceConfig,
    health_check: &'a HealthCheckConfig,
    registry: &'a RegistryRef,
    network: &'a NetworkRefs,
}

impl ServiceBuilder<'_> {
    fn id(&self, suffix: &str) -> String {
        logical_id(&[self.service_name, suffix])
    }

    fn subnet_refs(&self) -> Value {
        Value::Array(
            self.network
                .public_subnet_ids
                .iter()
                .map(|id| intrinsic::reference(id))
                .collect(),
        )
    }

    fn declare_task_definition(&self, stack: &mut Stack) -> IacResult<String> {
        let log_group_id = self.id("LogGroup");
        stack.add_resource(
            &log_group_id,
            Resource::new("AWS::Logs::LogGroup")
                .property("RetentionInDays", 30)
                .retain(),
        )?;

        let execution_role_id = self.id("TaskExecutionRole");
        stack.add_resource(
            &execution_role_id,
            RoleBuilder::for_service("ecs-tasks.amazonaws.com")
                .inline_policy(
                    "pull-image-and-write-logs",
                    PolicyDocument::new(vec![
                        PolicyStatement::ecr_authorization(),
                        PolicyStatement::allow([
                            "ecr:BatchCheckLayerAvailability",
                            "ecr:BatchGetImage",
                            "ecr:GetDownloadUrlForLayer",
                        ])
                        .on(self.registry.arn()),
                        PolicyStatement::allow(["logs:CreateLogStream", "logs:PutLogEvents"])
                            .on(intrinsic::get_att(&log_group_id, "Arn")),
                    ]),
                )
                .build()?,
        )?;

        let task_role_id = self.id("TaskRole");
        stack.add_resource(
            &task_role_id,
            RoleBuilder::for_service("ecs-tasks.amazonaws.com").build()?,
        )?;

        let container = json!({
            "Name": self.service.container_name,
            "Image": self.registry.image("latest"),
            "Essential": true,
            "PortMappings": [{
                "ContainerPort": self.service.container_port,
                "Protocol": "tcp",
            }],
            "LogConfiguration": {
                "LogDriver": "awslogs",
                "Options": {
                    "awslogs-group": intrinsic::reference(&log_group_id),
                    "awslogs-stream-prefix": self.service_name,
                    "awslogs-region": intrinsic::reference("AWS::Region"),
                },
            },
        });

        let task_definition_id = self.id("TaskDef");
        stack.add_resource(
            &task_definition_id,
            Resource::new("AWS::ECS::TaskDefinition")
                .property("Family", format!("{}-{}", self.environment, self.service.container_name))
                .property("Cpu", self.service.cpu.to_string())
                .property("Memory", self.service.memory_mib.to_string())
                .property("NetworkMode", "awsvpc")
                .property("RequiresCompatibilities", json!(["FARGATE"]))
                .property("ExecutionRoleArn", intrinsic::get_att(&execution_role_id, "Arn"))
                .property("TaskRoleArn", intrinsic::get_att(&task_role_id, "Arn"))
                .property("ContainerDefinitions", json!([container])),
        )?;
        Ok(task_definition_id)
    }

    fn declare_security_groups(&self, stack: &mut Stack, kind: TopologyKind) -> IacResult<SecurityGroups> {
        let mut listener_ports = vec![self.service.listener_port];
        if kind == TopologyKind::BlueGreen {
            listener_ports.push(self.service.green_listener_port);
        }
        let ingress: Vec<Value> = listener_ports
            .iter()
            .map(|port| {
                json!({
                    "CidrIp": "0.0.0.0/0",
                    "IpProtocol": "tcp",
                    "FromPort": port,
                    "ToPort": port,
                    "Description": format!("Allow from anyone on port {}", port),
                })
            })
            .collect();

        let lb_sg_id = self.id("LBSecurityGroup");
        stack.add_resource(
            &lb_sg_id,
            Resource::new("AWS::EC2::SecurityGroup")
                .property("GroupDescription", format!("{} load balancer", self.service_name))
                .property("VpcId", intrinsic::reference(&self.network.vpc_id))
                .property("SecurityGroupIngress", Value::Array(ingress)),
        )?;

        let service_sg_id = self.id("ServiceSecurityGroup");
        stack.add_resource(
            &service_sg_id,
            Resource::new("AWS::EC2::SecurityGroup")
                .property("GroupDescription", format!("{} tasks", self.service_name))
                .property("VpcId", intrinsic::reference(&self.network.vpc_id))
                .property(
                    "SecurityGroupIngress",
                    json!([{
                        "IpProtocol": "tcp",
                        "FromPort": self.service.container_port,
                        "ToPort": self.service.container_port,
                        "SourceSecurityGroupId": intrinsic::get_att(&lb_sg_id, "GroupId"),
                        "Description": "Load balancer to target",
                    }]),
                ),
        )?;

        Ok(SecurityGroups {
            load_balancer: lb_sg_id,
            service: service_sg_id,
        })
    }

    fn declare_load_balancer(&self, stack: &mut Stack, security_group_id: &str) -> IacResult<String> {
        let lb_id = self.id("LB");
        stack.add_resource(
            &lb_id,
            Resource::new("AWS::ElasticLoadBalancingV2::LoadBalancer")
                .property("Type", "application")
                .property("Scheme", "internet-facing")
                .property("Subnets", self.subnet_refs())
                .property(
                    "SecurityGroups",
                    json!([intrinsic::get_att(security_group_id, "GroupId")]),
                )
                .depends_on(self.network.gateway_attachment_id.as_str()),
        )?;
        Ok(lb_id)
    }

    /// Declare a listener and its target group. `label` is empty for the
    /// service's default pair.
    fn declare_pair(
        &self,
        stack: &mut Stack,
        load_balancer_id: &str,
        label: &str,
        port: u16,
    ) -> IacResult<TrafficPair> {
        let target_group_id = self.id(&format!("{}TargetGroup", label));
        stack.add_resource(
            &target_group_id,
            target_group(self.health_check, &self.network.vpc_id),
        )?;

        let listener_id = self.id(&format!("{}PublicListener", label));
        stack.add_resource(
            &listener_id,
            Resource::new("AWS::ElasticLoadBalancingV2::Listener")
                .property("LoadBalancerArn", intrinsic::reference(load_balancer_id))
                .property("Port", port)
                .property("Protocol", "HTTP")
                .property(
                    "DefaultActions",
                    json!([{
                        "Type": "forward",
                        "TargetGroupArn": intrinsic::reference(&target_group_id),
                    }]),
                ),
        )?;

        debug!(listener = %listener_id, target_group = %target_group_id, port, "Declared traffic pair");
        Ok(TrafficPair {
            listener_id,
            target_group_id,
            port,
        })
    }

    fn declare_service(
        &self,
        stack: &mut Stack,
        cluster_id: &str,
        task_definition_id: &str,
        security_group_id: &str,
        topology: &Topology,
    ) -> IacResult<String> {
        let live = topology.live();
        let mut service = Resource::new("AWS::ECS::Service")
            .property("ServiceName", self.service_name)
            .property("Cluster", intrinsic::reference(cluster_id))
            .property("TaskDefinition", intrinsic::reference(task_definition_id))
            .property("LaunchType", "FARGATE")
            .property("DesiredCount", self.service.desired_count)
            .property(
                "HealthCheckGracePeriodSeconds",
                self.service.health_check_grace_period_seconds,
            )
            .property(
                "DeploymentController",
                json!({ "Type": topology.kind().deployment_controller() }),
            )
            .property(
                "NetworkConfiguration",
                json!({
                    "AwsvpcConfiguration": {
                        "AssignPublicIp": "ENABLED",
                        "SecurityGroups": [intrinsic::get_att(security_group_id, "GroupId")],
                        "Subnets": self.subnet_refs(),
                    },
                }),
            )
            .property(
                "LoadBalancers",
                json!([{
                    "ContainerName": self.service.container_name,
                    "ContainerPort": self.service.container_port,
                    "TargetGroupArn": intrinsic::reference(&live.target_group_id),
                }]),
            );

        if topology.kind() == TopologyKind::Simple {
            service = service.property(
                "DeploymentConfiguration",
                json!({ "MaximumPercent": 200, "MinimumHealthyPercent": 50 }),
            );
        }
        for pair in topology.pairs() {
            service = service.depends_on(pair.listener_id.as_str());
        }

        let service_id = self.id("Service");
        stack.add_resource(&service_id, service)?;
        Ok(service_id)
    }
}

/// Target group with the shared health check and deregistration delay.
///
/// This is the only place health-check settings are written, so every
/// target group of every environment carries identical values.
pub fn target_group(health_check: &HealthCheckConfig, vpc_id: &str) -> Resource {
    Resource::new("AWS::ElasticLoadBalancingV2::TargetGroup")
        .property("Port", 80)
        .property("Protocol", "HTTP")
        .property("TargetType", "ip")
        .property("VpcId", intrinsic::reference(vpc_id))
        .property("HealthCheckPath", health_check.path.as_str())
        .property("HealthyThresholdCount", health_check.healthy_threshold)
        .property("UnhealthyThresholdCount", health_check.unhealthy_threshold)
        .property("HealthCheckTimeoutSeconds", health_check.timeout_seconds)
        .property("HealthCheckIntervalSeconds", health_check.interval_seconds)
        .property(
            "TargetGroupAttributes",
            json!([
                {
                    "Key": DEREGISTRATION_DELAY_KEY,
                    "Value": health_check.deregistration_delay_seconds.to_string(),
                },
                { "Key": "stickiness.enabled", "Value": "false" },
            ]),
        )
}

fn declare_outputs(
    stack: &mut Stack,
    cluster_id: &str,
    service_id: &str,
    network: &NetworkRefs,
    load_balancer_id: &str,
    topology: &Topology,
) -> IacResult<EnvironmentExports> {
    let dns = intrinsic::get_att(load_balancer_id, "DNSName");

    let cluster_name = stack.export("ClusterName", intrinsic::reference(cluster_id), Some("ECS cluster name"))?;
    let service_name = stack.export("ServiceName", intrinsic::get_att(service_id, "Name"), Some("ECS service name"))?;
    let vpc_id = stack.export("VpcId", intrinsic::reference(&network.vpc_id), Some("VPC ID"))?;
    let load_balancer_dns = stack.export("LoadBalancerDns", dns.clone(), Some("Load balancer DNS name"))?;
    let service_url = stack.export(
        "ServiceUrl",
        intrinsic::join("", vec![Value::String("http://".to_string()), dns]),
        Some("Public service endpoint"),
    )?;

    let blue_green = match topology {
        Topology::Simple { .. } => None,
        Topology::BlueGreen { blue, green } => Some(BlueGreenExports {
            blue_listener_arn: stack.export(
                "BlueListenerArn",
                intrinsic::reference(&blue.listener_id),
                Some("Production traffic listener"),
            )?,
            green_listener_arn: stack.export(
                "GreenListenerArn",
                intrinsic::reference(&green.listener_id),
                Some("Test traffic listener"),
            )?,
            blue_target_group_name: stack.export(
                "BlueTargetGroupName",
                intrinsic::get_att(&blue.target_group_id, "TargetGroupName"),
                Some("Live target group"),
            )?,
            green_target_group_name: stack.export(
                "GreenTargetGroupName",
                intrinsic::get_att(&green.target_group_id, "TargetGroupName"),
                Some("Staging target group"),
            )?,
        }),
    };

    Ok(EnvironmentExports {
        cluster_name,
        service_name,
        vpc_id,
        load_balancer_dns,
        service_url,
        blue_green,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryStack;

    fn build(environment: &str) -> EnvironmentStack {
        let config = WorkshopConfig::default();
        let registry = RegistryStack::build(&config.registry).unwrap();
        EnvironmentStack::build(environment, registry.reference(), &config).unwrap()
    }

    #[test]
    fn test_topology_kind_selection() {
        let config = WorkshopConfig::default();
        assert_eq!(TopologyKind::for_environment("prod", &config), TopologyKind::BlueGreen);
        assert_eq!(TopologyKind::for_environment("test", &config), TopologyKind::Simple);
        assert_eq!(TopologyKind::for_environment("staging", &config), TopologyKind::Simple);
    }

    #[test]
    fn test_simple_environment_has_one_pair() {
        let env = build("test");
        let template = env.stack().template();

        assert_eq!(env.topology().pairs().len(), 1);
        assert_eq!(template.count_of_type("AWS::ElasticLoadBalancingV2::TargetGroup"), 1);
        assert_eq!(template.count_of_type("AWS::ElasticLoadBalancingV2::Listener"), 1);
        assert!(env.exports().blue_green.is_none());
        assert_eq!(env.cluster_name(), "test-ecs-cluster");
        assert_eq!(env.service_name(), "test-fargate-service");
    }

    #[test]
    fn test_prod_environment_has_blue_and_green_pairs() {
        let env = build("prod");
        let template = env.stack().template();

        assert_eq!(template.count_of_type("AWS::ElasticLoadBalancingV2::TargetGroup"), 2);
        assert_eq!(template.count_of_type("AWS::ElasticLoadBalancingV2::Listener"), 2);

        let Topology::BlueGreen { blue, green } = env.topology() else {
            panic!("prod must be blue/green");
        };
        assert_ne!(blue, green);
        assert_eq!(green.port, 8080);

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
    fn test_target_group_health_check_constants() {
        let resource = target_group(&HealthCheckConfig::default(), "Vpc");
        assert_eq!(resource.prop("HealthyThresholdCount").unwrap(), 2);
        assert_eq!(resource.prop("UnhealthyThresholdCount").unwrap(), 2);
        assert_eq!(resource.prop("HealthCheckTimeoutSeconds").unwrap(), 10);
        assert_eq!(resource.prop("HealthCheckIntervalSeconds").unwrap(), 11);
        assert_eq!(*resource.prop("HealthCheckPath").unwrap(), "/my-app");
        assert_eq!(resource.prop("TargetGroupAttributes").unwrap()[0]["Value"], "5");
    }

    #[test]
    fn test_environment_imports_registry_uri() {
        let env = build("test");
        assert_eq!(
            env.stack().template().import_names(),
            vec!["ecr-stack:RepositoryArn", "ecr-stack:RepositoryUri"]
        );
        assert_eq!(env.stack().dependencies(), ["ecr-stack".to_string()]);
    }
}
