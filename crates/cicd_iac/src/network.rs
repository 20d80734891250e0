//! Virtual network declaration: one VPC with public subnets only.

use std::net::Ipv4Addr;

use serde_json::json;
use tracing::debug;

use crate::config::NetworkConfig;
use crate::error::{IacError, IacResult};
use crate::intrinsic;
use crate::template::{logical_id, Resource, Stack};

/// Logical IDs of the declared network, for the resources that attach to it.
#[derive(Debug, Clone)]
pub struct NetworkRefs {
    pub vpc_id: String,
    pub public_subnet_ids: Vec<String>,
    /// Attachment every public route depends on.
    pub gateway_attachment_id: String,
}

/// A VPC declaration.
pub struct NetworkSpec<'a> {
    name: String,
    config: &'a NetworkConfig,
}

impl<'a> NetworkSpec<'a> {
    pub fn new(name: impl Into<String>, config: &'a NetworkConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// Add the VPC, internet gateway, subnets and routes to `stack`.
    pub fn declare(&self, stack: &mut Stack) -> IacResult<NetworkRefs> {
        if self.config.nat_gateways != 0 {
            return Err(IacError::InvalidConfig(
                "NAT gateways are not supported for public-only networks".to_string(),
            ));
        }

        let cidrs = subnet_cidrs(&self.config.cidr, self.config.cidr_mask, self.config.max_azs)?;
        let tag_name = format!("{}/{}", stack.name(), self.name);

        let vpc_id = logical_id(&[self.name.as_str()]);
        stack.add_resource(
            &vpc_id,
            Resource::new("AWS::EC2::VPC")
                .property("CidrBlock", self.config.cidr.as_str())
                .property("EnableDnsHostnames", true)
                .property("EnableDnsSupport", true)
                .property("InstanceTenancy", "default")
                .property("Tags", json!([{ "Key": "Name", "Value": tag_name }])),
        )?;

        let igw_id = logical_id(&[self.name.as_str(), "IGW"]);
        stack.add_resource(
            &igw_id,
            Resource::new("AWS::EC2::InternetGateway")
                .property("Tags", json!([{ "Key": "Name", "Value": tag_name }])),
        )?;

        let attachment_id = logical_id(&[self.name.as_str(), "VPCGW"]);
        stack.add_resource(
            &attachment_id,
            Resource::new("AWS::EC2::VPCGatewayAttachment")
                .property("VpcId", intrinsic::reference(&vpc_id))
                .property("InternetGatewayId", intrinsic::reference(&igw_id)),
        )?;

        let mut public_subnet_ids = Vec::with_capacity(cidrs.len());
        for (index, cidr) in cidrs.iter().enumerate() {
            let subnet_name = format!("publicSubnet{}", index + 1);
            let subnet_id = logical_id(&[self.name.as_str(), subnet_name.as_str(), "Subnet"]);
            let table_id = logical_id(&[self.name.as_str(), subnet_name.as_str(), "RouteTable"]);

            stack.add_resource(
                &subnet_id,
                Resource::new("AWS::EC2::Subnet")
                    .property("VpcId", intrinsic::reference(&vpc_id))
                    .property("CidrBlock", cidr.as_str())
                    .property("AvailabilityZone", intrinsic::select(index, intrinsic::get_azs()))
                    .property("MapPublicIpOnLaunch", true)
                    .property(
                        "Tags",
                        json!([
                            { "Key": "Name", "Value": format!("{}/{}", tag_name, subnet_name) },
                            { "Key": "aws-cdk:subnet-type", "Value": "Public" },
                        ]),
                    ),
            )?;
            stack.add_resource(
                &table_id,
                Resource::new("AWS::EC2::RouteTable")
                    .property("VpcId", intrinsic::reference(&vpc_id)),
            )?;
            stack.add_resource(
                logical_id(&[self.name.as_str(), subnet_name.as_str(), "RouteTableAssociation"]),
                Resource::new("AWS::EC2::SubnetRouteTableAssociation")
                    .property("RouteTableId", intrinsic::reference(&table_id))
                    .property("SubnetId", intrinsic::reference(&subnet_id)),
            )?;
            stack.add_resource(
                logical_id(&[self.name.as_str(), subnet_name.as_str(), "DefaultRoute"]),
                Resource::new("AWS::EC2::Route")
                    .property("RouteTableId", intrinsic::reference(&table_id))
                    .property("DestinationCidrBlock", "0.0.0.0/0")
                    .property("GatewayId", intrinsic::reference(&igw_id))
                    .depends_on(attachment_id.as_str()),
            )?;

            public_subnet_ids.push(subnet_id);
        }

        debug!(vpc = %vpc_id, subnets = public_subnet_ids.len(), "Declared network");
        Ok(NetworkRefs {
            vpc_id,
            public_subnet_ids,
            gateway_attachment_id: attachment_id,
        })
    }
}

/// Carve `count` consecutive subnets of size `/mask` out of `cidr`.
pub fn subnet_cidrs(cidr: &str, mask: u8, count: u8) -> IacResult<Vec<String>> {
    let invalid = || IacError::InvalidConfig(format!("invalid VPC CIDR '{}'", cidr));

    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 32 || mask > 32 || mask < prefix {
        return Err(invalid());
    }

    let available = 1u64 << (mask - prefix);
    if u64::from(count) > available {
        return Err(IacError::InvalidConfig(format!(
            "{} cannot hold {} subnets of size /{}",
            cidr, count, mask
        )));
    }

    let base = u32::from(addr);
    let host_bits = u32::MAX.checked_shr(u32::from(prefix)).unwrap_or(0);
    if base & host_bits != 0 {
        return Err(IacError::InvalidConfig(format!(
            "VPC CIDR '{}' has host bits set; use {}/{}",
            cidr,
            Ipv4Addr::from(base & !host_bits),
            prefix
        )));
    }

    let step = 1u32.checked_shl(u32::from(32 - mask)).unwrap_or(0);
    (0..u32::from(count))
        .map(|i| {
            i.checked_mul(step)
                .and_then(|offset| base.checked_add(offset))
                .map(|network| format!("{}/{}", Ipv4Addr::from(network), mask))
                .ok_or_else(|| {
                    IacError::InvalidConfig(format!("{} subnets of size /{} overflow {}", count, mask, cidr))
                })
        })
        .collect()
}
