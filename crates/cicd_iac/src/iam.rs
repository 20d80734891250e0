//! IAM roles and policy documents.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::IacResult;
use crate::template::Resource;

const POLICY_VERSION: &str = "2012-10-17";

/// Statement effect. Only allow statements are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
}

/// A single IAM policy statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyStatement {
    pub effect: Effect,
    #[serde(rename = "Action")]
    pub actions: Vec<String>,
    #[serde(rename = "Resource")]
    pub resources: Vec<Value>,
}

impl PolicyStatement {
    pub fn allow<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            effect: Effect::Allow,
            actions: actions.into_iter().map(Into::into).collect(),
            resources: Vec::new(),
        }
    }

    pub fn on(mut self, resource: impl Into<Value>) -> Self {
        self.resources.push(resource.into());
        self
    }

    pub fn on_all(self) -> Self {
        self.on("*")
    }

    /// ECR login is account-wide and cannot be scoped to a repository.
    pub fn ecr_authorization() -> Self {
        Self::allow(["ecr:GetAuthorizationToken"]).on_all()
    }

    /// Push and pull images in one repository.
    pub fn ecr_push(repository_arn: Value) -> Self {
        Self::allow([
            "ecr:BatchCheckLayerAvailability",
            "ecr:BatchGetImage",
            "ecr:CompleteLayerUpload",
            "ecr:DescribeImages",
            "ecr:GetDownloadUrlForLayer",
            "ecr:InitiateLayerUpload",
            "ecr:PutImage",
            "ecr:UploadLayerPart",
        ])
        .on(repository_arn)
    }

    /// Sign images with a signer profile.
    pub fn code_signing(signing_profile_arn: Value) -> Self {
        Self::allow([
            "signer:GetSigningProfile",
            "signer:SignPayload",
            "signer:GetRevocationStatus",
        ])
        .on(signing_profile_arn)
    }
}

/// An IAM policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: String,
    pub statement: Vec<PolicyStatement>,
}

impl PolicyDocument {
    pub fn new(statement: Vec<PolicyStatement>) -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            statement,
        }
    }

    /// Trust policy letting an AWS service assume the role.
    pub fn assume_role(service: &str) -> Value {
        json!({
            "Version": POLICY_VERSION,
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": service },
                "Action": "sts:AssumeRole",
            }],
        })
    }

    pub fn to_value(&self) -> IacResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Builder for an `AWS::IAM::Role` assumed by a service principal.
pub struct RoleBuilder {
    service: String,
    managed_policies: Vec<String>,
    inline: Vec<(String, PolicyDocument)>,
}

impl RoleBuilder {
    pub fn for_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            managed_policies: Vec::new(),
            inline: Vec::new(),
        }
    }

    pub fn managed_policy(mut self, name: &str) -> Self {
        self.managed_policies
            .push(format!("arn:aws:iam::aws:policy/{}", name));
        self
    }

    pub fn inline_policy(mut self, name: impl Into<String>, document: PolicyDocument) -> Self {
        self.inline.push((name.into(), document));
        self
    }

    pub fn build(self) -> IacResult<Resource> {
        let mut role = Resource::new("AWS::IAM::Role")
            .property("AssumeRolePolicyDocument", PolicyDocument::assume_role(&self.service));

        if !self.managed_policies.is_empty() {
            role = role.property("ManagedPolicyArns", json!(self.managed_policies));
        }
        if !self.inline.is_empty() {
            let policies = self
                .inline
                .iter()
                .map(|(name, doc)| Ok(json!({ "PolicyName": name, "PolicyDocument": doc.to_value()? })))
                .collect::<IacResult<Vec<Value>>>()?;
            role = role.property("Policies", Value::Array(policies));
        }
        Ok(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_serializes_pascal_case() {
        let statement = PolicyStatement::ecr_authorization();
        let value = serde_json::to_value(&statement).unwrap();
        assert_eq!(value["Effect"], "Allow");
        assert_eq!(value["Action"][0], "ecr:GetAuthorizationToken");
        assert_eq!(value["Resource"][0], "*");
    }

    #[test]
    fn test_role_builder_with_inline_policy() {
        let role = RoleBuilder::for_service("codebuild.amazonaws.com")
            .managed_policy("AWSCodeDeployRoleForECS")
            .inline_policy(
                "signing",
                PolicyDocument::new(vec![PolicyStatement::code_signing(json!("arn:profile"))]),
            )
            .build()
            .unwrap();

        assert_eq!(role.resource_type, "AWS::IAM::Role");
        assert_eq!(
            role.prop_path(&["AssumeRolePolicyDocument"]).unwrap()["Statement"][0]["Principal"]["Service"],
            "codebuild.amazonaws.com"
        );
        assert_eq!(
            role.prop("ManagedPolicyArns").unwrap()[0],
            "arn:aws:iam::aws:policy/AWSCodeDeployRoleForECS"
        );
        assert_eq!(role.prop("Policies").unwrap()[0]["PolicyName"], "signing");
        assert_eq!(
            role.prop("Policies").unwrap()[0]["PolicyDocument"]["Statement"][0]["Action"][0],
            "signer:GetSigningProfile"
        );
    }
}
