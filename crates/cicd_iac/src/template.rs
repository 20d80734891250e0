//! CloudFormation template model.
//!
//! Resources and outputs are stored in ordered maps so that synthesizing the
//! same configuration twice produces byte-identical templates.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{IacError, IacResult};

pub const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";

fn logical_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9]{1,255}$").expect("valid logical id regex"))
}

fn stack_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9-]{0,127}$").expect("valid stack name regex")
    })
}

/// Check a resource/output logical ID.
pub fn validate_logical_id(id: &str) -> IacResult<()> {
    if logical_id_pattern().is_match(id) {
        Ok(())
    } else {
        Err(IacError::InvalidLogicalId(id.to_string()))
    }
}

/// Check a CloudFormation stack name.
pub fn validate_stack_name(name: &str) -> IacResult<()> {
    if stack_name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(IacError::InvalidStackName(name.to_string()))
    }
}

/// Build a PascalCase logical ID from construct-style path parts.
///
/// `logical_id(&["prod-vpc", "public", "subnet1"])` yields `ProdVpcPublicSubnet1`.
pub fn logical_id(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|part| part.split(|c: char| !c.is_ascii_alphanumeric()))
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// Export name used for an output shared across stacks.
pub fn export_name(stack: &str, output: &str) -> String {
    format!("{}:{}", stack, output)
}

/// A single CloudFormation resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    #[serde(rename = "Type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,
}

impl Resource {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            properties: Map::new(),
            depends_on: Vec::new(),
            deletion_policy: None,
        }
    }

    /// Set a property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, logical_id: impl Into<String>) -> Self {
        self.depends_on.push(logical_id.into());
        self
    }

    pub fn retain(mut self) -> Self {
        self.deletion_policy = Some("Retain".to_string());
        self
    }

    /// Look up a property by name.
    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Look up a nested property by path, e.g. `&["HealthCheckPath"]`.
    pub fn prop_path(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.properties.get(*first)?;
        for key in rest {
            current = current.get(*key)?;
        }
        Some(current)
    }
}

/// Export block of an output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Export {
    pub name: String,
}

/// A stack output, optionally exported for cross-stack import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<Export>,
}

/// A CloudFormation template document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: String,
    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "Resources", default)]
    pub resources: BTreeMap<String, Resource>,
    #[serde(rename = "Outputs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
}

impl Default for Template {
    fn default() -> Self {
        Self {
            format_version: TEMPLATE_FORMAT_VERSION.to_string(),
            description: None,
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }
}

impl Template {
    /// All resources of the given CloudFormation type.
    pub fn resources_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Resource)> + 'a {
        self.resources
            .iter()
            .filter(move |(_, r)| r.resource_type == resource_type)
    }

    /// Count resources of the given type.
    pub fn count_of_type(&self, resource_type: &str) -> usize {
        self.resources_of_type(resource_type).count()
    }

    /// Every export name declared in this template.
    pub fn export_names(&self) -> Vec<&str> {
        self.outputs
            .values()
            .filter_map(|o| o.export.as_ref().map(|e| e.name.as_str()))
            .collect()
    }

    /// Every `Fn::ImportValue` export name referenced from resources or outputs.
    pub fn import_names(&self) -> Vec<String> {
        let mut found = Vec::new();
        for resource in self.resources.values() {
            for value in resource.properties.values() {
                crate::intrinsic::collect_imports(value, &mut found);
            }
        }
        for output in self.outputs.values() {
            crate::intrinsic::collect_imports(&output.value, &mut found);
        }
        found.sort();
        found.dedup();
        found
    }

    pub fn to_json(&self) -> IacResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_yaml(&self) -> IacResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_json(content: &str) -> IacResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_yaml(content: &str) -> IacResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}

/// A named stack: its template plus the stacks it imports from.
#[derive(Debug, Clone)]
pub struct Stack {
    name: String,
    template: Template,
    dependencies: Vec<String>,
}

impl Stack {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> IacResult<Self> {
        let name = name.into();
        validate_stack_name(&name)?;
        let template = Template {
            description: Some(description.into()),
            ..Template::default()
        };
        Ok(Self {
            name,
            template,
            dependencies: Vec::new(),
        })
    }

    /// Rebuild a stack from a template read back from disk.
    pub fn from_parts(
        name: impl Into<String>,
        template: Template,
        dependencies: Vec<String>,
    ) -> IacResult<Self> {
        let name = name.into();
        validate_stack_name(&name)?;
        Ok(Self {
            name,
            template,
            dependencies,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Record that this stack imports outputs of `stack`.
    pub fn add_dependency(&mut self, stack: impl Into<String>) {
        let stack = stack.into();
        if !self.dependencies.contains(&stack) {
            self.dependencies.push(stack);
        }
    }

    /// Add a resource under a unique logical ID.
    pub fn add_resource(&mut self, logical_id: impl Into<String>, resource: Resource) -> IacResult<()> {
        let logical_id = logical_id.into();
        validate_logical_id(&logical_id)?;
        if self.template.resources.contains_key(&logical_id) {
            return Err(IacError::DuplicateResource {
                stack: self.name.clone(),
                logical_id,
            });
        }
        debug!(stack = %self.name, %logical_id, resource_type = %resource.resource_type, "Adding resource");
        self.template.resources.insert(logical_id, resource);
        Ok(())
    }

    /// Add a plain output.
    pub fn add_output(
        &mut self,
        name: impl Into<String>,
        value: Value,
        description: Option<&str>,
    ) -> IacResult<()> {
        self.insert_output(name.into(), value, description, false)
            .map(|_| ())
    }

    /// Add an output exported as `{stack}:{name}`; returns the export name.
    pub fn export(
        &mut self,
        name: impl Into<String>,
        value: Value,
        description: Option<&str>,
    ) -> IacResult<String> {
        let name = name.into();
        self.insert_output(name, value, description, true)
            .map(|export| export.unwrap_or_default())
    }

    fn insert_output(
        &mut self,
        name: String,
        value: Value,
        description: Option<&str>,
        exported: bool,
    ) -> IacResult<Option<String>> {
        validate_logical_id(&name)?;
        if self.template.outputs.contains_key(&name) {
            return Err(IacError::DuplicateOutput {
                stack: self.name.clone(),
                name,
            });
        }
        let export = exported.then(|| export_name(&self.name, &name));
        self.template.outputs.insert(
            name,
            Output {
                value,
                description: description.map(str::to_string),
                export: export.clone().map(|name| Export { name }),
            },
        );
        Ok(export)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_logical_id_pascal_case() {
        assert_eq!(logical_id(&["prod-vpc", "public", "subnet1"]), "ProdVpcPublicSubnet1");
        assert_eq!(logical_id(&["test-ecs-cluster"]), "TestEcsCluster");
    }

    #[test]
    fn test_invalid_logical_id_rejected() {
        assert!(validate_logical_id("My-Bucket").is_err());
        assert!(validate_logical_id("").is_err());
        assert!(validate_logical_id("MyBucket1").is_ok());
    }

    #[test]
    fn test_stack_name_validation() {
        assert!(validate_stack_name("prod-app-stack").is_ok());
        assert!(validate_stack_name("1stack").is_err());
        assert!(validate_stack_name("my_stack").is_err());
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let mut stack = Stack::new("ecr-stack", "test").unwrap();
        stack.add_resource("Repo", Resource::new("AWS::ECR::Repository")).unwrap();
        let err = stack
            .add_resource("Repo", Resource::new("AWS::ECR::Repository"))
            .unwrap_err();
        assert!(matches!(err, IacError::DuplicateResource { .. }));
    }

    #[test]
    fn test_export_name_format() {
        let mut stack = Stack::new("ecr-stack", "test").unwrap();
        let name = stack
            .export("RepositoryUri", json!("uri"), None)
            .unwrap();
        assert_eq!(name, "ecr-stack:RepositoryUri");
        assert_eq!(stack.template().export_names(), vec!["ecr-stack:RepositoryUri"]);
    }

    #[test]
    fn test_template_serializes_cloudformation_layout() {
        let mut stack = Stack::new("ecr-stack", "Registry").unwrap();
        stack
            .add_resource(
                "Repo",
                Resource::new("AWS::ECR::Repository").property("RepositoryName", "my-app"),
            )
            .unwrap();
        let value: Value = serde_json::from_str(&stack.template().to_json().unwrap()).unwrap();
        assert_eq!(value["AWSTemplateFormatVersion"], "2010-09-09");
        assert_eq!(value["Resources"]["Repo"]["Type"], "AWS::ECR::Repository");
        assert_eq!(value["Resources"]["Repo"]["Properties"]["RepositoryName"], "my-app");
        assert!(value.get("Outputs").is_none());
    }
}
