//! Application composition and cloud assembly output.
//!
//! [`CloudApp::synth`] builds the stacks in dependency order (registry, test,
//! production, pipeline) and links them. The resulting [`Assembly`] can be
//! written to a directory as one template per stack plus `manifest.json`,
//! and read back for validation or deployment.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::WorkshopConfig;
use crate::environment::{EnvironmentStack, TopologyKind};
use crate::error::{IacError, IacResult};
use crate::linker::{LinkReport, StackLinker};
use crate::pipeline::PipelineStack;
use crate::registry::RegistryStack;
use crate::template::{Stack, Template};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: &str = "1.0";

/// Template serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateFormat {
    #[default]
    Json,
    Yaml,
}

impl TemplateFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }
}

impl std::fmt::Display for TemplateFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// What a stack is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StackRole {
    Registry,
    Environment { environment: String, blue_green: bool },
    Pipeline,
}

/// A synthesized stack with its role.
#[derive(Debug, Clone)]
pub struct AssemblyStack {
    pub role: StackRole,
    pub stack: Stack,
}

/// Manifest entry for one stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub stack_name: String,
    pub template_file: String,
    pub role: StackRole,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// `manifest.json` of a written assembly. Stacks are listed in deployment order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub generated_at: DateTime<Utc>,
    pub format: TemplateFormat,
    pub stacks: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn read(dir: &Path) -> IacResult<Self> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(IacError::ManifestNotFound(path));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn entry(&self, stack_name: &str) -> Option<&ManifestEntry> {
        self.stacks.iter().find(|e| e.stack_name == stack_name)
    }
}

/// The set of synthesized stacks, in deployment order.
#[derive(Debug, Clone)]
pub struct Assembly {
    stacks: Vec<AssemblyStack>,
}

impl Assembly {
    pub fn new(stacks: Vec<AssemblyStack>) -> Self {
        Self { stacks }
    }

    pub fn stacks(&self) -> &[AssemblyStack] {
        &self.stacks
    }

    pub fn stack_names(&self) -> Vec<&str> {
        self.stacks.iter().map(|s| s.stack.name()).collect()
    }

    pub fn stack(&self, name: &str) -> Option<&AssemblyStack> {
        self.stacks.iter().find(|s| s.stack.name() == name)
    }

    /// The first stack with a matching role.
    pub fn find<F>(&self, predicate: F) -> Option<&AssemblyStack>
    where
        F: Fn(&StackRole) -> bool,
    {
        self.stacks.iter().find(|s| predicate(&s.role))
    }

    pub fn registry(&self) -> Option<&AssemblyStack> {
        self.find(|role| *role == StackRole::Registry)
    }

    pub fn pipeline(&self) -> Option<&AssemblyStack> {
        self.find(|role| *role == StackRole::Pipeline)
    }

    pub fn environments(&self) -> impl Iterator<Item = &AssemblyStack> {
        self.stacks
            .iter()
            .filter(|s| matches!(s.role, StackRole::Environment { .. }))
    }

    /// Resolve every cross-stack import.
    pub fn link(&self) -> LinkReport {
        StackLinker::link(
            self.stacks
                .iter()
                .map(|s| (s.stack.name(), s.stack.template())),
        )
    }

    /// Write templates and the manifest to `dir`.
    pub fn write_to(&self, dir: &Path, format: TemplateFormat) -> IacResult<Manifest> {
        fs::create_dir_all(dir)?;
        info!("Writing {} stacks to {:?}", self.stacks.len(), dir);

        let mut entries = Vec::with_capacity(self.stacks.len());
        for entry in &self.stacks {
            let template = entry.stack.template();
            let file_name = format!("{}.template.{}", entry.stack.name(), format.extension());
            let content = match format {
                TemplateFormat::Json => template.to_json()?,
                TemplateFormat::Yaml => template.to_yaml()?,
            };
            fs::write(dir.join(&file_name), content)?;
            debug!("Wrote {}", file_name);

            entries.push(ManifestEntry {
                stack_name: entry.stack.name().to_string(),
                template_file: file_name,
                role: entry.role.clone(),
                dependencies: entry.stack.dependencies().to_vec(),
            });
        }

        let manifest = Manifest {
            version: MANIFEST_VERSION.to_string(),
            generated_at: Utc::now(),
            format,
            stacks: entries,
        };
        fs::write(dir.join(MANIFEST_FILE), serde_json::to_string_pretty(&manifest)?)?;
        Ok(manifest)
    }

    /// Read an assembly previously written with [`Assembly::write_to`].
    pub fn load(dir: &Path) -> IacResult<(Manifest, Self)> {
        let manifest = Manifest::read(dir)?;
        let mut stacks = Vec::with_capacity(manifest.stacks.len());
        for entry in &manifest.stacks {
            let content = fs::read_to_string(dir.join(&entry.template_file))?;
            let template = match manifest.format {
                TemplateFormat::Json => Template::from_json(&content)?,
                TemplateFormat::Yaml => Template::from_yaml(&content)?,
            };
            let stack = Stack::from_parts(&entry.stack_name, template, entry.dependencies.clone())?;
            stacks.push(AssemblyStack {
                role: entry.role.clone(),
                stack,
            });
        }
        Ok((manifest, Self { stacks }))
    }
}

/// Entry point that composes all stacks.
pub struct CloudApp;

impl CloudApp {
    /// Build every stack from `config` and link them.
    pub fn synth(config: &WorkshopConfig) -> IacResult<Assembly> {
        config.validate()?;

        let registry = RegistryStack::build(&config.registry)?;
        let registry_ref = registry.reference().clone();

        let test = EnvironmentStack::build(&config.test_environment, &registry_ref, config)?;
        let prod = EnvironmentStack::build(&config.production_environment, &registry_ref, config)?;
        let pipeline = PipelineStack::build(&registry_ref, &test, &prod, config)?;

        let assembly = Assembly::new(vec![
            AssemblyStack {
                role: StackRole::Registry,
                stack: registry.into_stack(),
            },
            environment_entry(test),
            environment_entry(prod),
            AssemblyStack {
                role: StackRole::Pipeline,
                stack: pipeline.into_stack(),
            },
        ]);

        assembly.link().into_result()?;
        info!("Synthesized stacks: {}", assembly.stack_names().join(", "));
        Ok(assembly)
    }
}

fn environment_entry(env: EnvironmentStack) -> AssemblyStack {
    let role = StackRole::Environment {
        environment: env.environment().to_string(),
        blue_green: env.topology().kind() == TopologyKind::BlueGreen,
    };
    AssemblyStack {
        role,
        stack: env.into_stack(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_synth_order() {
        let assembly = CloudApp::synth(&WorkshopConfig::default()).unwrap();
        assert_eq!(
            assembly.stack_names(),
            vec!["ecr-stack", "test-app-stack", "prod-app-stack", "pipeline-stack"]
        );
    }

    #[test]
    fn test_synth_rejects_invalid_config() {
        let config = WorkshopConfig::default().with_environments("prod", "prod");
        assert!(matches!(
            CloudApp::synth(&config),
            Err(IacError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_write_and_load_roundtrip_preserves_roles() {
        let dir = tempdir().unwrap();
        let assembly = CloudApp::synth(&WorkshopConfig::default()).unwrap();

        let manifest = assembly.write_to(dir.path(), TemplateFormat::Yaml).unwrap();
        assert!(dir.path().join("prod-app-stack.template.yaml").exists());
        assert!(dir.path().join(MANIFEST_FILE).exists());

        let (read_back, loaded) = Assembly::load(dir.path()).unwrap();
        assert_eq!(read_back, manifest);
        assert_eq!(loaded.stack_names(), assembly.stack_names());
        assert_eq!(
            loaded.stack("prod-app-stack").unwrap().role,
            StackRole::Environment {
                environment: "prod".to_string(),
                blue_green: true
            }
        );
    }

    #[test]
    fn test_load_without_manifest_fails() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Assembly::load(dir.path()),
            Err(IacError::ManifestNotFound(_))
        ));
    }
}
