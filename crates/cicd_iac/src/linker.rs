//! Cross-stack linking.
//!
//! Stacks never hold references to each other's resources. A producer
//! exports an output under `{stack}:{output}` and a consumer imports it by
//! that name. The linker resolves every import against the exports of the
//! stacks deployed before the consumer.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::{IacError, IacResult};
use crate::template::Template;

/// One resolved import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossStackLink {
    pub consumer: String,
    pub producer: String,
    pub export: String,
}

/// Result of linking a set of stacks.
#[derive(Debug, Default)]
pub struct LinkReport {
    /// Export name to producing stack.
    pub exports: BTreeMap<String, String>,
    pub links: Vec<CrossStackLink>,
    pub errors: Vec<String>,
}

impl LinkReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Stacks `consumer` imports from.
    pub fn producers_of(&self, consumer: &str) -> BTreeSet<&str> {
        self.links
            .iter()
            .filter(|l| l.consumer == consumer)
            .map(|l| l.producer.as_str())
            .collect()
    }

    /// Imports `consumer` makes from `producer`.
    pub fn imports_between(&self, consumer: &str, producer: &str) -> Vec<&str> {
        self.links
            .iter()
            .filter(|l| l.consumer == consumer && l.producer == producer)
            .map(|l| l.export.as_str())
            .collect()
    }

    pub fn into_result(self) -> IacResult<Vec<CrossStackLink>> {
        if self.errors.is_empty() {
            Ok(self.links)
        } else {
            Err(IacError::LinkFailed(self.errors.join("; ")))
        }
    }
}

/// Resolves imports against exports, in deployment order.
pub struct StackLinker;

impl StackLinker {
    /// Link stacks given in deployment order.
    pub fn link<'a, I>(stacks: I) -> LinkReport
    where
        I: IntoIterator<Item = (&'a str, &'a Template)>,
    {
        let stacks: Vec<(&str, &Template)> = stacks.into_iter().collect();
        let mut report = LinkReport::default();

        // Every export, with the position of the stack that declares it.
        let mut positions: BTreeMap<&str, usize> = BTreeMap::new();
        for (index, (name, template)) in stacks.iter().enumerate() {
            for export in template.export_names() {
                if let Some(existing) = report.exports.get(export) {
                    report.errors.push(format!(
                        "export '{}' declared by both {} and {}",
                        export, existing, name
                    ));
                    continue;
                }
                report.exports.insert(export.to_string(), name.to_string());
                positions.insert(export, index);
            }
        }

        for (index, (name, template)) in stacks.iter().enumerate() {
            for import in template.import_names() {
                let Some(producer) = report.exports.get(&import).cloned() else {
                    report
                        .errors
                        .push(format!("{} imports '{}' which no stack exports", name, import));
                    continue;
                };
                if producer == *name {
                    report
                        .errors
                        .push(format!("{} imports its own export '{}'", name, import));
                    continue;
                }
                if positions.get(import.as_str()).is_some_and(|&p| p > index) {
                    report.errors.push(format!(
                        "{} imports '{}' from {}, which is deployed later",
                        name, import, producer
                    ));
                    continue;
                }
                debug!(consumer = %name, %producer, export = %import, "Linked import");
                report.links.push(CrossStackLink {
                    consumer: name.to_string(),
                    producer,
                    export: import,
                });
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intrinsic;
    use crate::template::{Resource, Stack};
    use serde_json::json;

    fn producer() -> Stack {
        let mut stack = Stack::new("ecr-stack", "p").unwrap();
        stack
            .add_resource("Repo", Resource::new("AWS::ECR::Repository"))
            .unwrap();
        stack
            .export("RepositoryUri", intrinsic::get_att("Repo", "RepositoryUri"), None)
            .unwrap();
        stack
    }

    fn consumer(export: &str) -> Stack {
        let mut stack = Stack::new("test-app-stack", "c").unwrap();
        stack
            .add_resource(
                "TaskDef",
                Resource::new("AWS::ECS::TaskDefinition")
                    .property("ContainerDefinitions", json!([{ "Image": intrinsic::import_value(export) }])),
            )
            .unwrap();
        stack
    }

    #[test]
    fn test_link_resolves_import() {
        let p = producer();
        let c = consumer("ecr-stack:RepositoryUri");
        let report = StackLinker::link([(p.name(), p.template()), (c.name(), c.template())]);

        assert!(report.is_ok(), "{:?}", report.errors);
        assert_eq!(report.producers_of("test-app-stack").into_iter().collect::<Vec<_>>(), vec!["ecr-stack"]);
    }

    #[test]
    fn test_dangling_import_reported() {
        let p = producer();
        let c = consumer("ecr-stack:RepositoryArn");
        let report = StackLinker::link([(p.name(), p.template()), (c.name(), c.template())]);

        assert!(!report.is_ok());
        assert!(report.errors[0].contains("no stack exports"));
    }

    #[test]
    fn test_import_from_later_stack_reported() {
        let p = producer();
        let c = consumer("ecr-stack:RepositoryUri");
        let report = StackLinker::link([(c.name(), c.template()), (p.name(), p.template())]);

        assert!(report.errors.iter().any(|e| e.contains("deployed later")));
        assert!(report.into_result().is_err());
    }
}
