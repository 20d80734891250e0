//! CloudFormation intrinsic function builders.
//!
//! Every helper returns a `serde_json::Value` so it can be dropped straight
//! into a resource property map.

use serde_json::{json, Value};

/// `{ "Ref": logical_id }`
pub fn reference(logical_id: &str) -> Value {
    json!({ "Ref": logical_id })
}

/// `{ "Fn::GetAtt": [logical_id, attribute] }`
pub fn get_att(logical_id: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [logical_id, attribute] })
}

/// `{ "Fn::ImportValue": export_name }`
pub fn import_value(export_name: &str) -> Value {
    json!({ "Fn::ImportValue": export_name })
}

/// `{ "Fn::Sub": template }`
pub fn sub(template: &str) -> Value {
    json!({ "Fn::Sub": template })
}

/// `{ "Fn::Join": [separator, parts] }`
pub fn join(separator: &str, parts: Vec<Value>) -> Value {
    json!({ "Fn::Join": [separator, parts] })
}

/// `{ "Fn::Select": [index, list] }`
pub fn select(index: usize, list: Value) -> Value {
    json!({ "Fn::Select": [index.to_string(), list] })
}

/// `{ "Fn::GetAZs": "" }` (availability zones of the deployment region)
pub fn get_azs() -> Value {
    json!({ "Fn::GetAZs": "" })
}

/// Return the export name referenced by an `Fn::ImportValue`, if `value` is one.
pub fn as_import(value: &Value) -> Option<&str> {
    value.get("Fn::ImportValue").and_then(Value::as_str)
}

/// Return the logical ID targeted by a `Ref`, if `value` is one.
pub fn as_ref(value: &Value) -> Option<&str> {
    value.get("Ref").and_then(Value::as_str)
}

/// Walk a value tree and collect every `Fn::ImportValue` export name.
pub fn collect_imports(value: &Value, found: &mut Vec<String>) {
    if let Some(name) = as_import(value) {
        found.push(name.to_string());
        return;
    }
    match value {
        Value::Object(map) => map.values().for_each(|v| collect_imports(v, found)),
        Value::Array(items) => items.iter().for_each(|v| collect_imports(v, found)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_att_layout() {
        assert_eq!(
            get_att("Repo", "Arn"),
            json!({ "Fn::GetAtt": ["Repo", "Arn"] })
        );
    }

    #[test]
    fn test_collect_imports_nested() {
        let value = json!({
            "Image": import_value("ecr-stack:RepositoryUri"),
            "Listeners": [import_value("prod-app-stack:BlueListenerArn"), "literal"],
            "Cluster": reference("Cluster"),
        });
        let mut found = Vec::new();
        collect_imports(&value, &mut found);
        found.sort();
        assert_eq!(
            found,
            vec!["ecr-stack:RepositoryUri", "prod-app-stack:BlueListenerArn"]
        );
    }

    #[test]
    fn test_as_ref() {
        assert_eq!(as_ref(&reference("Vpc")), Some("Vpc"));
        assert_eq!(as_ref(&json!("Vpc")), None);
    }
}
