//! Error types for template generation and deployment.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for IaC operations.
pub type IacResult<T> = Result<T, IacError>;

/// Errors that can occur while generating or deploying stacks.
#[derive(Error, Debug)]
pub enum IacError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid logical ID '{0}': must be 1-255 alphanumeric characters")]
    InvalidLogicalId(String),

    #[error("Invalid stack name '{0}': must start with a letter and contain only letters, digits and hyphens")]
    InvalidStackName(String),

    #[error("Duplicate resource '{logical_id}' in stack {stack}")]
    DuplicateResource { stack: String, logical_id: String },

    #[error("Duplicate output '{name}' in stack {stack}")]
    DuplicateOutput { stack: String, name: String },

    #[error("Stack not found: {0}")]
    StackNotFound(String),

    #[error("Cross-stack link failed: {0}")]
    LinkFailed(String),

    #[error("Manifest not found at path: {0}")]
    ManifestNotFound(PathBuf),

    #[error("Deploy of stack {stack} failed: {message}")]
    DeployFailed { stack: String, message: String },

    #[error("AWS CLI not available: {0}")]
    CliNotAvailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}
