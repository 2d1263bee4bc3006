//! Error types for cluster operations.

use thiserror::Error;

/// Failure reported by a cloud API call.
///
/// Carries the name of the client function that failed so that re-wrapped
/// errors still point at the original call site.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AwsClientError {
    /// Client function that produced the error.
    pub function_name: String,
    /// Human readable message.
    pub message: String,
    /// Error code returned by the service, if any.
    pub code: Option<String>,
}

impl AwsClientError {
    /// Create a new client error.
    pub fn new(function_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            message: message.into(),
            code: None,
        }
    }

    /// Attach the service error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Whether the error says the stack has nothing to update.
    #[must_use]
    pub fn is_no_update(&self) -> bool {
        self.message
            .to_lowercase()
            .contains("no updates are to be performed")
    }

    /// Whether the error says the stack is gone.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.message.to_lowercase().contains("does not exist")
    }
}

/// Domain failure raised by the cluster lifecycle controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ClusterActionError {
    /// Message naming the affected stack and the cause.
    pub message: String,
}

impl ClusterActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Lookup failures on a stack template.
///
/// Always raised before any mutating API call is made.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// An expected key is absent from the template.
    #[error("missing key '{0}' in stack template")]
    MissingKey(String),

    /// A resource definition is not a mapping.
    #[error("resource '{0}' is not a mapping")]
    InvalidResource(String),

    /// The template body could not be parsed.
    #[error("unable to parse template body: {0}")]
    Parse(String),
}

/// Errors loading the cluster configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file is not valid YAML for this schema.
    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Failures reading benchmark inputs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BenchmarkError {
    /// A reference results row is malformed.
    #[error("invalid reference results at line {line}: {reason}")]
    Reference { line: usize, reason: String },

    /// The `lscpu` output lacks an expected field.
    #[error("missing '{0}' in lscpu output")]
    MissingField(&'static str),

    /// A field of the `lscpu` output could not be parsed.
    #[error("invalid value '{value}' for '{field}' in lscpu output")]
    InvalidField { field: &'static str, value: String },
}

/// Crate-level error.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    AwsClient(#[from] AwsClientError),

    #[error(transparent)]
    ClusterAction(#[from] ClusterActionError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Benchmark(#[from] BenchmarkError),
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
