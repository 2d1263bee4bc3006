//! Configuration validators.

pub mod slurm_settings;

use serde::Serialize;

/// Severity of a validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum FailureLevel {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for FailureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// A single finding reported by a validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    pub level: FailureLevel,
    pub message: String,
    /// Name of the validator that reported it.
    pub validator: &'static str,
}

/// A check over part of the configuration.
pub trait Validator {
    /// Name reported with each failure.
    fn name(&self) -> &'static str;

    /// Run the check.
    fn validate(&self) -> Vec<ValidationFailure>;

    /// Build a failure attributed to this validator.
    fn failure(&self, level: FailureLevel, message: String) -> ValidationFailure {
        ValidationFailure {
            level,
            message,
            validator: self.name(),
        }
    }
}

/// Whether any failure blocks the operation.
#[must_use]
pub fn has_errors(failures: &[ValidationFailure]) -> bool {
    failures.iter().any(|f| f.level == FailureLevel::Error)
}
