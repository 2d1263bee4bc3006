//! Stack status model and the cached view of a cluster stack.

use std::convert::Infallible;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::aws::StackDescription;
use crate::constants::{CLUSTER_DIR_TAG, VERSION_TAG};

macro_rules! stack_statuses {
    ($($variant:ident => $wire:literal,)+) => {
        /// Status of a CloudFormation stack.
        ///
        /// Unknown wire values are kept verbatim in [`StackStatus::Other`].
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum StackStatus {
            $($variant,)+
            Other(String),
        }

        impl StackStatus {
            /// Wire representation.
            #[must_use]
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $wire,)+
                    Self::Other(s) => s,
                }
            }
        }

        impl From<String> for StackStatus {
            fn from(s: String) -> Self {
                match s.as_str() {
                    $($wire => Self::$variant,)+
                    _ => Self::Other(s),
                }
            }
        }
    };
}

stack_statuses! {
    CreateInProgress => "CREATE_IN_PROGRESS",
    CreateFailed => "CREATE_FAILED",
    CreateComplete => "CREATE_COMPLETE",
    RollbackInProgress => "ROLLBACK_IN_PROGRESS",
    RollbackFailed => "ROLLBACK_FAILED",
    RollbackComplete => "ROLLBACK_COMPLETE",
    DeleteInProgress => "DELETE_IN_PROGRESS",
    DeleteFailed => "DELETE_FAILED",
    DeleteComplete => "DELETE_COMPLETE",
    UpdateInProgress => "UPDATE_IN_PROGRESS",
    UpdateCompleteCleanupInProgress => "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
    UpdateComplete => "UPDATE_COMPLETE",
    UpdateFailed => "UPDATE_FAILED",
    UpdateRollbackInProgress => "UPDATE_ROLLBACK_IN_PROGRESS",
    UpdateRollbackFailed => "UPDATE_ROLLBACK_FAILED",
    UpdateRollbackCompleteCleanupInProgress => "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS",
    UpdateRollbackComplete => "UPDATE_ROLLBACK_COMPLETE",
    ReviewInProgress => "REVIEW_IN_PROGRESS",
    ImportInProgress => "IMPORT_IN_PROGRESS",
    ImportComplete => "IMPORT_COMPLETE",
    ImportRollbackInProgress => "IMPORT_ROLLBACK_IN_PROGRESS",
    ImportRollbackFailed => "IMPORT_ROLLBACK_FAILED",
    ImportRollbackComplete => "IMPORT_ROLLBACK_COMPLETE",
}

impl StackStatus {
    /// Whether no stack operation is running anymore.
    ///
    /// Every status is terminal unless it ends with `_IN_PROGRESS`, so
    /// `UPDATE_COMPLETE_CLEANUP_IN_PROGRESS` is not terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.as_str().ends_with("_IN_PROGRESS")
    }
}

impl FromStr for StackStatus {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_string()))
    }
}

impl From<StackStatus> for String {
    fn from(status: StackStatus) -> Self {
        status.as_str().to_string()
    }
}

impl std::fmt::Display for StackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Asynchronous stack operation being waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOperation {
    Create,
    Update,
    Delete,
}

impl StackOperation {
    /// Whether polling must continue while the stack reports `status`.
    #[must_use]
    pub fn is_pending(self, status: &StackStatus) -> bool {
        match self {
            Self::Create => matches!(status, StackStatus::CreateInProgress),
            Self::Update => matches!(
                status,
                StackStatus::UpdateInProgress | StackStatus::UpdateCompleteCleanupInProgress
            ),
            Self::Delete => matches!(status, StackStatus::DeleteInProgress),
        }
    }
}

impl std::fmt::Display for StackOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Cached view of the stack backing a cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterStack {
    description: StackDescription,
}

impl ClusterStack {
    #[must_use]
    pub fn new(description: StackDescription) -> Self {
        Self { description }
    }

    /// Stack name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.description.stack_name
    }

    /// Last known status.
    #[must_use]
    pub fn status(&self) -> &StackStatus {
        &self.description.stack_status
    }

    /// Last known description.
    #[must_use]
    pub fn description(&self) -> &StackDescription {
        &self.description
    }

    /// Controller version that last tagged the stack.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.description.tag(VERSION_TAG)
    }

    /// Artifact directory recorded at creation.
    #[must_use]
    pub fn cluster_dir(&self) -> Option<&str> {
        self.description.tag(CLUSTER_DIR_TAG)
    }

    /// Replace the cached description.
    pub fn refresh(&mut self, description: StackDescription) {
        self.description = description;
    }
}
