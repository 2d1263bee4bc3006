//! Cluster configuration types.
//!
//! The cluster document is YAML with PascalCase keys. Runtime settings for the
//! controller (polling, staging bucket) come from the command line.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aws::Tag;
use crate::error::ConfigError;
use crate::validators::slurm_settings::{
    CustomSlurmNodeNamesValidator, CustomSlurmSettingLevel, CustomSlurmSettingsIncludeFileOnlyValidator,
    CustomSlurmSettingsValidator,
};
use crate::validators::{ValidationFailure, Validator};

/// Region used when neither the command line nor the configuration names one.
pub const DEFAULT_REGION: &str = "us-east-1";

/// One entry of a `CustomSlurmSettings` list.
pub type CustomSlurmSettings = BTreeMap<String, serde_yaml::Value>;

/// What happens to a resource when the cluster is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DeletionPolicy {
    #[default]
    Retain,
    Delete,
}

/// Full cluster configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterConfig {
    /// Region the cluster lives in.
    #[serde(default)]
    pub region: Option<String>,
    /// User tags applied to the stack.
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Scheduler configuration.
    #[serde(default)]
    pub scheduling: Scheduling,
    /// Monitoring configuration.
    #[serde(default)]
    pub monitoring: Monitoring,
}

/// Scheduler section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Scheduling {
    /// Scheduler name.
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    /// Cluster-wide Slurm settings.
    #[serde(default)]
    pub slurm_settings: SlurmSettings,
    /// Slurm partitions.
    #[serde(default)]
    pub slurm_queues: Vec<SlurmQueue>,
}

impl Default for Scheduling {
    fn default() -> Self {
        Self {
            scheduler: default_scheduler(),
            slurm_settings: SlurmSettings::default(),
            slurm_queues: Vec::new(),
        }
    }
}

fn default_scheduler() -> String {
    "slurm".to_string()
}

/// Cluster-wide Slurm settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct SlurmSettings {
    /// Extra `slurm.conf` parameters.
    #[serde(default)]
    pub custom_slurm_settings: Vec<CustomSlurmSettings>,
    /// URL of a file included into `slurm.conf`.
    #[serde(default)]
    pub custom_slurm_settings_include_file: Option<String>,
}

/// A Slurm partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SlurmQueue {
    pub name: String,
    #[serde(default)]
    pub custom_slurm_settings: Vec<CustomSlurmSettings>,
    #[serde(default)]
    pub compute_resources: Vec<ComputeResource>,
}

/// Compute resource of a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComputeResource {
    pub name: String,
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub custom_slurm_settings: Vec<CustomSlurmSettings>,
}

/// Monitoring section.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Monitoring {
    #[serde(default)]
    pub logs: Logs,
}

/// Log settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Logs {
    #[serde(default)]
    pub cloud_watch: CloudWatchLogs,
}

/// CloudWatch log settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct CloudWatchLogs {
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
}

impl ClusterConfig {
    /// Parse a configuration document.
    ///
    /// # Errors
    /// Returns an error if the YAML does not match the schema.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Region to operate in: an explicit one wins over the configuration's,
    /// which wins over [`DEFAULT_REGION`].
    #[must_use]
    pub fn resolve_region(explicit: Option<&str>, config: Option<&Self>) -> String {
        explicit
            .or_else(|| config.and_then(|c| c.region.as_deref()))
            .unwrap_or(DEFAULT_REGION)
            .to_string()
    }

    /// Whether log groups are kept when the cluster is deleted.
    #[must_use]
    pub fn keep_logs_on_delete(&self) -> bool {
        self.monitoring.logs.cloud_watch.deletion_policy == DeletionPolicy::Retain
    }

    /// Run every configuration validator.
    #[must_use]
    pub fn validate(&self) -> Vec<ValidationFailure> {
        let slurm = &self.scheduling.slurm_settings;
        let mut validators: Vec<Box<dyn Validator + '_>> = vec![
            Box::new(CustomSlurmSettingsValidator::new(
                &slurm.custom_slurm_settings,
                CustomSlurmSettingLevel::SlurmConf,
            )),
            Box::new(CustomSlurmNodeNamesValidator::new(&slurm.custom_slurm_settings)),
            Box::new(CustomSlurmSettingsIncludeFileOnlyValidator::new(
                &slurm.custom_slurm_settings,
                slurm.custom_slurm_settings_include_file.as_deref(),
            )),
        ];

        for queue in &self.scheduling.slurm_queues {
            validators.push(Box::new(CustomSlurmSettingsValidator::new(
                &queue.custom_slurm_settings,
                CustomSlurmSettingLevel::Queue,
            )));
            for resource in &queue.compute_resources {
                validators.push(Box::new(CustomSlurmSettingsValidator::new(
                    &resource.custom_slurm_settings,
                    CustomSlurmSettingLevel::ComputeResource,
                )));
            }
        }

        validators.iter().flat_map(|v| v.validate()).collect()
    }
}

/// Polling behavior while waiting on stack operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between two status checks.
    pub interval: Duration,
    /// Maximum number of status checks; `None` polls until the stack settles.
    pub max_polls: Option<u32>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_polls: None,
        }
    }
}

/// Location of the template staging bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSettings {
    /// Bucket name.
    pub name: String,
    /// Bucket region.
    pub region: String,
}
