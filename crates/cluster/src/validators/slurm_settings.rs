//! Validators for custom Slurm settings.
//!
//! Slurm parameter names are case-insensitive. Names are lowercased once when
//! checked against the deny lists, which are stored lowercase.

use std::collections::BTreeSet;

use super::{FailureLevel, ValidationFailure, Validator};
use crate::config::CustomSlurmSettings;

const SLURM_CONF_GLOBAL_DENY_LIST: &[&str] = &[
    "communicationparameters",
    "epilog",
    "grestypes",
    "launchparameters",
    "prolog",
    "reconfigflags",
    "resumefailprogram",
    "resumeprogram",
    "resumetimeout",
    "slurmctldhost",
    "slurmctldlogfile",
    "slurmctldparameters",
    "slurmdlogfile",
    "slurmuser",
    "suspendexcnodes",
    "suspendprogram",
    "suspendtime",
    "taskplugin",
    "treewidth",
];

const SLURM_CONF_ACCOUNTING_DENY_LIST: &[&str] = &[
    "accountingstoragetype",
    "accountingstoragehost",
    "accountingstorageport",
    "accountingstorageuser",
    "jobacctgathertype",
];

const QUEUE_GLOBAL_DENY_LIST: &[&str] =
    &["nodes", "partitionname", "resumetimeout", "state", "suspendtime"];

const COMPUTE_RESOURCE_GLOBAL_DENY_LIST: &[&str] = &[
    "cpus",
    "features",
    "gres",
    "nodeaddr",
    "nodehostname",
    "nodename",
    "state",
];

/// Node name fragments reserved for nodes managed by the cluster daemons.
const RESERVED_NODE_NAME_PATTERNS: [&str; 2] = ["-st-", "-dy-"];

/// Scope where custom settings are defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomSlurmSettingLevel {
    SlurmConf,
    Queue,
    ComputeResource,
}

impl std::fmt::Display for CustomSlurmSettingLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SlurmConf => write!(f, "SlurmConf"),
            Self::Queue => write!(f, "Queue"),
            Self::ComputeResource => write!(f, "ComputeResource"),
        }
    }
}

/// Context a deny list applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomSlurmSettingContext {
    Global,
    Accounting,
}

impl CustomSlurmSettingLevel {
    /// Denied parameter names for a context, lowercase.
    #[must_use]
    pub fn deny_list(self, context: CustomSlurmSettingContext) -> &'static [&'static str] {
        match (self, context) {
            (Self::SlurmConf, CustomSlurmSettingContext::Global) => SLURM_CONF_GLOBAL_DENY_LIST,
            (Self::SlurmConf, CustomSlurmSettingContext::Accounting) => {
                SLURM_CONF_ACCOUNTING_DENY_LIST
            }
            (Self::Queue, CustomSlurmSettingContext::Global) => QUEUE_GLOBAL_DENY_LIST,
            (Self::ComputeResource, CustomSlurmSettingContext::Global) => {
                COMPUTE_RESOURCE_GLOBAL_DENY_LIST
            }
            (Self::Queue | Self::ComputeResource, CustomSlurmSettingContext::Accounting) => &[],
        }
    }

    /// Whether a parameter name may not be overridden at this level.
    #[must_use]
    pub fn is_denied(self, setting: &str) -> bool {
        let normalized = setting.to_lowercase();
        [
            CustomSlurmSettingContext::Global,
            CustomSlurmSettingContext::Accounting,
        ]
        .into_iter()
        .any(|context| self.deny_list(context).contains(&normalized.as_str()))
    }
}

/// Rejects settings that collide with parameters managed by the cluster.
pub struct CustomSlurmSettingsValidator<'a> {
    custom_settings: &'a [CustomSlurmSettings],
    level: CustomSlurmSettingLevel,
}

impl<'a> CustomSlurmSettingsValidator<'a> {
    #[must_use]
    pub fn new(custom_settings: &'a [CustomSlurmSettings], level: CustomSlurmSettingLevel) -> Self {
        Self {
            custom_settings,
            level,
        }
    }
}

impl Validator for CustomSlurmSettingsValidator<'_> {
    fn name(&self) -> &'static str {
        "CustomSlurmSettingsValidator"
    }

    fn validate(&self) -> Vec<ValidationFailure> {
        let denied: BTreeSet<&str> = self
            .custom_settings
            .iter()
            .flat_map(|settings| settings.keys())
            .filter(|key| self.level.is_denied(key))
            .map(String::as_str)
            .collect();

        if denied.is_empty() {
            return Vec::new();
        }

        let settings = denied.into_iter().collect::<Vec<_>>().join(",");
        vec![self.failure(
            FailureLevel::Error,
            format!(
                "Using the following custom Slurm settings at {} level is not allowed: {settings}",
                self.level
            ),
        )]
    }
}

/// Rejects custom node names using fragments reserved for managed nodes.
pub struct CustomSlurmNodeNamesValidator<'a> {
    custom_settings: &'a [CustomSlurmSettings],
}

impl<'a> CustomSlurmNodeNamesValidator<'a> {
    #[must_use]
    pub fn new(custom_settings: &'a [CustomSlurmSettings]) -> Self {
        Self { custom_settings }
    }
}

impl Validator for CustomSlurmNodeNamesValidator<'_> {
    fn name(&self) -> &'static str {
        "CustomSlurmNodeNamesValidator"
    }

    fn validate(&self) -> Vec<ValidationFailure> {
        // Every spelling of `NodeName` in the same entry is checked.
        let mut bad_nodelists: Vec<String> = self
            .custom_settings
            .iter()
            .flat_map(|settings| settings.iter())
            .filter(|(key, _)| key.eq_ignore_ascii_case("nodename"))
            .filter_map(|(_, value)| scalar_to_string(value))
            .filter(|name| {
                RESERVED_NODE_NAME_PATTERNS
                    .iter()
                    .any(|pattern| name.contains(pattern))
            })
            .collect();

        if bad_nodelists.is_empty() {
            return Vec::new();
        }

        bad_nodelists.sort();
        vec![self.failure(
            FailureLevel::Error,
            format!(
                "Substrings '-st-' and '-dy-' in node names are reserved for nodes managed by \
                 the cluster. Please rename the following custom Slurm nodes: {}",
                bad_nodelists.join(", ")
            ),
        )]
    }
}

/// Rejects inline custom settings combined with an include file.
pub struct CustomSlurmSettingsIncludeFileOnlyValidator<'a> {
    custom_settings: &'a [CustomSlurmSettings],
    include_file_url: Option<&'a str>,
}

impl<'a> CustomSlurmSettingsIncludeFileOnlyValidator<'a> {
    #[must_use]
    pub fn new(custom_settings: &'a [CustomSlurmSettings], include_file_url: Option<&'a str>) -> Self {
        Self {
            custom_settings,
            include_file_url,
        }
    }
}

impl Validator for CustomSlurmSettingsIncludeFileOnlyValidator<'_> {
    fn name(&self) -> &'static str {
        "CustomSlurmSettingsIncludeFileOnlyValidator"
    }

    fn validate(&self) -> Vec<ValidationFailure> {
        let has_include_file = self.include_file_url.is_some_and(|url| !url.is_empty());
        if self.custom_settings.is_empty() || !has_include_file {
            return Vec::new();
        }
        vec![self.failure(
            FailureLevel::Error,
            "CustomSlurmSettings and CustomSlurmSettingsIncludeFile cannot be used together \
             under SlurmSettings."
                .to_string(),
        )]
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
