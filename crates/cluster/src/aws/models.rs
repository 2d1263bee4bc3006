//! AWS API request and response models.

use serde::{Deserialize, Serialize};

use crate::models::stack::StackStatus;

// ============================================================================
// Common types
// ============================================================================

/// Tag, in the `{Key, Value}` wire format shared by EC2 and CloudFormation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag key.
    #[serde(rename = "Key")]
    pub key: String,
    /// Tag value.
    #[serde(rename = "Value")]
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Equality filter for describe calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    /// Filter name (e.g. `tag:Name`, `instance-state-name`).
    pub name: String,
    /// Accepted values.
    pub values: Vec<String>,
}

impl Filter {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Filter on a tag value.
    pub fn tag(key: &str, value: impl Into<String>) -> Self {
        Self::new(format!("tag:{key}"), [value.into()])
    }
}

/// Error body returned by query APIs.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "Error")]
    pub error: ErrorDetail,
}

/// Error detail.
#[derive(Debug, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "Code")]
    pub code: Option<String>,
    #[serde(rename = "Message")]
    pub message: String,
}

// ============================================================================
// CloudFormation types
// ============================================================================

/// A live stack as returned by `DescribeStacks`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StackDescription {
    #[serde(rename = "StackName")]
    pub stack_name: String,
    #[serde(rename = "StackId", default)]
    pub stack_id: Option<String>,
    #[serde(rename = "StackStatus")]
    pub stack_status: StackStatus,
    #[serde(rename = "StackStatusReason", default)]
    pub stack_status_reason: Option<String>,
    #[serde(rename = "CreationTime", default)]
    pub creation_time: Option<String>,
    #[serde(rename = "LastUpdatedTime", default)]
    pub last_updated_time: Option<String>,
    #[serde(rename = "Tags", default)]
    pub tags: Vec<Tag>,
}

impl StackDescription {
    /// Minimal description of a stack that has not been described yet.
    pub fn new(stack_name: impl Into<String>, stack_status: StackStatus) -> Self {
        Self {
            stack_name: stack_name.into(),
            stack_id: None,
            stack_status,
            stack_status_reason: None,
            creation_time: None,
            last_updated_time: None,
            tags: Vec::new(),
        }
    }

    /// Value of a stack tag.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

/// `DescribeStacks` response envelope.
#[derive(Debug, Deserialize)]
pub struct DescribeStacksEnvelope {
    #[serde(rename = "DescribeStacksResponse")]
    pub response: DescribeStacksResponse,
}

#[derive(Debug, Deserialize)]
pub struct DescribeStacksResponse {
    #[serde(rename = "DescribeStacksResult")]
    pub result: DescribeStacksResult,
}

#[derive(Debug, Deserialize)]
pub struct DescribeStacksResult {
    #[serde(rename = "Stacks", default)]
    pub stacks: Vec<StackDescription>,
}

/// `GetTemplate` response envelope.
#[derive(Debug, Deserialize)]
pub struct GetTemplateEnvelope {
    #[serde(rename = "GetTemplateResponse")]
    pub response: GetTemplateResponse,
}

#[derive(Debug, Deserialize)]
pub struct GetTemplateResponse {
    #[serde(rename = "GetTemplateResult")]
    pub result: GetTemplateResult,
}

#[derive(Debug, Deserialize)]
pub struct GetTemplateResult {
    #[serde(rename = "TemplateBody")]
    pub template_body: Option<String>,
}

/// `CreateStack` response envelope.
#[derive(Debug, Deserialize)]
pub struct CreateStackEnvelope {
    #[serde(rename = "CreateStackResponse")]
    pub response: CreateStackResponse,
}

#[derive(Debug, Deserialize)]
pub struct CreateStackResponse {
    #[serde(rename = "CreateStackResult")]
    pub result: StackIdResult,
}

/// `UpdateStack` response envelope.
#[derive(Debug, Deserialize)]
pub struct UpdateStackEnvelope {
    #[serde(rename = "UpdateStackResponse")]
    pub response: UpdateStackResponse,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStackResponse {
    #[serde(rename = "UpdateStackResult")]
    pub result: StackIdResult,
}

#[derive(Debug, Deserialize)]
pub struct StackIdResult {
    #[serde(rename = "StackId")]
    pub stack_id: String,
}

/// Create stack request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateStackRequest {
    /// Stack name.
    pub stack_name: String,
    /// URL of the staged template.
    pub template_url: String,
    /// Stack tags.
    pub tags: Vec<Tag>,
    /// Acknowledged IAM capabilities.
    pub capabilities: Vec<String>,
    /// Keep resources of a failed creation for troubleshooting.
    pub disable_rollback: bool,
}

// ============================================================================
// EC2 (Instance) types
// ============================================================================

/// EC2 instance information.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Ec2Instance {
    /// Instance ID.
    #[serde(rename = "InstanceId")]
    pub instance_id: String,
    /// Instance type.
    #[serde(rename = "InstanceType", default)]
    pub instance_type: String,
    /// Instance state.
    #[serde(rename = "State")]
    pub state: InstanceState,
    /// Public IP address.
    #[serde(rename = "PublicIpAddress", default)]
    pub public_ip_address: Option<String>,
    /// Private IP address.
    #[serde(rename = "PrivateIpAddress", default)]
    pub private_ip_address: Option<String>,
    /// Launch time.
    #[serde(rename = "LaunchTime", default)]
    pub launch_time: Option<String>,
    /// Tags.
    #[serde(rename = "Tags", default)]
    pub tags: Vec<Tag>,
}

/// Instance state.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstanceState {
    /// State code.
    #[serde(rename = "Code")]
    pub code: i32,
    /// State name.
    #[serde(rename = "Name")]
    pub name: String,
}

/// Describe instances response.
#[derive(Debug, Deserialize)]
pub struct DescribeInstancesResponse {
    /// Reservations.
    #[serde(rename = "Reservations", default)]
    pub reservations: Vec<Reservation>,
}

/// Reservation.
#[derive(Debug, Deserialize)]
pub struct Reservation {
    /// Instances.
    #[serde(rename = "Instances", default)]
    pub instances: Vec<Ec2Instance>,
}

/// AWS partition a region belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Aws,
    AwsCn,
    AwsUsGov,
}

impl Partition {
    /// Partition of a region name.
    #[must_use]
    pub fn from_region(region: &str) -> Self {
        if region.starts_with("cn-") {
            Self::AwsCn
        } else if region.starts_with("us-gov-") {
            Self::AwsUsGov
        } else {
            Self::Aws
        }
    }

    /// Suffix appended to `amazonaws.com` in service endpoints.
    #[must_use]
    pub fn domain_suffix(self) -> &'static str {
        match self {
            Self::AwsCn => ".cn",
            Self::Aws | Self::AwsUsGov => "",
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aws => write!(f, "aws"),
            Self::AwsCn => write!(f, "aws-cn"),
            Self::AwsUsGov => write!(f, "aws-us-gov"),
        }
    }
}
