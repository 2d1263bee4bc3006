//! Narrow cloud API traits consumed by the cluster controller.
//!
//! Production code uses [`super::Aws`]; tests swap in the generated mocks.

use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use super::models::{CreateStackRequest, Ec2Instance, Filter, StackDescription};
use crate::error::AwsClientError;

/// CloudFormation operations.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CfnClient: Send + Sync {
    /// Describe a single stack by name.
    async fn describe_stack(&self, stack_name: &str) -> Result<StackDescription, AwsClientError>;

    /// Fetch the raw template body of a deployed stack.
    ///
    /// Returns `None` when the service sends no body.
    async fn get_stack_template(&self, stack_name: &str)
        -> Result<Option<String>, AwsClientError>;

    /// Create a stack from a staged template, returning the stack id.
    async fn create_stack_from_url(
        &self,
        request: CreateStackRequest,
    ) -> Result<String, AwsClientError>;

    /// Update a stack from a staged template, returning the stack id.
    async fn update_stack_from_url(
        &self,
        stack_name: &str,
        template_url: &str,
    ) -> Result<String, AwsClientError>;

    /// Delete a stack.
    async fn delete_stack(&self, stack_name: &str) -> Result<(), AwsClientError>;
}

/// EC2 operations.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Ec2Client: Send + Sync {
    /// Describe instances matching every filter.
    async fn describe_instances(
        &self,
        filters: Vec<Filter>,
    ) -> Result<Vec<Ec2Instance>, AwsClientError>;

    /// Terminate the given instances.
    async fn terminate_instances(&self, instance_ids: Vec<String>) -> Result<(), AwsClientError>;
}

/// Object storage operations.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait S3Client: Send + Sync {
    /// Upload an object body.
    async fn put_object(&self, bucket: &str, key: &str, body: String)
        -> Result<(), AwsClientError>;
}

/// Bundle of the clients the controller talks to.
#[derive(Clone)]
pub struct AwsApi {
    pub cfn: Arc<dyn CfnClient>,
    pub ec2: Arc<dyn Ec2Client>,
    pub s3: Arc<dyn S3Client>,
}

impl AwsApi {
    pub fn new(
        cfn: Arc<dyn CfnClient>,
        ec2: Arc<dyn Ec2Client>,
        s3: Arc<dyn S3Client>,
    ) -> Self {
        Self { cfn, ec2, s3 }
    }

    /// Use one client for every service.
    pub fn from_client<C>(client: C) -> Self
    where
        C: CfnClient + Ec2Client + S3Client + 'static,
    {
        let client = Arc::new(client);
        Self {
            cfn: client.clone(),
            ec2: client.clone(),
            s3: client,
        }
    }
}
