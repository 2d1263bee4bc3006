//! AWS API client implementation.
//!
//! This client speaks the query protocol with JSON responses. Requests are not
//! SigV4-signed here; deployments run it behind a signing proxy or against a
//! local endpoint set with [`Aws::with_endpoint`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::models::{
    CreateStackEnvelope, CreateStackRequest, DescribeInstancesResponse, DescribeStacksEnvelope,
    Ec2Instance, ErrorResponse, Filter, GetTemplateEnvelope, Partition, StackDescription, Tag,
    UpdateStackEnvelope,
};
use super::traits::{CfnClient, Ec2Client, S3Client};
use crate::error::AwsClientError;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// CloudFormation API version.
const CFN_API_VERSION: &str = "2010-05-15";

/// EC2 API version.
const EC2_API_VERSION: &str = "2016-11-15";

/// AWS API client for CloudFormation, EC2 and S3.
#[derive(Clone)]
pub struct Aws {
    /// HTTP client.
    client: Client,
    /// AWS access key ID.
    access_key_id: Option<String>,
    /// AWS region.
    region: String,
    /// Endpoint override shared by every service.
    endpoint: Option<String>,
}

type Params = Vec<(String, String)>;

impl Aws {
    /// Create a new AWS client for a region.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(region: impl Into<String>) -> Result<Self, AwsClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| AwsClientError::new("new", e.to_string()))?;

        Ok(Self {
            client,
            access_key_id: None,
            region: region.into(),
            endpoint: None,
        })
    }

    /// Set the access key id sent with each request.
    #[must_use]
    pub fn with_access_key(mut self, access_key_id: impl Into<String>) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self
    }

    /// Send every request to `endpoint` instead of the regional service endpoints.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    fn service_endpoint(&self, service: &str) -> String {
        self.endpoint.clone().unwrap_or_else(|| {
            format!(
                "https://{service}.{}.amazonaws.com{}",
                self.region,
                Partition::from_region(&self.region).domain_suffix()
            )
        })
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("{endpoint}/{bucket}/{key}"),
            None => format!(
                "https://{bucket}.s3.{}.amazonaws.com{}/{key}",
                self.region,
                Partition::from_region(&self.region).domain_suffix()
            ),
        }
    }

    /// Execute a query API call and return the raw response body.
    async fn query(
        &self,
        function_name: &str,
        service: &str,
        params: &Params,
    ) -> Result<String, AwsClientError> {
        let url = self.service_endpoint(service);
        debug!(url = %url, function = function_name, "AWS request");

        let mut request = self
            .client
            .request(Method::POST, &url)
            .header("Accept", "application/json")
            .header(
                "X-Amz-Date",
                chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string(),
            )
            .form(params);

        if let Some(key) = &self.access_key_id {
            request = request.header("X-Amz-Access-Key-Id", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AwsClientError::new(function_name, e.to_string()))?;
        Self::handle_response(function_name, response).await
    }

    async fn query_json<T: DeserializeOwned>(
        &self,
        function_name: &str,
        service: &str,
        params: &Params,
    ) -> Result<T, AwsClientError> {
        let text = self.query(function_name, service, params).await?;
        serde_json::from_str(&text).map_err(|e| {
            warn!(error = %e, body = %text, "Failed to parse response");
            AwsClientError::new(function_name, format!("Failed to parse response: {e}"))
        })
    }

    /// Map non-success responses into client errors.
    async fn handle_response(
        function_name: &str,
        response: reqwest::Response,
    ) -> Result<String, AwsClientError> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AwsClientError::new(function_name, e.to_string()))?;

        if status.is_success() {
            return Ok(text);
        }

        if let Ok(body) = serde_json::from_str::<ErrorResponse>(&text) {
            let err = AwsClientError::new(function_name, body.error.message);
            return Err(match body.error.code {
                Some(code) => err.with_code(code),
                None => err,
            });
        }

        let message = match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => format!("Access denied: {text}"),
            _ => format!("{} - {text}", status.as_u16()),
        };
        Err(AwsClientError::new(function_name, message))
    }

    fn cfn_params(action: &str) -> Params {
        vec![
            ("Action".to_string(), action.to_string()),
            ("Version".to_string(), CFN_API_VERSION.to_string()),
        ]
    }

    fn ec2_params(action: &str) -> Params {
        vec![
            ("Action".to_string(), action.to_string()),
            ("Version".to_string(), EC2_API_VERSION.to_string()),
        ]
    }

    /// Encode filters as `Filter.N.Name` / `Filter.N.Value.M`.
    fn filter_params(filters: &[Filter]) -> Params {
        let mut params = Vec::new();
        for (i, filter) in filters.iter().enumerate() {
            let n = i + 1;
            params.push((format!("Filter.{n}.Name"), filter.name.clone()));
            for (j, value) in filter.values.iter().enumerate() {
                params.push((format!("Filter.{n}.Value.{}", j + 1), value.clone()));
            }
        }
        params
    }

    /// Encode tags as `Tags.member.N.Key` / `Tags.member.N.Value`.
    fn tag_params(tags: &[Tag]) -> Params {
        let mut params = Vec::new();
        for (i, tag) in tags.iter().enumerate() {
            let n = i + 1;
            params.push((format!("Tags.member.{n}.Key"), tag.key.clone()));
            params.push((format!("Tags.member.{n}.Value"), tag.value.clone()));
        }
        params
    }
}

#[async_trait]
impl CfnClient for Aws {
    async fn describe_stack(&self, stack_name: &str) -> Result<StackDescription, AwsClientError> {
        let mut params = Self::cfn_params("DescribeStacks");
        params.push(("StackName".to_string(), stack_name.to_string()));

        let envelope: DescribeStacksEnvelope = self
            .query_json("describe_stack", "cloudformation", &params)
            .await?;

        envelope
            .response
            .result
            .stacks
            .into_iter()
            .next()
            .ok_or_else(|| {
                AwsClientError::new(
                    "describe_stack",
                    format!("Stack with id {stack_name} does not exist"),
                )
            })
    }

    async fn get_stack_template(
        &self,
        stack_name: &str,
    ) -> Result<Option<String>, AwsClientError> {
        let mut params = Self::cfn_params("GetTemplate");
        params.push(("StackName".to_string(), stack_name.to_string()));

        let envelope: GetTemplateEnvelope = self
            .query_json("get_stack_template", "cloudformation", &params)
            .await?;
        Ok(envelope.response.result.template_body)
    }

    async fn create_stack_from_url(
        &self,
        request: CreateStackRequest,
    ) -> Result<String, AwsClientError> {
        info!(stack_name = %request.stack_name, "Creating stack");

        let mut params = Self::cfn_params("CreateStack");
        params.push(("StackName".to_string(), request.stack_name.clone()));
        params.push(("TemplateURL".to_string(), request.template_url.clone()));
        params.push((
            "DisableRollback".to_string(),
            request.disable_rollback.to_string(),
        ));
        for (i, capability) in request.capabilities.iter().enumerate() {
            params.push((format!("Capabilities.member.{}", i + 1), capability.clone()));
        }
        params.extend(Self::tag_params(&request.tags));

        let envelope: CreateStackEnvelope = self
            .query_json("create_stack_from_url", "cloudformation", &params)
            .await?;
        Ok(envelope.response.result.stack_id)
    }

    async fn update_stack_from_url(
        &self,
        stack_name: &str,
        template_url: &str,
    ) -> Result<String, AwsClientError> {
        info!(stack_name = %stack_name, "Updating stack");

        let mut params = Self::cfn_params("UpdateStack");
        params.push(("StackName".to_string(), stack_name.to_string()));
        params.push(("TemplateURL".to_string(), template_url.to_string()));
        params.push((
            "Capabilities.member.1".to_string(),
            "CAPABILITY_IAM".to_string(),
        ));
        params.push((
            "Capabilities.member.2".to_string(),
            "CAPABILITY_NAMED_IAM".to_string(),
        ));

        let envelope: UpdateStackEnvelope = self
            .query_json("update_stack_from_url", "cloudformation", &params)
            .await?;
        Ok(envelope.response.result.stack_id)
    }

    async fn delete_stack(&self, stack_name: &str) -> Result<(), AwsClientError> {
        info!(stack_name = %stack_name, "Deleting stack");

        let mut params = Self::cfn_params("DeleteStack");
        params.push(("StackName".to_string(), stack_name.to_string()));

        self.query("delete_stack", "cloudformation", &params).await?;
        Ok(())
    }
}

#[async_trait]
impl Ec2Client for Aws {
    async fn describe_instances(
        &self,
        filters: Vec<Filter>,
    ) -> Result<Vec<Ec2Instance>, AwsClientError> {
        let mut params = Self::ec2_params("DescribeInstances");
        params.extend(Self::filter_params(&filters));

        let response: DescribeInstancesResponse = self
            .query_json("describe_instances", "ec2", &params)
            .await?;

        Ok(response
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .collect())
    }

    async fn terminate_instances(&self, instance_ids: Vec<String>) -> Result<(), AwsClientError> {
        info!(count = instance_ids.len(), "Terminating instances");

        let mut params = Self::ec2_params("TerminateInstances");
        for (i, id) in instance_ids.iter().enumerate() {
            params.push((format!("InstanceId.{}", i + 1), id.clone()));
        }

        self.query("terminate_instances", "ec2", &params).await?;
        Ok(())
    }
}

#[async_trait]
impl S3Client for Aws {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: String,
    ) -> Result<(), AwsClientError> {
        let url = self.object_url(bucket, key);
        debug!(url = %url, "Uploading object");

        let response = self
            .client
            .put(&url)
            .body(body)
            .send()
            .await
            .map_err(|e| AwsClientError::new("put_object", e.to_string()))?;
        Self::handle_response("put_object", response).await?;
        Ok(())
    }
}
