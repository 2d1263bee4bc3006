//! Staging bucket for cluster templates.

use std::sync::Arc;

use tracing::debug;

use crate::aws::{Partition, S3Client};
use crate::error::AwsClientError;

/// Object storage location where templates are staged before stack calls.
#[derive(Clone)]
pub struct S3Bucket {
    client: Arc<dyn S3Client>,
    name: String,
    region: String,
    artifact_directory: String,
}

impl S3Bucket {
    pub fn new(
        client: Arc<dyn S3Client>,
        name: impl Into<String>,
        region: impl Into<String>,
        artifact_directory: impl Into<String>,
    ) -> Self {
        Self {
            client,
            name: name.into(),
            region: region.into(),
            artifact_directory: artifact_directory.into(),
        }
    }

    /// Bucket name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding this cluster's artifacts.
    #[must_use]
    pub fn artifact_directory(&self) -> &str {
        &self.artifact_directory
    }

    fn partition(&self) -> Partition {
        Partition::from_region(&self.region)
    }

    /// Object key of a template.
    #[must_use]
    pub fn template_key(&self, template_name: &str) -> String {
        format!("{}/templates/{template_name}", self.artifact_directory)
    }

    /// URL the orchestration service reads a staged template from.
    #[must_use]
    pub fn get_cfn_template_url(&self, template_name: &str) -> String {
        format!(
            "https://{}.s3.{}.amazonaws.com{}/{}",
            self.name,
            self.region,
            self.partition().domain_suffix(),
            self.template_key(template_name)
        )
    }

    /// Upload a template body.
    ///
    /// # Errors
    /// Returns the client error of the upload.
    pub async fn upload_cfn_template(
        &self,
        body: String,
        template_name: &str,
    ) -> Result<(), AwsClientError> {
        let key = self.template_key(template_name);
        debug!(bucket = %self.name, key = %key, "Staging template");
        self.client.put_object(&self.name, &key, body).await
    }
}

impl std::fmt::Debug for S3Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Bucket")
            .field("name", &self.name)
            .field("region", &self.region)
            .field("artifact_directory", &self.artifact_directory)
            .finish_non_exhaustive()
    }
}
