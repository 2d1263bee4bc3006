//! Cluster lifecycle controller.
//!
//! A [`Cluster`] drives the CloudFormation stack that backs it: creation,
//! template updates, status polling, log retention and teardown. Every call is
//! awaited in sequence and the controller assumes exclusive access to its
//! stack for the duration of an operation.

use tracing::{debug, error, info, warn};

use super::s3_bucket::S3Bucket;
use super::stack::{ClusterStack, StackOperation, StackStatus};
use super::tags::TagSet;
use super::template::StackTemplate;
use crate::aws::{AwsApi, CreateStackRequest, Ec2Instance, Filter, StackDescription, Tag};
use crate::config::{BucketSettings, ClusterConfig, PollConfig};
use crate::constants::{
    installed_version, ALIVE_INSTANCE_STATES, APPLICATION_TAG, CLUSTER_DIR_TAG, NODE_TYPE_TAG,
    TEMPLATE_NAME, TERMINATE_BATCH_SIZE,
};
use crate::error::{AwsClientError, ClusterActionError, Result};
use crate::validators::has_errors;

/// Role of an instance within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    HeadNode,
    Compute,
}

impl NodeType {
    /// Value of the node type tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeadNode => "HeadNode",
            Self::Compute => "Compute",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "headnode" | "head" => Ok(Self::HeadNode),
            "compute" => Ok(Self::Compute),
            _ => Err(format!("Unknown node type: {s}. Supported: HeadNode, Compute")),
        }
    }
}

/// Snapshot returned by [`Cluster::describe`].
#[derive(Debug, Clone)]
pub struct ClusterDescription {
    pub name: String,
    pub stack_name: String,
    pub status: StackStatus,
    pub status_reason: Option<String>,
    /// Whether no stack operation is running.
    pub settled: bool,
    pub version: Option<String>,
    pub creation_time: Option<String>,
    pub last_updated_time: Option<String>,
    pub head_node: Option<Ec2Instance>,
    pub compute_node_count: usize,
}

/// Default artifact directory of a cluster without a recorded one.
#[must_use]
pub fn default_cluster_dir(cluster_name: &str) -> String {
    format!("hpc-cluster/clusters/{cluster_name}")
}

/// Lifecycle controller for one cluster.
pub struct Cluster {
    name: String,
    stack: ClusterStack,
    config: Option<ClusterConfig>,
    tags: TagSet,
    api: AwsApi,
    bucket: S3Bucket,
    poll: PollConfig,
}

impl Cluster {
    /// Controller for a cluster whose stack is already known.
    pub fn new(name: impl Into<String>, stack: ClusterStack, api: AwsApi, bucket: S3Bucket) -> Self {
        let tags = stack.description().tags.iter().cloned().collect();
        Self {
            name: name.into(),
            stack,
            config: None,
            tags,
            api,
            bucket,
            poll: PollConfig::default(),
        }
    }

    /// Controller for a cluster that does not exist yet.
    ///
    /// A fresh artifact directory is generated for its staged templates.
    pub fn for_creation(
        name: impl Into<String>,
        config: ClusterConfig,
        api: AwsApi,
        settings: &BucketSettings,
    ) -> Self {
        let name = name.into();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let cluster_dir = format!(
            "hpc-cluster/{}/clusters/{name}-{}",
            installed_version(),
            &suffix[..16]
        );
        let bucket = S3Bucket::new(api.s3.clone(), &settings.name, &settings.region, cluster_dir);
        let stack = ClusterStack::new(StackDescription::new(
            &name,
            StackStatus::Other("NOT_CREATED".to_string()),
        ));
        Self::new(name, stack, api, bucket).with_config(config)
    }

    /// Controller for an existing cluster, read from its live stack.
    ///
    /// # Errors
    /// Returns the client error if the stack cannot be described.
    pub async fn load(
        name: impl Into<String>,
        api: AwsApi,
        settings: &BucketSettings,
    ) -> Result<Self> {
        let name = name.into();
        let description = api.cfn.describe_stack(&name).await?;
        let stack = ClusterStack::new(description);
        let cluster_dir = stack
            .cluster_dir()
            .map_or_else(|| default_cluster_dir(&name), str::to_string);
        let bucket = S3Bucket::new(api.s3.clone(), &settings.name, &settings.region, cluster_dir);

        debug!(cluster = %name, status = %stack.status(), "Loaded cluster stack");
        Ok(Self::new(name, stack, api, bucket))
    }

    /// Attach the desired configuration; its tags replace the current ones.
    #[must_use]
    pub fn with_config(mut self, config: ClusterConfig) -> Self {
        let mut tags: TagSet = config.tags.iter().cloned().collect();
        if let Some(dir) = self.tags.get(CLUSTER_DIR_TAG) {
            tags.insert(CLUSTER_DIR_TAG, dir);
        }
        self.tags = tags;
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Cluster name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the backing stack.
    #[must_use]
    pub fn stack_name(&self) -> &str {
        self.stack.name()
    }

    /// Cached stack view.
    #[must_use]
    pub fn stack(&self) -> &ClusterStack {
        &self.stack
    }

    /// Current tag set.
    #[must_use]
    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    /// Desired configuration, if attached.
    #[must_use]
    pub fn config(&self) -> Option<&ClusterConfig> {
        self.config.as_ref()
    }

    /// Staging bucket.
    #[must_use]
    pub fn bucket(&self) -> &S3Bucket {
        &self.bucket
    }

    // ========================================================================
    // Instances
    // ========================================================================

    /// Alive instances of this cluster with the given node type.
    ///
    /// # Errors
    /// Returns the client error of the describe call.
    pub async fn describe_instances(&self, node_type: NodeType) -> Result<Vec<Ec2Instance>> {
        let filters = vec![
            Filter::tag(APPLICATION_TAG, &self.name),
            Filter::new("instance-state-name", ALIVE_INSTANCE_STATES),
            Filter::tag(NODE_TYPE_TAG, node_type.as_str()),
        ];
        Ok(self.api.ec2.describe_instances(filters).await?)
    }

    /// Terminate every alive compute node, returning how many were submitted.
    ///
    /// Failures are logged and never returned.
    pub async fn terminate_nodes(&self) -> usize {
        info!(cluster = %self.name, "Terminating cluster compute instances");

        let instances = match self.describe_instances(NodeType::Compute).await {
            Ok(instances) => instances,
            Err(e) => {
                error!(cluster = %self.name, error = %e, "Failed to list compute instances");
                return 0;
            }
        };

        let ids: Vec<String> = instances.into_iter().map(|i| i.instance_id).collect();
        let mut terminated = 0;
        for batch in ids.chunks(TERMINATE_BATCH_SIZE) {
            match self.api.ec2.terminate_instances(batch.to_vec()).await {
                Ok(()) => terminated += batch.len(),
                Err(e) => error!(
                    cluster = %self.name,
                    error = %e,
                    "Failed when terminating instances"
                ),
            }
        }
        terminated
    }

    // ========================================================================
    // Tags
    // ========================================================================

    /// Record the installed controller version in the tag set.
    pub fn add_version_tag(&mut self) {
        self.tags.set_version(installed_version());
    }

    /// Tags in the wire format of the orchestration API, sorted by key.
    #[must_use]
    pub fn get_cfn_tags(&self) -> Vec<Tag> {
        self.tags.to_cfn_tags()
    }

    // ========================================================================
    // Stack status
    // ========================================================================

    async fn describe_status(&mut self) -> Result<StackStatus, AwsClientError> {
        let description = self.api.cfn.describe_stack(self.stack.name()).await?;
        self.stack.refresh(description);
        Ok(self.stack.status().clone())
    }

    /// Fetch the live stack status and refresh the cached stack.
    ///
    /// # Errors
    /// Returns a [`ClusterActionError`] if the status query fails.
    pub async fn get_updated_stack_status(&mut self) -> Result<StackStatus> {
        self.describe_status().await.map_err(|e| {
            ClusterActionError::new(format!(
                "Unable to retrieve status of stack {}: {e}",
                self.stack.name()
            ))
            .into()
        })
    }

    /// Poll until `operation` is no longer pending and return the final status.
    async fn wait_for_stack(&mut self, operation: StackOperation) -> Result<StackStatus> {
        let mut polls: u32 = 0;
        loop {
            let status = match self.describe_status().await {
                Ok(status) => status,
                Err(e) if operation == StackOperation::Delete && e.is_not_found() => {
                    return Ok(StackStatus::DeleteComplete);
                }
                Err(e) => {
                    return Err(ClusterActionError::new(format!(
                        "Unable to retrieve status of stack {}: {e}",
                        self.stack.name()
                    ))
                    .into());
                }
            };
            polls += 1;

            if !operation.is_pending(&status) {
                info!(stack_name = %self.stack.name(), %status, polls, "Stack {operation} settled");
                return Ok(status);
            }

            if self.poll.max_polls.is_some_and(|max| polls >= max) {
                return Err(ClusterActionError::new(format!(
                    "Timed out waiting for {operation} of stack {} after {polls} status checks, \
                     last status {status}",
                    self.stack.name()
                ))
                .into());
            }

            debug!(stack_name = %self.stack.name(), %status, polls, "Polling stack status");
            tokio::time::sleep(self.poll.interval).await;
        }
    }

    /// Wait while the stack reports `UPDATE_IN_PROGRESS` or
    /// `UPDATE_COMPLETE_CLEANUP_IN_PROGRESS`.
    ///
    /// The returned status is left to the caller to interpret; a failed update
    /// shows up as a settled failure status, not as an error.
    ///
    /// # Errors
    /// Returns a [`ClusterActionError`] if a status query fails or
    /// [`PollConfig::max_polls`] is exhausted.
    pub async fn wait_for_stack_update(&mut self) -> Result<StackStatus> {
        self.wait_for_stack(StackOperation::Update).await
    }

    /// Wait while the stack reports `CREATE_IN_PROGRESS`.
    ///
    /// # Errors
    /// See [`Cluster::wait_for_stack_update`].
    pub async fn wait_for_stack_creation(&mut self) -> Result<StackStatus> {
        self.wait_for_stack(StackOperation::Create).await
    }

    /// Wait while the stack reports `DELETE_IN_PROGRESS`; a stack that no
    /// longer exists counts as `DELETE_COMPLETE`.
    ///
    /// # Errors
    /// See [`Cluster::wait_for_stack_update`].
    pub async fn wait_for_stack_deletion(&mut self) -> Result<StackStatus> {
        self.wait_for_stack(StackOperation::Delete).await
    }

    // ========================================================================
    // Templates
    // ========================================================================

    /// Fetch the deployed template.
    ///
    /// # Errors
    /// Returns a [`ClusterActionError`] naming the stack when the call fails
    /// or the template is missing, empty or unparsable.
    pub async fn get_stack_template(&self) -> Result<StackTemplate> {
        let stack_name = self.stack.name();
        let unable = |reason: String| {
            ClusterActionError::new(format!(
                "Unable to retrieve template for stack {stack_name}. {reason}"
            ))
        };

        let body = self
            .api
            .cfn
            .get_stack_template(stack_name)
            .await
            .map_err(|e| unable(e.to_string()))?
            .ok_or_else(|| unable("Empty response".to_string()))?;

        let template = StackTemplate::parse(&body).map_err(|e| unable(e.to_string()))?;
        if template.is_empty() {
            return Err(unable("Empty template".to_string()).into());
        }
        Ok(template)
    }

    /// Stage `template` and update the stack from it.
    ///
    /// A "no updates are to be performed" answer counts as success and skips
    /// waiting, since no stack operation was started.
    ///
    /// # Errors
    /// Returns an [`AwsClientError`] naming the stack and the cause for any
    /// other failure, or the error of the wait.
    pub async fn update_stack_template(&mut self, template: &StackTemplate) -> Result<()> {
        let stack_name = self.stack.name().to_string();
        let enrich = |e: AwsClientError| {
            AwsClientError::new(
                "update_stack_template",
                format!("Unable to update stack template for stack {stack_name}: {e}"),
            )
        };

        let body = template.to_body()?;
        self.bucket
            .upload_cfn_template(body, TEMPLATE_NAME)
            .await
            .map_err(enrich)?;
        let template_url = self.bucket.get_cfn_template_url(TEMPLATE_NAME);

        match self
            .api
            .cfn
            .update_stack_from_url(&stack_name, &template_url)
            .await
        {
            Ok(stack_id) => {
                info!(stack_name = %stack_name, stack_id = %stack_id, "Stack update started");
            }
            Err(e) if e.is_no_update() => {
                info!(stack_name = %stack_name, "No updates to perform on stack");
                return Ok(());
            }
            Err(e) => return Err(enrich(e).into()),
        }

        let status = self.wait_for_stack_update().await?;
        info!(stack_name = %stack_name, %status, "Stack update finished");
        Ok(())
    }

    /// Resource keys of log groups that would be deleted with the stack.
    ///
    /// # Errors
    /// Returns the error of [`Cluster::get_stack_template`].
    pub async fn get_unretained_cw_log_group_resource_keys(&self) -> Result<Vec<String>> {
        Ok(self.get_stack_template().await?.unretained_log_group_keys())
    }

    /// Mark every unretained log group `Retain` and push the template.
    ///
    /// Does nothing when all log groups are already retained.
    ///
    /// # Errors
    /// Returns a [`ClusterActionError`] with "Unable to persist logs" when
    /// the template cannot be read or updated.
    pub async fn persist_cloudwatch_log_groups(&mut self) -> Result<()> {
        let unable = |e: &dyn std::fmt::Display| {
            ClusterActionError::new(format!(
                "Unable to persist logs on cluster deletion, failed with error: {e}"
            ))
        };

        let template = self.get_stack_template().await.map_err(|e| unable(&e))?;
        let keys = template.unretained_log_group_keys();
        if keys.is_empty() {
            debug!(stack_name = %self.stack.name(), "All log groups already retained");
            return Ok(());
        }

        info!(
            stack_name = %self.stack.name(),
            log_groups = ?keys,
            "Retaining log groups before deletion"
        );
        let retained = template.with_retained(&keys).map_err(|e| unable(&e))?;
        self.update_stack_template(&retained)
            .await
            .map_err(|e| unable(&e))?;
        Ok(())
    }

    /// Mark the given resources `Retain` and push the template.
    ///
    /// The update is always pushed, even when every key was already retained.
    ///
    /// # Errors
    /// Returns a [`crate::error::TemplateError::MissingKey`] when the template
    /// lacks `Resources` or one of the keys; nothing is uploaded in that case.
    pub async fn persist_stack_resources<I, S>(&mut self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let template = self.get_stack_template().await?;
        let retained = template.with_retained(keys)?;
        self.update_stack_template(&retained).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stage the template and create the stack, returning its id.
    ///
    /// # Errors
    /// Returns a [`ClusterActionError`] when the configuration has validation
    /// errors or a cloud call fails.
    pub async fn create(&mut self, template: &StackTemplate) -> Result<String> {
        if let Some(config) = &self.config {
            let failures = config.validate();
            if has_errors(&failures) {
                let messages: Vec<&str> = failures.iter().map(|f| f.message.as_str()).collect();
                return Err(ClusterActionError::new(format!(
                    "Configuration of cluster {} is invalid: {}",
                    self.name,
                    messages.join("; ")
                ))
                .into());
            }
        }

        let name = self.name.clone();
        let unable = |e: &dyn std::fmt::Display| {
            ClusterActionError::new(format!("Unable to create cluster {name}: {e}"))
        };

        self.add_version_tag();
        self.tags
            .insert(CLUSTER_DIR_TAG, self.bucket.artifact_directory());

        let body = template.to_body()?;
        self.bucket
            .upload_cfn_template(body, TEMPLATE_NAME)
            .await
            .map_err(|e| unable(&e))?;

        let request = CreateStackRequest {
            stack_name: self.stack.name().to_string(),
            template_url: self.bucket.get_cfn_template_url(TEMPLATE_NAME),
            tags: self.get_cfn_tags(),
            capabilities: vec![
                "CAPABILITY_IAM".to_string(),
                "CAPABILITY_NAMED_IAM".to_string(),
            ],
            disable_rollback: false,
        };
        let stack_id = self
            .api
            .cfn
            .create_stack_from_url(request)
            .await
            .map_err(|e| unable(&e))?;

        let mut description = StackDescription::new(self.stack.name(), StackStatus::CreateInProgress);
        description.stack_id = Some(stack_id.clone());
        description.tags = self.get_cfn_tags();
        self.stack.refresh(description);

        info!(cluster = %self.name, stack_id = %stack_id, "Cluster creation started");
        Ok(stack_id)
    }

    /// Push a new template, keeping every retention already set on the live
    /// stack for resources the new template still declares.
    ///
    /// # Errors
    /// See [`Cluster::get_stack_template`] and [`Cluster::update_stack_template`].
    pub async fn update(&mut self, template: &StackTemplate) -> Result<()> {
        let live = self.get_stack_template().await?;
        let merged = template.inherit_retention(&live);
        self.update_stack_template(&merged).await
    }

    /// Refresh the stack and report the cluster state.
    ///
    /// # Errors
    /// Returns an error if the stack or its instances cannot be described.
    pub async fn describe(&mut self) -> Result<ClusterDescription> {
        let status = self.get_updated_stack_status().await?;
        let head_node = self
            .describe_instances(NodeType::HeadNode)
            .await?
            .into_iter()
            .next();
        let compute_node_count = self.describe_instances(NodeType::Compute).await?.len();

        let description = self.stack.description();
        Ok(ClusterDescription {
            name: self.name.clone(),
            stack_name: description.stack_name.clone(),
            settled: status.is_terminal(),
            status,
            status_reason: description.stack_status_reason.clone(),
            version: self.stack.version().map(str::to_string),
            creation_time: description.creation_time.clone(),
            last_updated_time: description.last_updated_time.clone(),
            head_node,
            compute_node_count,
        })
    }

    /// Delete the cluster.
    ///
    /// With `keep_logs`, log groups are marked `Retain` first; a failure there
    /// aborts the deletion. Compute nodes are then terminated and the stack
    /// deleted. A stack already being deleted skips the log step.
    ///
    /// # Errors
    /// Returns a [`ClusterActionError`] if logs cannot be persisted or the
    /// stack deletion call fails.
    pub async fn delete(&mut self, keep_logs: bool) -> Result<()> {
        let already_deleting = *self.stack.status() == StackStatus::DeleteInProgress;

        if keep_logs && !already_deleting {
            self.persist_cloudwatch_log_groups().await?;
        } else if keep_logs {
            warn!(cluster = %self.name, "Stack deletion already in progress, not persisting logs");
        }

        let terminated = self.terminate_nodes().await;
        debug!(cluster = %self.name, terminated, "Compute nodes submitted for termination");

        self.api
            .cfn
            .delete_stack(self.stack.name())
            .await
            .map_err(|e| {
                ClusterActionError::new(format!(
                    "Cluster {} did not delete successfully. {e}",
                    self.name
                ))
            })?;
        let mut description = self.stack.description().clone();
        description.stack_status = StackStatus::DeleteInProgress;
        self.stack.refresh(description);

        info!(cluster = %self.name, keep_logs, "Cluster deletion started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::aws::{InstanceState, MockCfnClient, MockEc2Client, MockS3Client};
    use crate::constants::VERSION_TAG;
    use crate::error::{Error, TemplateError};

    const FAKE_CLUSTER_NAME: &str = "test-cluster";
    const FAKE_STACK_NAME: &str = "test-cluster-stack";
    const ARTIFACT_DIRECTORY: &str = "s3_artifacts_dir";
    const TEMPLATE_URL: &str =
        "https://bucket.s3.us-east-1.amazonaws.com/s3_artifacts_dir/templates/aws-hpc-cluster.cfn.yaml";

    #[derive(Default)]
    struct Mocks {
        cfn: MockCfnClient,
        ec2: MockEc2Client,
        s3: MockS3Client,
    }

    fn cluster(mocks: Mocks) -> Cluster {
        cluster_with_status(mocks, StackStatus::CreateComplete)
    }

    fn cluster_with_status(mocks: Mocks, status: StackStatus) -> Cluster {
        let api = AwsApi::new(Arc::new(mocks.cfn), Arc::new(mocks.ec2), Arc::new(mocks.s3));
        let bucket = S3Bucket::new(api.s3.clone(), "bucket", "us-east-1", ARTIFACT_DIRECTORY);
        let stack = ClusterStack::new(StackDescription::new(FAKE_STACK_NAME, status));
        Cluster::new(FAKE_CLUSTER_NAME, stack, api, bucket).with_poll_config(PollConfig {
            interval: Duration::ZERO,
            max_polls: None,
        })
    }

    fn stack(status: &str) -> StackDescription {
        StackDescription::new(FAKE_STACK_NAME, status.parse().unwrap())
    }

    fn instance(id: &str) -> Ec2Instance {
        Ec2Instance {
            instance_id: id.to_string(),
            instance_type: "c5.xlarge".to_string(),
            state: InstanceState {
                code: 16,
                name: "running".to_string(),
            },
            public_ip_address: None,
            private_ip_address: None,
            launch_time: None,
            tags: vec![],
        }
    }

    fn expect_template(cfn: &mut MockCfnClient, body: &'static str) {
        cfn.expect_get_stack_template()
            .withf(|name| name == FAKE_STACK_NAME)
            .returning(move |_| Ok(Some(body.to_string())));
    }

    fn expect_upload(s3: &mut MockS3Client, times: usize) {
        s3.expect_put_object()
            .withf(|bucket, key, _| {
                bucket == "bucket" && key == "s3_artifacts_dir/templates/aws-hpc-cluster.cfn.yaml"
            })
            .times(times)
            .returning(|_, _, _| Ok(()));
    }

    /// Expect an upload whose body has `key` retained.
    fn expect_retained_upload(s3: &mut MockS3Client, key: &'static str) {
        s3.expect_put_object()
            .withf(move |_, _, body| {
                StackTemplate::parse(body)
                    .map(|t| t.deletion_policy(key) == Some("Retain"))
                    .unwrap_or(false)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
    }

    // ------------------------------------------------------------------------
    // describe_instances
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_describe_instances() {
        let cases = [
            (NodeType::HeadNode, 1),
            (NodeType::Compute, 3),
            (NodeType::Compute, 2),
            (NodeType::Compute, 0),
        ];

        for (node_type, expected_instances) in cases {
            let mut mocks = Mocks::default();
            mocks
                .ec2
                .expect_describe_instances()
                .withf(move |filters| {
                    *filters
                        == [
                            Filter::tag(APPLICATION_TAG, FAKE_CLUSTER_NAME),
                            Filter::new(
                                "instance-state-name",
                                ["pending", "running", "stopping", "stopped"],
                            ),
                            Filter::tag(NODE_TYPE_TAG, node_type.as_str()),
                        ]
                })
                .times(1)
                .returning(move |_| {
                    Ok((0..expected_instances)
                        .map(|i| instance(&format!("i-{i}")))
                        .collect())
                });

            let instances = cluster(mocks).describe_instances(node_type).await.unwrap();
            assert_eq!(instances.len(), expected_instances);
        }
    }

    // ------------------------------------------------------------------------
    // tags
    // ------------------------------------------------------------------------

    #[test]
    fn test_tags() {
        let cases: [&[(&str, &str)]; 3] = [
            &[],
            &[("test", "testvalue")],
            &[(VERSION_TAG, "OldVersionToBeOverridden")],
        ];

        for existing in cases {
            let config = ClusterConfig {
                tags: existing.iter().map(|(k, v)| Tag::new(*k, *v)).collect(),
                ..ClusterConfig::default()
            };
            let mut cluster = cluster(Mocks::default()).with_config(config);

            let mut expected: Vec<Tag> = existing
                .iter()
                .filter(|(k, _)| *k != VERSION_TAG)
                .map(|(k, v)| Tag::new(*k, *v))
                .collect();
            expected.push(Tag::new(VERSION_TAG, installed_version()));
            expected.sort_by(|a, b| a.key.cmp(&b.key));

            cluster.add_version_tag();
            assert_eq!(cluster.tags().len(), expected.len());
            assert_eq!(cluster.get_cfn_tags(), expected);

            cluster.add_version_tag();
            assert_eq!(cluster.get_cfn_tags(), expected);
        }
    }

    // ------------------------------------------------------------------------
    // wait_for_stack_update
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_wait_for_stack_update() {
        // One status read per poll. The first settled status ends the wait, so a
        // repeated settled status in a case is never read.
        let cases: [(&[&str], usize); 4] = [
            (
                &[
                    "UPDATE_IN_PROGRESS",
                    "UPDATE_IN_PROGRESS",
                    "UPDATE_IN_PROGRESS",
                    "UPDATE_IN_PROGRESS",
                    "UPDATE_COMPLETE",
                    "UPDATE_COMPLETE",
                ],
                5,
            ),
            (
                &[
                    "UPDATE_IN_PROGRESS",
                    "UPDATE_IN_PROGRESS",
                    "UPDATE_IN_PROGRESS",
                    "UPDATE_IN_PROGRESS",
                    "anything other than UPDATE_IN_PROGRESS",
                    "anything other than UPDATE_IN_PROGRESS",
                ],
                5,
            ),
            (
                &[
                    "UPDATE_IN_PROGRESS",
                    "UPDATE_IN_PROGRESS",
                    "UPDATE_IN_PROGRESS",
                    "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
                    "UPDATE_COMPLETE",
                ],
                5,
            ),
            (&["UPDATE_COMPLETE", "UPDATE_COMPLETE"], 1),
        ];

        for (statuses, expected_polls) in cases {
            let mut mocks = Mocks::default();
            let mut replay = statuses.iter().copied();
            mocks
                .cfn
                .expect_describe_stack()
                .times(expected_polls)
                .returning(move |_| Ok(stack(replay.next().unwrap())));

            let mut cluster = cluster(mocks);
            let status = cluster.wait_for_stack_update().await.unwrap();

            assert!(!StackOperation::Update.is_pending(&status));
            assert_eq!(status.as_str(), statuses[expected_polls - 1]);
            assert_eq!(cluster.stack().status(), &status);
        }
    }

    #[tokio::test]
    async fn test_wait_for_stack_update_query_failure() {
        let mut mocks = Mocks::default();
        mocks
            .cfn
            .expect_describe_stack()
            .times(1)
            .returning(|_| Err(AwsClientError::new("describe_stack", "throttled")));

        let err = cluster(mocks).wait_for_stack_update().await.unwrap_err();
        assert!(matches!(err, Error::ClusterAction(_)));
        assert!(err.to_string().contains(FAKE_STACK_NAME));
    }

    #[tokio::test]
    async fn test_wait_for_stack_update_respects_max_polls() {
        let mut mocks = Mocks::default();
        mocks
            .cfn
            .expect_describe_stack()
            .times(3)
            .returning(|_| Ok(stack("UPDATE_IN_PROGRESS")));

        let mut cluster = cluster(mocks).with_poll_config(PollConfig {
            interval: Duration::ZERO,
            max_polls: Some(3),
        });
        let err = cluster.wait_for_stack_update().await.unwrap_err();
        assert!(err.to_string().starts_with("Timed out waiting for update of stack"));
    }

    #[tokio::test]
    async fn test_wait_for_stack_deletion_treats_missing_stack_as_deleted() {
        let mut mocks = Mocks::default();
        let mut calls = 0;
        mocks
            .cfn
            .expect_describe_stack()
            .times(2)
            .returning(move |name| {
                calls += 1;
                if calls == 1 {
                    Ok(stack("DELETE_IN_PROGRESS"))
                } else {
                    Err(AwsClientError::new(
                        "describe_stack",
                        format!("Stack with id {name} does not exist"),
                    ))
                }
            });

        let status = cluster(mocks).wait_for_stack_deletion().await.unwrap();
        assert_eq!(status, StackStatus::DeleteComplete);
    }

    #[tokio::test]
    async fn test_wait_for_stack_creation() {
        let mut mocks = Mocks::default();
        let mut replay = ["CREATE_IN_PROGRESS", "CREATE_FAILED"].into_iter();
        mocks
            .cfn
            .expect_describe_stack()
            .times(2)
            .returning(move |_| Ok(stack(replay.next().unwrap())));

        let status = cluster(mocks).wait_for_stack_creation().await.unwrap();
        assert_eq!(status, StackStatus::CreateFailed);
    }

    // ------------------------------------------------------------------------
    // get_stack_template
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_get_stack_template() {
        let mut mocks = Mocks::default();
        expect_template(&mut mocks.cfn, r#"{"TemplateKey": "TemplateValue"}"#);

        let template = cluster(mocks).get_stack_template().await.unwrap();
        assert_eq!(
            template.as_map().get("TemplateKey").and_then(|v| v.as_str()),
            Some("TemplateValue")
        );
    }

    #[tokio::test]
    async fn test_get_stack_template_failures() {
        let responses: [Result<Option<&str>, AwsClientError>; 3] = [
            Ok(Some("{}")),
            Ok(None),
            Err(AwsClientError::new("get_template", "error")),
        ];

        for response in responses {
            let mut mocks = Mocks::default();
            mocks
                .cfn
                .expect_get_stack_template()
                .times(1)
                .returning(move |_| response.clone().map(|body| body.map(str::to_string)));

            let err = cluster(mocks).get_stack_template().await.unwrap_err();
            assert!(matches!(err, Error::ClusterAction(_)));
            assert!(err
                .to_string()
                .starts_with(&format!("Unable to retrieve template for stack {FAKE_STACK_NAME}")));
        }
    }

    // ------------------------------------------------------------------------
    // update_stack_template
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_update_stack_template_waits_on_success() {
        let mut mocks = Mocks::default();
        expect_upload(&mut mocks.s3, 1);
        mocks
            .cfn
            .expect_update_stack_from_url()
            .withf(|name, url| name == FAKE_STACK_NAME && url == TEMPLATE_URL)
            .times(1)
            .returning(|_, _| Ok("stack ID".to_string()));
        mocks
            .cfn
            .expect_describe_stack()
            .times(1)
            .returning(|_| Ok(stack("UPDATE_COMPLETE")));

        let template = StackTemplate::parse(r#"{"TemplateKey": "TemplateValue"}"#).unwrap();
        cluster(mocks).update_stack_template(&template).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_stack_template_no_updates_skips_wait() {
        let messages = [
            "No UpDatES ARE TO BE PERformed",
            "some longer message also containing no updates are to be performed and more words at the end",
        ];

        for message in messages {
            let mut mocks = Mocks::default();
            expect_upload(&mut mocks.s3, 1);
            mocks
                .cfn
                .expect_update_stack_from_url()
                .times(1)
                .returning(move |_, _| Err(AwsClientError::new("update_stack_from_url", message)));
            mocks.cfn.expect_describe_stack().never();

            let template = StackTemplate::parse(r#"{"TemplateKey": "TemplateValue"}"#).unwrap();
            cluster(mocks).update_stack_template(&template).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_update_stack_template_other_error() {
        let mut mocks = Mocks::default();
        expect_upload(&mut mocks.s3, 1);
        mocks
            .cfn
            .expect_update_stack_from_url()
            .times(1)
            .returning(|_, _| {
                Err(AwsClientError::new(
                    "update_stack_from_url",
                    "some other error message",
                ))
            });
        mocks.cfn.expect_describe_stack().never();

        let template = StackTemplate::parse(r#"{"TemplateKey": "TemplateValue"}"#).unwrap();
        let err = cluster(mocks)
            .update_stack_template(&template)
            .await
            .unwrap_err();

        let Error::AwsClient(client_error) = err else {
            panic!("expected a client error, got {err:?}");
        };
        assert_eq!(client_error.function_name, "update_stack_template");
        assert_eq!(
            client_error.message,
            format!(
                "Unable to update stack template for stack {FAKE_STACK_NAME}: some other error message"
            )
        );
    }

    // ------------------------------------------------------------------------
    // delete
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_delete() {
        for keep_logs in [false, true] {
            let mut mocks = Mocks::default();
            mocks
                .cfn
                .expect_get_stack_template()
                .times(usize::from(keep_logs))
                .returning(|_| {
                    Ok(Some(
                        r#"{"Resources": {"Logs": {"Type": "AWS::Logs::LogGroup", "DeletionPolicy": "Retain"}}}"#
                            .to_string(),
                    ))
                });
            mocks.cfn.expect_update_stack_from_url().never();
            mocks
                .ec2
                .expect_describe_instances()
                .times(1)
                .returning(|_| Ok(vec![instance("i-1")]));
            mocks
                .ec2
                .expect_terminate_instances()
                .withf(|ids| *ids == ["i-1"])
                .times(1)
                .returning(|_| Ok(()));
            mocks
                .cfn
                .expect_delete_stack()
                .withf(|name| name == FAKE_STACK_NAME)
                .times(1)
                .returning(|_| Ok(()));

            let mut cluster = cluster(mocks);
            cluster.delete(keep_logs).await.unwrap();
            assert_eq!(cluster.stack().status(), &StackStatus::DeleteInProgress);
        }
    }

    #[tokio::test]
    async fn test_delete_aborts_when_logs_cannot_be_persisted() {
        let mut mocks = Mocks::default();
        expect_template(
            &mut mocks.cfn,
            r#"{"Resources": {"Logs": {"Type": "AWS::Logs::LogGroup"}}}"#,
        );
        expect_upload(&mut mocks.s3, 1);
        mocks
            .cfn
            .expect_update_stack_from_url()
            .returning(|_, _| Err(AwsClientError::new("function", "Generic error.")));
        mocks.ec2.expect_describe_instances().never();
        mocks.cfn.expect_delete_stack().never();

        let err = cluster(mocks).delete(true).await.unwrap_err();
        assert!(err.to_string().contains("Unable to persist logs"));
    }

    #[tokio::test]
    async fn test_delete_in_progress_skips_log_persistence() {
        let mut mocks = Mocks::default();
        mocks.cfn.expect_get_stack_template().never();
        mocks
            .cfn
            .expect_delete_stack()
            .times(1)
            .returning(|_| Ok(()));
        mocks
            .ec2
            .expect_describe_instances()
            .times(1)
            .returning(|_| Ok(vec![]));

        let mut cluster = cluster_with_status(mocks, StackStatus::DeleteInProgress);
        cluster.delete(true).await.unwrap();
    }

    // ------------------------------------------------------------------------
    // terminate_nodes
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_terminate_nodes_in_batches() {
        let mut mocks = Mocks::default();
        mocks
            .ec2
            .expect_describe_instances()
            .withf(|filters| filters[2] == Filter::tag(NODE_TYPE_TAG, "Compute"))
            .times(1)
            .returning(|_| Ok((0..1500).map(|i| instance(&format!("i-{i}"))).collect()));
        let mut batches = vec![1000, 500].into_iter();
        mocks
            .ec2
            .expect_terminate_instances()
            .times(2)
            .returning(move |ids| {
                assert_eq!(ids.len(), batches.next().unwrap());
                Ok(())
            });

        assert_eq!(cluster(mocks).terminate_nodes().await, 1500);
    }

    #[tokio::test]
    async fn test_terminate_nodes_swallows_failures() {
        let mut mocks = Mocks::default();
        mocks
            .ec2
            .expect_describe_instances()
            .times(1)
            .returning(|_| Ok(vec![instance("i-1")]));
        mocks
            .ec2
            .expect_terminate_instances()
            .times(1)
            .returning(|_| Err(AwsClientError::new("terminate_instances", "denied")));

        assert_eq!(cluster(mocks).terminate_nodes().await, 0);

        let mut mocks = Mocks::default();
        mocks
            .ec2
            .expect_describe_instances()
            .times(1)
            .returning(|_| Err(AwsClientError::new("describe_instances", "denied")));
        mocks.ec2.expect_terminate_instances().never();

        assert_eq!(cluster(mocks).terminate_nodes().await, 0);
    }

    // ------------------------------------------------------------------------
    // persist_cloudwatch_log_groups
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_persist_cloudwatch_log_groups() {
        let cases: [(&'static str, bool); 4] = [
            (r#"{"Resources": {}}"#, false),
            (
                r#"{"Resources": {"key": {"Type": "AWS::Logs::LogGroup", "DeletionPolicy": "Retain"}}}"#,
                false,
            ),
            (
                r#"{"Resources": {"key": {"Type": "AWS::Logs::LogGroup", "DeletionPolicy": "Don't Retain"}}}"#,
                true,
            ),
            (
                r#"{"Resources": {"key": {"Type": "AWS::Logs::LogGroup", "DeletionPolicy": "Delete"}}}"#,
                true,
            ),
        ];

        for (template, expect_update) in cases {
            let mut mocks = Mocks::default();
            expect_template(&mut mocks.cfn, template);
            if expect_update {
                expect_retained_upload(&mut mocks.s3, "key");
            } else {
                mocks.s3.expect_put_object().never();
            }
            mocks
                .cfn
                .expect_update_stack_from_url()
                .times(usize::from(expect_update))
                .returning(|_, _| Ok("stack ID".to_string()));
            mocks
                .cfn
                .expect_describe_stack()
                .returning(|_| Ok(stack("UPDATE_COMPLETE")));

            cluster(mocks).persist_cloudwatch_log_groups().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_persist_cloudwatch_log_groups_failure() {
        let mut mocks = Mocks::default();
        expect_template(
            &mut mocks.cfn,
            r#"{"Resources": {"key": {"Type": "AWS::Logs::LogGroup"}}}"#,
        );
        expect_upload(&mut mocks.s3, 1);
        mocks
            .cfn
            .expect_update_stack_from_url()
            .times(1)
            .returning(|_, _| Err(AwsClientError::new("function", "Generic error.")));

        let err = cluster(mocks)
            .persist_cloudwatch_log_groups()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClusterAction(_)));
        assert!(err.to_string().contains("Unable to persist logs"));
        assert!(err.to_string().contains("Generic error."));
    }

    // ------------------------------------------------------------------------
    // persist_stack_resources
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_persist_stack_resources_missing_keys() {
        let cases = [
            (r#"{"Description": "no resources"}"#, "Resources"),
            (r#"{"Resources": {}}"#, "key"),
        ];

        for (template, missing) in cases {
            let mut mocks = Mocks::default();
            expect_template(&mut mocks.cfn, template);
            mocks.s3.expect_put_object().never();
            mocks.cfn.expect_update_stack_from_url().never();

            let err = cluster(mocks)
                .persist_stack_resources(["key"])
                .await
                .unwrap_err();
            assert!(
                matches!(&err, Error::Template(TemplateError::MissingKey(key)) if key == missing),
                "unexpected error {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_persist_stack_resources() {
        let templates = [
            r#"{"Resources": {"key": {}}}"#,
            r#"{"Resources": {"key": {"DeletionPolicy": "Don't Retain"}}}"#,
            r#"{"Resources": {"key": {"DeletionPolicy": "Delete"}}}"#,
            r#"{"Resources": {"key": {"DeletionPolicy": "Retain"}}}"#,
        ];

        for template in templates {
            let mut mocks = Mocks::default();
            expect_template(&mut mocks.cfn, template);
            expect_retained_upload(&mut mocks.s3, "key");
            mocks
                .cfn
                .expect_update_stack_from_url()
                .times(1)
                .returning(|_, _| Ok("stack ID".to_string()));
            mocks
                .cfn
                .expect_describe_stack()
                .returning(|_| Ok(stack("UPDATE_COMPLETE")));

            cluster(mocks).persist_stack_resources(["key"]).await.unwrap();
        }
    }

    // ------------------------------------------------------------------------
    // get_unretained_cw_log_group_resource_keys
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_get_unretained_cw_log_group_resource_keys() {
        let mut mocks = Mocks::default();
        expect_template(
            &mut mocks.cfn,
            r#"{"Resources": {
                "Kept": {"Type": "AWS::Logs::LogGroup", "DeletionPolicy": "Retain"},
                "Dropped": {"Type": "AWS::Logs::LogGroup", "DeletionPolicy": "Delete"},
                "Queue": {"Type": "AWS::SQS::Queue"}
            }}"#,
        );

        let keys = cluster(mocks)
            .get_unretained_cw_log_group_resource_keys()
            .await
            .unwrap();
        assert_eq!(keys, vec!["Dropped"]);
    }

    // ------------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_create() {
        let mut mocks = Mocks::default();
        expect_upload(&mut mocks.s3, 1);
        mocks
            .cfn
            .expect_create_stack_from_url()
            .withf(|request| {
                request.stack_name == FAKE_STACK_NAME
                    && request.template_url == TEMPLATE_URL
                    && request.capabilities.contains(&"CAPABILITY_NAMED_IAM".to_string())
                    && request.tags.contains(&Tag::new(VERSION_TAG, installed_version()))
                    && request.tags.contains(&Tag::new(CLUSTER_DIR_TAG, ARTIFACT_DIRECTORY))
                    && request.tags.contains(&Tag::new("team", "hpc"))
            })
            .times(1)
            .returning(|_| Ok("stack-id".to_string()));

        let config = ClusterConfig {
            tags: vec![Tag::new("team", "hpc")],
            ..ClusterConfig::default()
        };
        let mut cluster = cluster(mocks).with_config(config);
        let template = StackTemplate::parse(r#"{"Resources": {}}"#).unwrap();

        assert_eq!(cluster.create(&template).await.unwrap(), "stack-id");
        assert_eq!(cluster.stack().status(), &StackStatus::CreateInProgress);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_config() {
        let mut mocks = Mocks::default();
        mocks.s3.expect_put_object().never();
        mocks.cfn.expect_create_stack_from_url().never();

        let config = ClusterConfig::from_yaml(
            "Scheduling:\n  SlurmSettings:\n    CustomSlurmSettings:\n      - SlurmUser: root\n",
        )
        .unwrap();
        let mut cluster = cluster(mocks).with_config(config);
        let template = StackTemplate::parse(r#"{"Resources": {}}"#).unwrap();

        let err = cluster.create(&template).await.unwrap_err();
        assert!(err.to_string().contains("SlurmUser"));
    }

    #[tokio::test]
    async fn test_update_keeps_live_retention() {
        let mut mocks = Mocks::default();
        expect_template(
            &mut mocks.cfn,
            r#"{"Resources": {"Logs": {"Type": "AWS::Logs::LogGroup", "DeletionPolicy": "Retain"}}}"#,
        );
        expect_retained_upload(&mut mocks.s3, "Logs");
        mocks
            .cfn
            .expect_update_stack_from_url()
            .times(1)
            .returning(|_, _| Ok("stack ID".to_string()));
        mocks
            .cfn
            .expect_describe_stack()
            .times(1)
            .returning(|_| Ok(stack("UPDATE_COMPLETE")));

        let next = StackTemplate::parse(
            r#"{"Resources": {"Logs": {"Type": "AWS::Logs::LogGroup"}, "Extra": {"Type": "X"}}}"#,
        )
        .unwrap();
        cluster(mocks).update(&next).await.unwrap();
    }

    #[tokio::test]
    async fn test_describe() {
        let mut mocks = Mocks::default();
        mocks.cfn.expect_describe_stack().times(1).returning(|_| {
            let mut description = stack("UPDATE_ROLLBACK_COMPLETE");
            description.tags = vec![Tag::new(VERSION_TAG, "1.2.3")];
            Ok(description)
        });
        mocks
            .ec2
            .expect_describe_instances()
            .times(2)
            .returning(|filters| {
                if filters[2] == Filter::tag(NODE_TYPE_TAG, "HeadNode") {
                    Ok(vec![instance("i-head")])
                } else {
                    Ok(vec![instance("i-1"), instance("i-2")])
                }
            });

        let description = cluster(mocks).describe().await.unwrap();
        assert_eq!(description.status, StackStatus::UpdateRollbackComplete);
        assert!(description.settled);
        assert_eq!(description.version.as_deref(), Some("1.2.3"));
        assert_eq!(
            description.head_node.map(|i| i.instance_id).as_deref(),
            Some("i-head")
        );
        assert_eq!(description.compute_node_count, 2);
    }

    #[tokio::test]
    async fn test_load_reads_cluster_dir() {
        let mut cfn = MockCfnClient::new();
        cfn.expect_describe_stack()
            .withf(|name| name == FAKE_CLUSTER_NAME)
            .times(1)
            .returning(|name| {
                let mut description = StackDescription::new(name, StackStatus::CreateComplete);
                description.tags = vec![Tag::new(CLUSTER_DIR_TAG, "custom/dir")];
                Ok(description)
            });
        let api = AwsApi::new(
            Arc::new(cfn),
            Arc::new(MockEc2Client::new()),
            Arc::new(MockS3Client::new()),
        );
        let settings = BucketSettings {
            name: "bucket".to_string(),
            region: "us-east-1".to_string(),
        };

        let cluster = Cluster::load(FAKE_CLUSTER_NAME, api, &settings).await.unwrap();
        assert_eq!(cluster.bucket().artifact_directory(), "custom/dir");
        assert_eq!(cluster.stack_name(), FAKE_CLUSTER_NAME);
        assert_eq!(cluster.tags().get(CLUSTER_DIR_TAG), Some("custom/dir"));
    }

    #[test]
    fn test_node_type_parse() {
        assert_eq!("HeadNode".parse::<NodeType>(), Ok(NodeType::HeadNode));
        assert_eq!("compute".parse::<NodeType>(), Ok(NodeType::Compute));
        assert!("login".parse::<NodeType>().is_err());
    }
}
