//! Tag keys, resource types and limits shared across the crate.

/// Tag carrying the owning cluster name on every instance.
pub const APPLICATION_TAG: &str = "hpc-cluster:application";

/// Tag carrying the node type (`HeadNode` or `Compute`) on every instance.
pub const NODE_TYPE_TAG: &str = "hpc-cluster:node-type";

/// Reserved stack tag recording the controller version that manages the cluster.
pub const VERSION_TAG: &str = "hpc-cluster:version";

/// Stack tag recording the artifact directory in the staging bucket.
pub const CLUSTER_DIR_TAG: &str = "hpc-cluster:cluster-dir";

/// CloudFormation resource type of a CloudWatch log group.
pub const LOG_GROUP_TYPE: &str = "AWS::Logs::LogGroup";

/// Deletion policy value that keeps a resource when its stack goes away.
pub const RETAIN: &str = "Retain";

/// Object name of the cluster template inside the artifact directory.
pub const TEMPLATE_NAME: &str = "aws-hpc-cluster.cfn.yaml";

/// Instance states considered alive for a cluster.
pub const ALIVE_INSTANCE_STATES: [&str; 4] = ["pending", "running", "stopping", "stopped"];

/// Maximum number of instance ids per `TerminateInstances` call.
pub const TERMINATE_BATCH_SIZE: usize = 1000;

/// Version of this controller, written into [`VERSION_TAG`].
#[must_use]
pub fn installed_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
