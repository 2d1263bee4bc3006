//! Domain models for the cluster control plane.

pub mod cluster;
pub mod s3_bucket;
pub mod stack;
pub mod tags;
pub mod template;

pub use cluster::{Cluster, ClusterDescription, NodeType};
pub use s3_bucket::S3Bucket;
pub use stack::{ClusterStack, StackOperation, StackStatus};
pub use tags::TagSet;
pub use template::StackTemplate;
