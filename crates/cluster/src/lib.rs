//! Control plane for HPC clusters backed by CloudFormation stacks.
//!
//! This crate manages the lifecycle of a cluster through its stack:
//!
//! - **Controller** - [`Cluster`] creates, updates, describes and deletes the
//!   stack, polls its status, and terminates compute nodes
//! - **Templates** - [`StackTemplate`] edits deletion policies so log groups
//!   survive cluster deletion
//! - **Validation** - checks of custom Slurm settings in the cluster
//!   configuration
//! - **Benchmarks** - OSU latency thresholds and `lscpu` hyperthreading checks
//!
//! ## Cloud access
//!
//! The controller only talks to the narrow traits in [`aws`] (`CfnClient`,
//! `Ec2Client`, `S3Client`). [`aws::Aws`] implements all of them over HTTP;
//! tests substitute mocks.

pub mod aws;
pub mod benchmarks;
pub mod config;
pub mod constants;
pub mod error;
pub mod models;
pub mod validators;

pub use aws::{Aws, AwsApi};
pub use config::{BucketSettings, ClusterConfig, PollConfig};
pub use error::{AwsClientError, ClusterActionError, Error, Result, TemplateError};
pub use models::{
    Cluster, ClusterDescription, ClusterStack, NodeType, S3Bucket, StackOperation, StackStatus,
    StackTemplate, TagSet,
};
