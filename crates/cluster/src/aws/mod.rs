//! AWS collaborators of the cluster controller.
//!
//! ## Services
//!
//! - **CloudFormation** - stack describe/template/create/update/delete
//! - **EC2** - cluster instance lookup and termination
//! - **S3** - template staging

mod client;
mod models;
mod traits;

pub use client::Aws;
pub use models::*;
pub use traits::{AwsApi, CfnClient, Ec2Client, S3Client};

#[cfg(test)]
pub use traits::{MockCfnClient, MockEc2Client, MockS3Client};
