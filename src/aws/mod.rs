//! AWS SDK adapters for the service seams

mod cloudformation;
mod emr;
mod s3;
mod sts;

pub use cloudformation::CloudFormationStacks;
pub use emr::EmrClusters;
pub use s3::S3ObjectStore;
pub use sts::StsAccount;

use chrono::{DateTime, Utc};

/// Convert an SDK timestamp
fn to_chrono(dt: &aws_sdk_emr::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}
