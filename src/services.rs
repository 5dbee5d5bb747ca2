//! External service seams
//!
//! The runner only talks to AWS through these traits. [`Services::from_config`]
//! wires the SDK-backed adapters; tests substitute in-memory fakes.

use crate::aws::{CloudFormationStacks, EmrClusters, S3ObjectStore, StsAccount};
use crate::cluster::ClusterApi;
use crate::document::KeyValue;
use crate::error::Result;
use crate::stack::StackApi;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Object storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file to `bucket/key`
    async fn upload_file(&self, path: &Path, bucket: &str, key: &str) -> Result<()>;

    /// Replace the tag set of `bucket/key`
    async fn apply_tags(&self, bucket: &str, key: &str, tags: &[KeyValue]) -> Result<()>;
}

/// Caller identity
#[async_trait]
pub trait AccountApi: Send + Sync {
    /// Account id of the credentials in use
    async fn account_id(&self) -> Result<String>;
}

/// Every external collaborator the runner needs
#[derive(Clone)]
pub struct Services {
    /// CloudFormation
    pub stacks: Arc<dyn StackApi>,
    /// EMR
    pub clusters: Arc<dyn ClusterApi>,
    /// S3
    pub objects: Arc<dyn ObjectStore>,
    /// STS
    pub account: Arc<dyn AccountApi>,
}

impl Services {
    /// SDK-backed services for a loaded AWS config
    pub fn from_config(config: &aws_config::SdkConfig) -> Self {
        Self {
            stacks: Arc::new(CloudFormationStacks::from_config(config)),
            clusters: Arc::new(EmrClusters::from_config(config)),
            objects: Arc::new(S3ObjectStore::from_config(config)),
            account: Arc::new(StsAccount::from_config(config)),
        }
    }

    /// Load AWS config from the default chain, overriding the region when given
    pub async fn load(region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_types::region::Region::new(region.to_string()));
        }
        let config = loader.load().await;
        Self::from_config(&config)
    }
}
