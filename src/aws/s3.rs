//! S3-backed [`ObjectStore`]

use crate::document::KeyValue;
use crate::error::{Result, RunnerError};
use crate::services::ObjectStore;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Tag, Tagging};
use aws_sdk_s3::Client;
use std::path::Path;
use tracing::info;

/// Artifact uploads through S3
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client built from shared AWS config
    pub fn from_config(config: &aws_config::SdkConfig) -> Self {
        Self::new(Client::new(config))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload_file(&self, path: &Path, bucket: &str, key: &str) -> Result<()> {
        let target = format!("s3://{}/{}", bucket, key);
        info!("Uploading {} to {}", path.display(), target);

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| RunnerError::config(format!("failed to read {}: {}", path.display(), e)))?;

        let response = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(RunnerError::from_aws("upload", &target))?;

        info!(etag = ?response.e_tag(), "Uploaded {}", target);
        Ok(())
    }

    async fn apply_tags(&self, bucket: &str, key: &str, tags: &[KeyValue]) -> Result<()> {
        let target = format!("s3://{}/{}", bucket, key);

        let tag_set = tags
            .iter()
            .map(|t| Tag::builder().key(&t.key).value(&t.value).build())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| RunnerError::config(format!("invalid object tag: {}", e)))?;
        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(|e| RunnerError::config(format!("invalid object tags: {}", e)))?;

        self.client
            .put_object_tagging()
            .bucket(bucket)
            .key(key)
            .tagging(tagging)
            .send()
            .await
            .map_err(RunnerError::from_aws("tag", &target))?;

        info!(tags = tags.len(), "Tagged {}", target);
        Ok(())
    }
}
