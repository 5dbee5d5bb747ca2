//! STS-backed [`AccountApi`]

use crate::error::{Result, RunnerError};
use crate::services::AccountApi;
use async_trait::async_trait;
use aws_sdk_sts::Client;

/// Caller identity through STS
pub struct StsAccount {
    client: Client,
}

impl StsAccount {
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
impl AccountApi for StsAccount {
    async fn account_id(&self) -> Result<String> {
        let output = self
            .client
            .get_caller_identity()
            .send()
            .await
            .map_err(RunnerError::from_aws("get caller identity", "sts"))?;

        output
            .account()
            .map(str::to_string)
            .ok_or_else(|| RunnerError::service("get caller identity", "sts", "response has no account"))
    }
}
