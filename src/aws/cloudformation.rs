//! CloudFormation-backed [`StackApi`]

use crate::error::{Result, RunnerError, StackEventSummary};
use crate::stack::{ChangeSetInfo, ChangeSetRequest, StackApi, StackSummary};
use async_trait::async_trait;
use aws_sdk_cloudformation::error::ProvideErrorMetadata;
use aws_sdk_cloudformation::types::{Capability, ChangeSetType, Parameter, Tag};
use aws_sdk_cloudformation::Client;
use std::collections::BTreeMap;
use tracing::debug;

/// Stack operations through the CloudFormation API
pub struct CloudFormationStacks {
    client: Client,
}

impl CloudFormationStacks {
    /// Wrap a CloudFormation client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client built from shared AWS config
    pub fn from_config(config: &aws_config::SdkConfig) -> Self {
        Self::new(Client::new(config))
    }
}

/// CloudFormation reports a missing stack as a validation error
fn is_missing_stack<E: ProvideErrorMetadata>(err: &E) -> bool {
    err.message().is_some_and(|m| m.contains("does not exist"))
}

#[async_trait]
impl StackApi for CloudFormationStacks {
    async fn describe_stack(&self, name: &str) -> Result<Option<StackSummary>> {
        let output = match self.client.describe_stacks().stack_name(name).send().await {
            Ok(output) => output,
            Err(e) if is_missing_stack(&e) => {
                debug!(stack = %name, "Stack does not exist");
                return Ok(None);
            }
            Err(e) => return Err(RunnerError::from_aws("describe stack", name)(e)),
        };

        Ok(output.stacks().first().map(|stack| StackSummary {
            name: stack.stack_name().unwrap_or(name).to_string(),
            status: stack
                .stack_status()
                .map(|s| s.as_str())
                .unwrap_or_default()
                .to_string(),
            status_reason: stack.stack_status_reason().map(str::to_string),
        }))
    }

    async fn list_change_sets(&self, stack: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_change_sets()
                .stack_name(stack)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(RunnerError::from_aws("list changesets", stack))?;

            names.extend(
                output
                    .summaries()
                    .iter()
                    .filter_map(|s| s.change_set_name().map(str::to_string)),
            );

            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(names)
    }

    async fn delete_change_set(&self, stack: &str, change_set: &str) -> Result<()> {
        self.client
            .delete_change_set()
            .stack_name(stack)
            .change_set_name(change_set)
            .send()
            .await
            .map_err(RunnerError::from_aws("delete changeset", change_set))?;
        Ok(())
    }

    async fn create_change_set(&self, request: &ChangeSetRequest) -> Result<()> {
        let parameters = request
            .parameters
            .iter()
            .map(|p| {
                Parameter::builder()
                    .parameter_key(&p.key)
                    .parameter_value(&p.value)
                    .build()
            })
            .collect();

        let tags = request
            .tags
            .iter()
            .map(|t| Tag::builder().key(&t.key).value(&t.value).build())
            .collect();

        self.client
            .create_change_set()
            .stack_name(&request.stack_name)
            .change_set_name(&request.change_set_name)
            .change_set_type(ChangeSetType::from(request.operation.as_str()))
            .template_body(&request.template_body)
            .set_parameters(Some(parameters))
            .set_tags(Some(tags))
            .set_capabilities(Some(
                request
                    .capabilities
                    .iter()
                    .map(|c| Capability::from(c.as_str()))
                    .collect(),
            ))
            .send()
            .await
            .map_err(RunnerError::from_aws("create changeset", &request.stack_name))?;
        Ok(())
    }

    async fn describe_change_set(&self, stack: &str, change_set: &str) -> Result<ChangeSetInfo> {
        let output = self
            .client
            .describe_change_set()
            .stack_name(stack)
            .change_set_name(change_set)
            .send()
            .await
            .map_err(RunnerError::from_aws("describe changeset", change_set))?;

        Ok(ChangeSetInfo {
            status: output
                .status()
                .map(|s| s.as_str().to_string())
                .unwrap_or_default(),
            change_count: output.changes().len(),
            status_reason: output.status_reason().map(str::to_string),
        })
    }

    async fn execute_change_set(&self, stack: &str, change_set: &str) -> Result<()> {
        self.client
            .execute_change_set()
            .stack_name(stack)
            .change_set_name(change_set)
            .send()
            .await
            .map_err(RunnerError::from_aws("execute changeset", change_set))?;
        Ok(())
    }

    async fn delete_stack(&self, name: &str) -> Result<()> {
        self.client
            .delete_stack()
            .stack_name(name)
            .send()
            .await
            .map_err(RunnerError::from_aws("delete stack", name))?;
        Ok(())
    }

    async fn describe_stack_events(&self, name: &str) -> Result<Vec<StackEventSummary>> {
        let output = self
            .client
            .describe_stack_events()
            .stack_name(name)
            .send()
            .await
            .map_err(RunnerError::from_aws("describe stack events", name))?;

        Ok(output
            .stack_events()
            .iter()
            .map(|event| StackEventSummary {
                logical_resource_id: event.logical_resource_id().unwrap_or_default().to_string(),
                resource_status: event
                    .resource_status()
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_default(),
                resource_status_reason: event.resource_status_reason().map(str::to_string),
            })
            .collect())
    }

    async fn describe_stack_resources(&self, name: &str) -> Result<BTreeMap<String, String>> {
        let output = match self.client.describe_stack_resources().stack_name(name).send().await {
            Ok(output) => output,
            Err(e) if is_missing_stack(&e) => return Err(RunnerError::StackNotFound(name.to_string())),
            Err(e) => return Err(RunnerError::from_aws("describe stack resources", name)(e)),
        };

        Ok(output
            .stack_resources()
            .iter()
            .filter_map(|r| {
                Some((
                    r.logical_resource_id()?.to_string(),
                    r.physical_resource_id()?.to_string(),
                ))
            })
            .collect())
    }
}
