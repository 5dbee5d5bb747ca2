//! Resource stack deployment through changesets
//!
//! A deploy never touches the stack directly. It clears stale changesets,
//! submits a new one, waits for it to be created and only executes it when
//! it carries changes. An unchanged resource definition therefore converges
//! to an empty changeset that is deleted again.

use crate::document::KeyValue;
use crate::error::{Result, RunnerError, StackEventSummary};
use crate::poll::{poll_until, PollResult, PollSettings};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capabilities every changeset is submitted with
pub const CAPABILITIES: [&str; 2] = ["CAPABILITY_NAMED_IAM", "CAPABILITY_AUTO_EXPAND"];

/// Template format version written into every stack body
pub const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";

/// Events attached to a stack failure
const MAX_FAILURE_EVENTS: usize = 20;

/// Current state of a stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSummary {
    /// Stack name
    pub name: String,
    /// Status as reported by the service (`CREATE_COMPLETE`, ...)
    pub status: String,
    /// Status reason, if any
    pub status_reason: Option<String>,
}

/// Changeset status after creation was requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSetInfo {
    /// Status (`CREATE_PENDING`, `CREATE_IN_PROGRESS`, `CREATE_COMPLETE`, `FAILED`, ...)
    pub status: String,
    /// Number of resource changes in the changeset
    pub change_count: usize,
    /// Reason reported for the status
    pub status_reason: Option<String>,
}

/// Whether the stack is created or updated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// First deploy of the stack
    Create,
    /// Deploy onto an existing stack
    Update,
}

impl Operation {
    /// Changeset type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
        }
    }

    /// Stack status that ends a successful execution
    pub fn complete_status(&self) -> &'static str {
        match self {
            Self::Create => "CREATE_COMPLETE",
            Self::Update => "UPDATE_COMPLETE",
        }
    }
}

/// Everything needed to create a changeset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSetRequest {
    /// Normalized stack name
    pub stack_name: String,
    /// Changeset name, unique per deploy
    pub change_set_name: String,
    /// Changeset type
    pub operation: Operation,
    /// YAML stack body
    pub template_body: String,
    /// Stack parameters
    pub parameters: Vec<KeyValue>,
    /// Stack tags
    pub tags: Vec<KeyValue>,
    /// IAM capabilities acknowledged for the stack
    pub capabilities: Vec<String>,
}

/// Result of a deploy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    /// Changeset was empty and has been deleted
    NoChanges,
    /// Stack created
    Created,
    /// Stack updated
    Updated,
}

/// Resource stack provisioning service
#[async_trait]
pub trait StackApi: Send + Sync {
    /// Describe a stack, `None` when it does not exist
    async fn describe_stack(&self, name: &str) -> Result<Option<StackSummary>>;

    /// Names of every changeset on the stack
    async fn list_change_sets(&self, stack: &str) -> Result<Vec<String>>;

    /// Remove one changeset
    async fn delete_change_set(&self, stack: &str, change_set: &str) -> Result<()>;

    /// Submit a changeset without waiting for it
    async fn create_change_set(&self, request: &ChangeSetRequest) -> Result<()>;

    /// Current status of a changeset
    async fn describe_change_set(&self, stack: &str, change_set: &str) -> Result<ChangeSetInfo>;

    /// Apply a created changeset without waiting for the stack
    async fn execute_change_set(&self, stack: &str, change_set: &str) -> Result<()>;

    /// Request deletion; succeeds when the stack is already gone
    async fn delete_stack(&self, name: &str) -> Result<()>;

    /// Recent stack events, newest first
    async fn describe_stack_events(&self, name: &str) -> Result<Vec<StackEventSummary>>;

    /// Logical resource id to physical resource id. Fails with
    /// [`RunnerError::StackNotFound`] when the stack does not exist.
    async fn describe_stack_resources(&self, name: &str) -> Result<BTreeMap<String, String>>;
}

/// Lowercase, with every character outside `[a-z0-9-]` replaced by `-`
pub fn normalize_stack_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// Changeset name derived from `now`, e.g. `emr-runner-2024-05-01T10-00-00-000Z`
pub fn generate_change_set_name(now: DateTime<Utc>) -> String {
    let stamp: String = now
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("emr-runner-{}", stamp)
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct TemplateBody<'a> {
    #[serde(rename = "AWSTemplateFormatVersion")]
    format_version: &'static str,
    description: String,
    resources: &'a BTreeMap<String, Value>,
}

/// YAML stack body wrapping `resources`
pub fn render_template_body(name: &str, resources: &BTreeMap<String, Value>) -> Result<String> {
    let body = TemplateBody {
        format_version: TEMPLATE_FORMAT_VERSION,
        description: format!("{} Resources Stack", name),
        resources,
    };
    Ok(serde_yaml::to_string(&body)?)
}

enum ChangeSetOutcome {
    Ready,
    Empty,
}

/// Drives stack deploys and deletes
pub struct StackDeployer {
    api: Arc<dyn StackApi>,
    polls: PollSettings,
    cancel: CancellationToken,
}

impl StackDeployer {
    /// Deployer over `api`, waiting with `polls` until `cancel` fires
    pub fn new(api: Arc<dyn StackApi>, polls: PollSettings, cancel: CancellationToken) -> Self {
        Self { api, polls, cancel }
    }

    /// Current stack, `None` when it does not exist
    pub async fn get_stack(&self, name: &str) -> Result<Option<StackSummary>> {
        self.api.describe_stack(&normalize_stack_name(name)).await
    }

    /// Create or update the stack `name` with `resources`
    pub async fn deploy(
        &self,
        name: &str,
        resources: &BTreeMap<String, Value>,
        parameters: Vec<KeyValue>,
        tags: Vec<KeyValue>,
    ) -> Result<DeployOutcome> {
        let stack_name = normalize_stack_name(name);

        // A stack left in review by an earlier empty create still takes CREATE changesets
        let operation = match self.api.describe_stack(&stack_name).await? {
            Some(stack) if stack.status != "REVIEW_IN_PROGRESS" => Operation::Update,
            _ => Operation::Create,
        };
        info!(stack = %stack_name, operation = operation.as_str(), "Deploying resource stack");

        if operation == Operation::Update {
            self.clear_change_sets(&stack_name).await?;
        }

        let template_body = render_template_body(&stack_name, resources)?;
        debug!(stack = %stack_name, "Stack body:\n{}", template_body);

        let request = ChangeSetRequest {
            stack_name: stack_name.clone(),
            change_set_name: generate_change_set_name(Utc::now()),
            operation,
            template_body,
            parameters,
            tags,
            capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        };
        let change_set = request.change_set_name.clone();

        self.api.create_change_set(&request).await?;
        info!(stack = %stack_name, change_set = %change_set, "Changeset submitted");

        match self.wait_for_change_set(&stack_name, &change_set).await? {
            ChangeSetOutcome::Empty => {
                info!(stack = %stack_name, "No changes to deploy, deleting empty changeset");
                self.api.delete_change_set(&stack_name, &change_set).await?;
                return Ok(DeployOutcome::NoChanges);
            }
            ChangeSetOutcome::Ready => {}
        }

        self.api.execute_change_set(&stack_name, &change_set).await?;
        info!(stack = %stack_name, change_set = %change_set, "Changeset executing");

        self.wait_for_stack(&stack_name, operation.complete_status()).await?;
        info!(stack = %stack_name, status = operation.complete_status(), "Resource stack deployed");

        Ok(match operation {
            Operation::Create => DeployOutcome::Created,
            Operation::Update => DeployOutcome::Updated,
        })
    }

    /// Delete the stack and wait until it can no longer be described
    pub async fn delete_stack(&self, name: &str) -> Result<()> {
        let stack_name = normalize_stack_name(name);
        info!(stack = %stack_name, "Deleting resource stack");

        self.api.delete_stack(&stack_name).await?;

        let api = &self.api;
        let name = stack_name.as_str();
        poll_until(
            &format!("stack {} deletion", stack_name),
            self.polls.stack_delete,
            &self.cancel,
            move |_| async move {
                match api.describe_stack(name).await? {
                    None => Ok(PollResult::Done(())),
                    Some(stack) if stack.status == "DELETE_COMPLETE" => Ok(PollResult::Done(())),
                    Some(stack) if stack.status == "DELETE_FAILED" => Ok(PollResult::Fail(
                        self.stack_failure(name, "DELETE_COMPLETE").await,
                    )),
                    Some(stack) => {
                        debug!(stack = %name, status = %stack.status, "Stack still deleting");
                        Ok(PollResult::Retry)
                    }
                }
            },
        )
        .await?;

        info!(stack = %stack_name, "Resource stack deleted");
        Ok(())
    }

    /// Logical to physical resource ids of a deployed stack
    pub async fn load_resources(&self, name: &str) -> Result<BTreeMap<String, String>> {
        let stack_name = normalize_stack_name(name);
        let resources = self.api.describe_stack_resources(&stack_name).await?;
        debug!(stack = %stack_name, resources = ?resources, "Loaded stack resources");
        Ok(resources)
    }

    async fn clear_change_sets(&self, stack_name: &str) -> Result<()> {
        for change_set in self.api.list_change_sets(stack_name).await? {
            info!(stack = %stack_name, change_set = %change_set, "Deleting stale changeset");
            self.api.delete_change_set(stack_name, &change_set).await?;
        }
        Ok(())
    }

    async fn wait_for_change_set(&self, stack_name: &str, change_set: &str) -> Result<ChangeSetOutcome> {
        let api = &self.api;
        poll_until(
            &format!("changeset {}", change_set),
            self.polls.change_set,
            &self.cancel,
            move |_| async move {
                let info = api.describe_change_set(stack_name, change_set).await?;
                Ok(match info.status.as_str() {
                    "CREATE_COMPLETE" => PollResult::Done(ChangeSetOutcome::Ready),
                    "CREATE_PENDING" | "CREATE_IN_PROGRESS" => PollResult::Retry,
                    "FAILED" if info.change_count == 0 => PollResult::Done(ChangeSetOutcome::Empty),
                    status => PollResult::Fail(RunnerError::ChangeSetFailed {
                        stack: stack_name.to_string(),
                        change_set: change_set.to_string(),
                        reason: info
                            .status_reason
                            .unwrap_or_else(|| format!("changeset status {}", status)),
                    }),
                })
            },
        )
        .await
    }

    async fn wait_for_stack(&self, stack_name: &str, expected: &str) -> Result<()> {
        let api = &self.api;
        let result = poll_until(
            &format!("stack {}", stack_name),
            self.polls.stack,
            &self.cancel,
            move |_| async move {
                match api.describe_stack(stack_name).await? {
                    Some(stack) if stack.status == expected => Ok(PollResult::Done(())),
                    Some(stack) if stack.status.ends_with("_IN_PROGRESS") => {
                        debug!(stack = %stack_name, status = %stack.status, "Stack in progress");
                        Ok(PollResult::Retry)
                    }
                    Some(stack) => {
                        warn!(
                            stack = %stack_name,
                            status = %stack.status,
                            reason = ?stack.status_reason,
                            "Stack reached unexpected state"
                        );
                        Ok(PollResult::Fail(self.stack_failure(stack_name, expected).await))
                    }
                    None => Ok(PollResult::Retry),
                }
            },
        )
        .await;

        match result {
            Err(RunnerError::PollExhausted { .. }) => Err(self.stack_failure(stack_name, expected).await),
            other => other,
        }
    }

    async fn stack_failure(&self, stack_name: &str, expected: &str) -> RunnerError {
        let events = match self.api.describe_stack_events(stack_name).await {
            Ok(events) => events.into_iter().take(MAX_FAILURE_EVENTS).collect(),
            Err(e) => {
                warn!(stack = %stack_name, error = %e, "Failed to fetch stack events");
                Vec::new()
            }
        };
        RunnerError::StackFailed {
            stack: stack_name.to_string(),
            expected: expected.to_string(),
            events,
        }
    }
}
