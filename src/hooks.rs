//! Lifecycle hooks
//!
//! The `scripts` section of the config maps event names to an ordered list
//! of actions. An action is either a shell command, run through `sh -c` with
//! the standard streams inherited, or `plugin:<name>`, which calls a [`Hook`]
//! registered on the dispatcher.
//!
//! Shell actions see two environment variables:
//!
//! - `EMR_RUNNER_EVENT`: the event name
//! - `EMR_RUNNER_CONFIG`: path of a JSON copy of the resolved configuration.
//!   When the action rewrites the file, the rewritten document replaces the
//!   configuration for the rest of the run.

use crate::document::ConfigDocument;
use crate::error::{Result, RunnerError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

/// Env var carrying the event name
pub const EVENT_ENV: &str = "EMR_RUNNER_EVENT";

/// Env var carrying the path of the JSON configuration
pub const CONFIG_ENV: &str = "EMR_RUNNER_CONFIG";

const PLUGIN_PREFIX: &str = "plugin:";

/// Points in the orchestration flow where hooks fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// Before the resource stack is created or updated
    BeforeDeployResources,
    /// After the resource stack deploy finished, including no-op deploys
    AfterDeployResources,
    /// Before the resource stack is deleted
    BeforeDeleteResources,
    /// After the resource stack is gone
    AfterDeleteResources,
    /// Before stack outputs are loaded into `Resources`
    BeforeLoadResources,
    /// After the configuration was re-resolved with `Resources`
    AfterLoadResources,
    /// Before the package actions run
    BeforePackage,
    /// Builds the deploy package
    Package,
    /// After the package actions ran
    AfterPackage,
    /// Before the package is uploaded
    BeforeUploadPackage,
    /// After the package is uploaded and tagged
    AfterUploadPackage,
    /// Before a cluster is requested
    BeforeStartCluster,
    /// After the cluster is waiting for steps
    AfterStartCluster,
    /// Before a cluster is started with the configured steps
    BeforeRun,
    /// After the cluster with steps was requested
    AfterRun,
    /// After the cluster of a run reached its final state
    AfterComplete,
    /// Before steps are added to a running cluster
    BeforeSubmit,
    /// After steps were added
    AfterSubmit,
    /// After every submitted step completed
    AfterStepComplete,
    /// Before termination is requested
    BeforeTerminateCluster,
    /// After termination was requested
    AfterTerminateCluster,
}

impl LifecycleEvent {
    /// Key under `scripts`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeDeployResources => "beforeDeployResources",
            Self::AfterDeployResources => "afterDeployResources",
            Self::BeforeDeleteResources => "beforeDeleteResources",
            Self::AfterDeleteResources => "afterDeleteResources",
            Self::BeforeLoadResources => "beforeLoadResources",
            Self::AfterLoadResources => "afterLoadResources",
            Self::BeforePackage => "beforePackage",
            Self::Package => "package",
            Self::AfterPackage => "afterPackage",
            Self::BeforeUploadPackage => "beforeUploadPackage",
            Self::AfterUploadPackage => "afterUploadPackage",
            Self::BeforeStartCluster => "beforeStartCluster",
            Self::AfterStartCluster => "afterStartCluster",
            Self::BeforeRun => "beforeRun",
            Self::AfterRun => "afterRun",
            Self::AfterComplete => "afterComplete",
            Self::BeforeSubmit => "beforeSubmit",
            Self::AfterSubmit => "afterSubmit",
            Self::AfterStepComplete => "afterStepComplete",
            Self::BeforeTerminateCluster => "beforeTerminateCluster",
            Self::AfterTerminateCluster => "afterTerminateCluster",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    /// Shell command
    Shell(String),
    /// Registered in-process hook
    Plugin(String),
}

impl HookAction {
    /// `plugin:<name>` names a registered hook, anything else is a shell command
    pub fn parse(action: &str) -> Self {
        match action.trim().strip_prefix(PLUGIN_PREFIX) {
            Some(name) => Self::Plugin(name.trim().to_string()),
            None => Self::Shell(action.to_string()),
        }
    }
}

/// What a hook can see and change
pub struct HookContext<'a> {
    /// Event being fired
    pub event: LifecycleEvent,
    /// Live configuration; edits are seen by later actions and phases
    pub config: &'a mut ConfigDocument,
}

/// In-process extension point
#[async_trait]
pub trait Hook: Send + Sync {
    /// Run for one event. An error stops the flow.
    async fn execute(&self, ctx: &mut HookContext<'_>) -> Result<()>;
}

/// Runs the actions configured for an event, one after another
#[derive(Default, Clone)]
pub struct HookDispatcher {
    plugins: HashMap<String, Arc<dyn Hook>>,
}

impl HookDispatcher {
    /// Dispatcher with no plugins registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` under `name`, referenced from config as `plugin:<name>`
    pub fn register(&mut self, name: impl Into<String>, hook: Arc<dyn Hook>) -> &mut Self {
        self.plugins.insert(name.into(), hook);
        self
    }

    /// Run every action for `event` in order. The first failure stops the
    /// remaining actions.
    pub async fn trigger(&self, event: LifecycleEvent, config: &mut ConfigDocument) -> Result<()> {
        let actions = config.scripts_for(event.as_str()).to_vec();
        if actions.is_empty() {
            debug!(event = %event, "No hooks configured");
            return Ok(());
        }

        for action in actions {
            match HookAction::parse(&action) {
                HookAction::Plugin(name) => {
                    let hook = self.plugins.get(&name).ok_or_else(|| RunnerError::Hook {
                        event: event.to_string(),
                        action: action.clone(),
                        message: format!("no plugin registered as '{}'", name),
                    })?;
                    info!(event = %event, plugin = %name, "Running plugin");
                    let mut ctx = HookContext {
                        event,
                        config: &mut *config,
                    };
                    hook.execute(&mut ctx).await?;
                }
                HookAction::Shell(command) => {
                    info!(event = %event, "Running command: {}", command);
                    run_command(event, &command, config).await?;
                }
            }
        }

        Ok(())
    }
}

async fn run_command(event: LifecycleEvent, command: &str, config: &mut ConfigDocument) -> Result<()> {
    let hook_error = |message: String| RunnerError::Hook {
        event: event.to_string(),
        action: command.to_string(),
        message,
    };

    let snapshot = config.to_json_pretty()?;
    let file = tempfile::Builder::new()
        .prefix("emr-runner-config-")
        .suffix(".json")
        .tempfile()?;
    tokio::fs::write(file.path(), &snapshot).await?;

    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .env(EVENT_ENV, event.as_str())
        .env(CONFIG_ENV, file.path())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|e| hook_error(format!("failed to spawn: {}", e)))?;

    if !status.success() {
        return Err(hook_error(format!("exited with {}", status)));
    }

    let rewritten = match tokio::fs::read_to_string(file.path()).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if rewritten != snapshot {
        *config = serde_json::from_str(&rewritten)
            .map_err(|e| hook_error(format!("rewrote an invalid configuration: {}", e)))?;
        info!(event = %event, "Hook updated the configuration");
    }

    Ok(())
}
