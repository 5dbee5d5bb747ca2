//! Step encoding
//!
//! Turns the declarative `steps` entries of the config into EMR step
//! payloads. Encoding happens before any call to EMR so a bad step type
//! fails the run without touching the cluster.

use crate::document::{DeployConfig, KeyValue};
use crate::error::{Result, RunnerError};
use serde::{Deserialize, Serialize};

/// Jar that runs arbitrary commands on the master node
pub const COMMAND_RUNNER_JAR: &str = "command-runner.jar";

/// Default action when a step fails
pub const DEFAULT_ACTION_ON_FAILURE: &str = "CANCEL_AND_WAIT";

fn default_action_on_failure() -> String {
    DEFAULT_ACTION_ON_FAILURE.to_string()
}

/// Engine-specific step payload as submitted to the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionStep {
    /// Step name
    pub name: String,

    /// What the cluster does when the step fails
    #[serde(default = "default_action_on_failure")]
    pub action_on_failure: String,

    /// Jar invocation
    pub hadoop_jar_step: HadoopJarStep,
}

/// Jar, main class and arguments of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HadoopJarStep {
    /// Jar location
    pub jar: String,

    /// Arguments passed to the jar
    #[serde(default)]
    pub args: Vec<String>,

    /// Main class, when the jar manifest does not name one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_class: Option<String>,

    /// Java properties
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<KeyValue>,
}

/// Declarative step from the `steps` section of the config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StepConfig {
    /// Engine type (`Spark`)
    #[serde(rename = "Type")]
    pub step_type: String,

    /// Step name
    pub name: String,

    /// Overrides [`DEFAULT_ACTION_ON_FAILURE`]
    #[serde(default)]
    pub action_on_failure: Option<String>,

    /// Entry point class
    #[serde(default)]
    pub main_class: Option<String>,

    /// `key=value` pairs, each passed as `--conf`
    #[serde(default)]
    pub spark_configs: Vec<String>,

    /// Passed as `--driver-java-options`
    #[serde(default)]
    pub driver_java_options: Option<String>,

    /// `client` or `cluster`
    #[serde(default)]
    pub deploy_mode: Option<String>,

    /// Cluster master designation
    #[serde(default)]
    pub master: Option<String>,

    /// Artifact location; defaults to the uploaded deploy package
    #[serde(default)]
    pub package: Option<String>,

    /// Trailing application arguments
    #[serde(default)]
    pub args: Vec<String>,
}

/// Supported engine types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    /// spark-submit through command-runner.jar
    Spark,
}

impl StepType {
    /// Parse a step `Type` (case-insensitive)
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "spark" => Ok(Self::Spark),
            _ => Err(RunnerError::UnsupportedStepType(value.to_string())),
        }
    }
}

/// Encode one declarative step
pub fn encode(step: &StepConfig, deploy: &DeployConfig) -> Result<ExecutionStep> {
    match StepType::parse(&step.step_type)? {
        StepType::Spark => encode_spark(step, deploy),
    }
}

/// Encode all steps in order, failing on the first unsupported one
pub fn encode_all(steps: &[StepConfig], deploy: &DeployConfig) -> Result<Vec<ExecutionStep>> {
    steps.iter().map(|s| encode(s, deploy)).collect()
}

/// Fail on the first step whose type cannot be encoded, without touching
/// deploy settings that may not be resolved yet
pub fn check_types(steps: &[StepConfig]) -> Result<()> {
    steps
        .iter()
        .try_for_each(|s| StepType::parse(&s.step_type).map(drop))
}

fn encode_spark(step: &StepConfig, deploy: &DeployConfig) -> Result<ExecutionStep> {
    let package = match &step.package {
        Some(p) => p.clone(),
        None => deploy.artifact_location()?,
    };

    let mut args = vec!["spark-submit".to_string()];

    for conf in &step.spark_configs {
        args.push("--conf".to_string());
        args.push(conf.clone());
    }

    if let Some(opts) = &step.driver_java_options {
        args.push("--driver-java-options".to_string());
        args.push(opts.clone());
    }

    if let Some(class) = &step.main_class {
        args.push("--class".to_string());
        args.push(class.clone());
    }

    args.push("--deploy-mode".to_string());
    args.push(step.deploy_mode.clone().unwrap_or_else(|| "client".to_string()));
    args.push("--master".to_string());
    args.push(step.master.clone().unwrap_or_else(|| "yarn".to_string()));
    args.push(package);
    args.extend(step.args.iter().cloned());

    Ok(ExecutionStep {
        name: step.name.clone(),
        action_on_failure: step
            .action_on_failure
            .clone()
            .unwrap_or_else(default_action_on_failure),
        hadoop_jar_step: HadoopJarStep {
            jar: COMMAND_RUNNER_JAR.to_string(),
            args,
            main_class: None,
            properties: Vec::new(),
        },
    })
}

/// Step that enables the Hadoop debugging tool on the cluster
pub fn hadoop_debugging_step() -> ExecutionStep {
    ExecutionStep {
        name: "Setup Hadoop Debugging".to_string(),
        action_on_failure: DEFAULT_ACTION_ON_FAILURE.to_string(),
        hadoop_jar_step: HadoopJarStep {
            jar: COMMAND_RUNNER_JAR.to_string(),
            args: vec!["state-pusher-script".to_string()],
            main_class: None,
            properties: Vec::new(),
        },
    }
}
