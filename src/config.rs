//! Two-phase configuration resolution
//!
//! Settings files are rendered first, in the order given, each one seeing
//! the built-in values plus every setting resolved before it (as `Values`).
//! The main config template is then rendered against the built-ins and the
//! merged settings.
//!
//! Resolution runs twice per deployment. Before the resource stack exists
//! ([`ResolutionPhase::PreResources`]) references to `Resources.*` and
//! `AWSAccountId` are allowed to stay unresolved. Once the stack is up
//! ([`ResolutionPhase::PostResources`]) the live resource ids are injected
//! and every reference must resolve.

use crate::document::{
    deep_merge, merge_cluster_tags, set_path, ConfigDocument, KeyValue, MAX_IDLE_MINUTES_TAG,
};
use crate::error::{Result, RunnerError};
use crate::step::hadoop_debugging_step;
use crate::template::Template;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Live resource identifiers available after the stack is deployed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceContext {
    /// Account the stack lives in
    pub account_id: String,
    /// Logical resource id to physical resource id
    pub resources: BTreeMap<String, String>,
}

/// Which values are available to the templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionPhase {
    /// Resource stack not deployed (or not loaded) yet
    PreResources,
    /// Resource identifiers and account id are known
    PostResources(ResourceContext),
}

impl ResolutionPhase {
    /// Whether an unresolved reference to `variable` is acceptable in this phase
    pub fn tolerates(&self, variable: &str) -> bool {
        matches!(self, Self::PreResources) && is_resource_variable(variable)
    }

    fn resources(&self) -> Option<&ResourceContext> {
        match self {
            Self::PreResources => None,
            Self::PostResources(ctx) => Some(ctx),
        }
    }
}

/// References that only resolve once the resource stack exists
pub fn is_resource_variable(variable: &str) -> bool {
    variable == "AWSAccountId" || variable == "Resources" || variable.starts_with("Resources.")
}

/// Render `source` against `values`, failing with every unresolved reference
/// the phase does not tolerate.
pub fn render_template(source: &str, values: &Value, phase: &ResolutionPhase) -> Result<String> {
    let template = Template::parse(source)?;

    let missing: Vec<String> = template
        .missing_variables(values)
        .into_iter()
        .filter(|v| !phase.tolerates(v))
        .collect();

    if !missing.is_empty() {
        return Err(RunnerError::MissingVariable { variables: missing });
    }

    Ok(template.render(values))
}

/// Loads config and settings templates and resolves them into a [`ConfigDocument`]
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    config_path: PathBuf,
    settings_paths: Vec<PathBuf>,
    env: BTreeMap<String, String>,
    overrides: Vec<(String, Value)>,
}

impl ConfigResolver {
    /// Resolver over the process environment
    pub fn new(config_path: impl Into<PathBuf>, settings_paths: Vec<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            settings_paths,
            env: std::env::vars().collect(),
            overrides: Vec::new(),
        }
    }

    /// Replace the environment exposed as `env`
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Record an override applied after rendering. Overrides apply in the
    /// order they were added; a later one at the same path wins.
    pub fn add_override_config(&mut self, path: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.overrides.push((path.into(), value.into()));
        self
    }

    /// Recorded overrides in application order
    pub fn overrides(&self) -> &[(String, Value)] {
        &self.overrides
    }

    /// Config template path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Phase 1 resolution
    pub fn load(&self) -> Result<ConfigDocument> {
        self.resolve(&ResolutionPhase::PreResources)
    }

    /// Phase 2 resolution with live resource ids
    pub fn reload_with_resources(
        &self,
        account_id: impl Into<String>,
        resources: BTreeMap<String, String>,
    ) -> Result<ConfigDocument> {
        self.resolve(&ResolutionPhase::PostResources(ResourceContext {
            account_id: account_id.into(),
            resources,
        }))
    }

    /// Resolve config and settings for `phase`
    pub fn resolve(&self, phase: &ResolutionPhase) -> Result<ConfigDocument> {
        let mut values = self.built_ins(phase)?;
        let settings = self.resolve_settings(&values, phase)?;

        if let Value::Object(map) = &mut values {
            map.insert("Values".to_string(), settings);
        }

        let source = read_template(&self.config_path)?;
        let body = render_template(&source, &values, phase)
            .map_err(|e| with_origin(e, &self.config_path))?;
        debug!(path = %self.config_path.display(), "Rendered config:\n{}", body);

        let mut tree = parse_yaml(&body, &self.config_path)?;
        if !tree.is_object() {
            return Err(RunnerError::config(format!(
                "{} must contain a mapping",
                self.config_path.display()
            )));
        }

        for key in ["cluster", "deploy"] {
            if tree.get(key).is_none_or(Value::is_null) {
                return Err(RunnerError::config(format!(
                    "{} is missing required top-level key '{}'",
                    self.config_path.display(),
                    key
                )));
            }
        }

        let computed = computed_tags(&tree)?;
        merge_cluster_tags(&mut tree, computed)?;
        self.apply_overrides(&mut tree, phase)?;

        let doc = ConfigDocument::from_tree(tree)?;
        debug!("Resolved config:\n{}", doc.to_json_pretty()?);
        Ok(doc)
    }

    fn built_ins(&self, phase: &ResolutionPhase) -> Result<Value> {
        let mut env = self.env.clone();
        env.entry("BUILD_NUMBER".to_string())
            .or_insert_with(|| "manual".to_string());
        env.entry("AUTO_TERMINATE".to_string())
            .or_insert_with(|| "false".to_string());

        let mut values = Map::new();
        values.insert("env".to_string(), serde_json::to_value(env)?);
        values.insert(
            "EmrHadoopDebuggingStep".to_string(),
            Value::String(serde_json::to_string(&hadoop_debugging_step())?),
        );

        if let Some(ctx) = phase.resources() {
            values.insert("Resources".to_string(), serde_json::to_value(&ctx.resources)?);
            values.insert("AWSAccountId".to_string(), Value::String(ctx.account_id.clone()));
        }

        Ok(Value::Object(values))
    }

    fn resolve_settings(&self, built_ins: &Value, phase: &ResolutionPhase) -> Result<Value> {
        let mut settings = Value::Object(Map::new());

        for path in &self.settings_paths {
            let mut values = built_ins.clone();
            if let Value::Object(map) = &mut values {
                map.insert("Values".to_string(), settings.clone());
            }

            let source = read_template(path)?;
            let body = render_template(&source, &values, phase).map_err(|e| with_origin(e, path))?;
            debug!(path = %path.display(), "Rendered settings:\n{}", body);

            match parse_yaml(&body, path)? {
                Value::Null => {}
                layer @ Value::Object(_) => deep_merge(&mut settings, layer),
                _ => {
                    return Err(RunnerError::config(format!(
                        "settings file {} must contain a mapping",
                        path.display()
                    )));
                }
            }
        }

        Ok(settings)
    }

    fn apply_overrides(&self, tree: &mut Value, phase: &ResolutionPhase) -> Result<()> {
        for (path, value) in &self.overrides {
            set_path(tree, path, value.clone())?;
            // Phase 1 and phase 2 both apply overrides; report them once.
            if phase.resources().is_some() {
                info!("Override settings: {}={}", path, value);
            } else {
                debug!("Override settings: {}={}", path, value);
            }
        }
        Ok(())
    }
}

fn computed_tags(tree: &Value) -> Result<Vec<KeyValue>> {
    let mut tags = Vec::new();
    match tree.pointer("/deploy/maxIdleMinutes") {
        None | Some(Value::Null) => {}
        Some(Value::Number(n)) if n.is_u64() => {
            tags.push(KeyValue::new(MAX_IDLE_MINUTES_TAG, n.to_string()));
        }
        Some(other) => {
            return Err(RunnerError::config(format!(
                "deploy.maxIdleMinutes must be a positive integer, got {}",
                other
            )));
        }
    }
    Ok(tags)
}

fn read_template(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| RunnerError::config(format!("failed to read {}: {}", path.display(), e)))
}

fn parse_yaml(body: &str, origin: &Path) -> Result<Value> {
    serde_yaml::from_str::<Value>(body)
        .map_err(|e| RunnerError::config(format!("failed to load yaml {}: {}", origin.display(), e)))
}

fn with_origin(err: RunnerError, origin: &Path) -> RunnerError {
    match err {
        RunnerError::Template(msg) => {
            RunnerError::template(format!("{}: {}", origin.display(), msg))
        }
        other => other,
    }
}
