//! Orchestration session
//!
//! [`EmrRunner`] owns the resolved configuration for one invocation and wires
//! the resolver, the stack and cluster controllers and the hook dispatcher
//! into the command flows. Hooks fire at every phase boundary.

use crate::cluster::{ClusterController, ClusterState};
use crate::config::ConfigResolver;
use crate::document::{changed_paths, ConfigDocument};
use crate::error::Result;
use crate::hooks::{HookDispatcher, LifecycleEvent};
use crate::poll::PollSettings;
use crate::services::Services;
use crate::stack::{DeployOutcome, StackDeployer};
use crate::step::{self, ExecutionStep};
use chrono::Utc;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One orchestration session
pub struct EmrRunner {
    resolver: ConfigResolver,
    config: ConfigDocument,
    services: Services,
    stacks: StackDeployer,
    clusters: ClusterController,
    hooks: HookDispatcher,
}

impl EmrRunner {
    /// Resolve the configuration (phase 1) and set up the controllers
    pub fn new(
        resolver: ConfigResolver,
        services: Services,
        polls: PollSettings,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let config = resolver.load()?;
        Ok(Self::with_config(resolver, config, services, polls, cancel))
    }

    /// Session over a configuration already resolved by `resolver`
    pub fn with_config(
        resolver: ConfigResolver,
        config: ConfigDocument,
        services: Services,
        polls: PollSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stacks: StackDeployer::new(services.stacks.clone(), polls, cancel.clone()),
            clusters: ClusterController::new(services.clusters.clone(), polls, cancel),
            resolver,
            config,
            services,
            hooks: HookDispatcher::new(),
        }
    }

    /// Use `hooks` for `plugin:` actions
    pub fn with_hooks(mut self, hooks: HookDispatcher) -> Self {
        self.hooks = hooks;
        self
    }

    /// Current configuration
    pub fn config(&self) -> &ConfigDocument {
        &self.config
    }

    /// Run the hooks for `event`. Changes they make to the configuration are
    /// also recorded as resolver overrides so a later reload keeps them.
    async fn fire(&mut self, event: LifecycleEvent) -> Result<()> {
        if self.config.scripts_for(event.as_str()).is_empty() {
            return self.hooks.trigger(event, &mut self.config).await;
        }

        let before = serde_json::to_value(&self.config)?;
        self.hooks.trigger(event, &mut self.config).await?;
        let after = serde_json::to_value(&self.config)?;

        for (path, value) in changed_paths(&before, &after) {
            debug!(event = %event, path = %path, "Keeping hook change across reloads");
            self.resolver.add_override_config(path, value);
        }
        Ok(())
    }

    /// Check that every configured step can be encoded
    pub fn validate(&self) -> Result<()> {
        step::check_types(&self.config.steps)?;
        info!(
            name = %self.config.name,
            stack = %self.config.resource_stack_name(),
            steps = self.config.steps.len(),
            "Config file looks good"
        );
        Ok(())
    }

    /// Create or update the resource stack
    pub async fn deploy_resources(&mut self) -> Result<DeployOutcome> {
        self.fire(LifecycleEvent::BeforeDeployResources).await?;

        let outcome = self
            .stacks
            .deploy(
                &self.config.resource_stack_name(),
                &self.config.resources,
                self.config.deploy.stack_parameter_pairs(),
                self.config.stack_tag_pairs(),
            )
            .await?;
        info!(outcome = ?outcome, "Resources deployed");

        self.fire(LifecycleEvent::AfterDeployResources).await?;
        Ok(outcome)
    }

    /// Delete the resource stack
    pub async fn delete_resources(&mut self) -> Result<()> {
        self.fire(LifecycleEvent::BeforeDeleteResources).await?;
        self.stacks.delete_stack(&self.config.resource_stack_name()).await?;
        self.fire(LifecycleEvent::AfterDeleteResources).await
    }

    /// Re-resolve the configuration with the ids of the deployed resources.
    /// Edits made by `beforeLoadResources` hooks are reapplied on top.
    pub async fn load_resources(&mut self) -> Result<()> {
        self.fire(LifecycleEvent::BeforeLoadResources).await?;

        let resources = self
            .stacks
            .load_resources(&self.config.resource_stack_name())
            .await?;
        let account_id = self.services.account.account_id().await?;
        info!(account_id = %account_id, resources = resources.len(), "Loaded resources");

        self.config = self.resolver.reload_with_resources(account_id, resources)?;

        self.fire(LifecycleEvent::AfterLoadResources).await
    }

    /// Run the packaging hooks
    pub async fn package(&mut self) -> Result<()> {
        info!("Packaging");
        self.fire(LifecycleEvent::BeforePackage).await?;
        self.fire(LifecycleEvent::Package).await?;
        self.fire(LifecycleEvent::AfterPackage).await
    }

    /// Upload `deploy.packagePath` and tag it with the stack tags
    pub async fn upload_package(&mut self) -> Result<()> {
        self.fire(LifecycleEvent::BeforeUploadPackage).await?;

        match self.config.deploy.package_path.clone() {
            Some(path) => {
                let bucket = self.config.deploy.bucket()?.to_string();
                let key = self.config.deploy.package_name()?.to_string();
                self.services
                    .objects
                    .upload_file(Path::new(&path), &bucket, &key)
                    .await?;

                let tags = self.config.stack_tag_pairs();
                if !tags.is_empty() {
                    self.services.objects.apply_tags(&bucket, &key, &tags).await?;
                }
            }
            None => info!("No deploy.packagePath configured, nothing to upload"),
        }

        self.fire(LifecycleEvent::AfterUploadPackage).await
    }

    /// Start a cluster and leave it waiting for steps
    pub async fn start_cluster(&mut self) -> Result<String> {
        self.load_resources().await?;

        self.fire(LifecycleEvent::BeforeStartCluster).await?;
        let cluster_id = self
            .clusters
            .start(&self.config.cluster, &[ClusterState::Waiting])
            .await?;
        self.fire(LifecycleEvent::AfterStartCluster).await?;

        info!(cluster_id = %cluster_id, "Cluster started");
        Ok(cluster_id)
    }

    /// Terminate `cluster_id`, or the active cluster named after the config
    pub async fn terminate_cluster(&mut self, cluster_id: Option<String>) -> Result<String> {
        let cluster_id = self.target_cluster(cluster_id).await?;

        self.fire(LifecycleEvent::BeforeTerminateCluster).await?;
        let cluster_id = self.clusters.terminate(&cluster_id).await?;
        self.fire(LifecycleEvent::AfterTerminateCluster).await?;

        Ok(cluster_id)
    }

    /// Submit the configured steps to an existing cluster and wait for all
    /// of them
    pub async fn run_steps(&mut self, cluster_id: Option<String>) -> Result<Vec<String>> {
        step::check_types(&self.config.steps)?;

        self.load_resources().await?;
        self.package().await?;
        self.upload_package().await?;

        let steps = self.encoded_steps()?;
        let cluster_id = self.target_cluster(cluster_id).await?;

        self.fire(LifecycleEvent::BeforeSubmit).await?;
        let step_ids = self.clusters.add_steps(&cluster_id, &steps).await?;
        info!(
            cluster_id = %cluster_id,
            step_ids = ?step_ids,
            "Submitted steps, waiting for them to finish"
        );
        self.fire(LifecycleEvent::AfterSubmit).await?;

        self.clusters.wait_for_steps(&cluster_id, &step_ids).await?;
        self.fire(LifecycleEvent::AfterStepComplete).await?;

        Ok(step_ids)
    }

    /// Full flow: deploy resources, start a cluster with the steps attached
    /// and wait for it to finish. With `KeepJobFlowAliveWhenNoSteps` the
    /// cluster is left `WAITING`, otherwise it terminates after the steps.
    pub async fn run(&mut self) -> Result<String> {
        step::check_types(&self.config.steps)?;

        self.deploy_resources().await?;
        self.load_resources().await?;
        self.package().await?;
        self.upload_package().await?;

        let mut spec = self.config.cluster.clone();
        spec.steps.extend(self.encoded_steps()?);
        let keep_cluster = spec
            .instances
            .keep_job_flow_alive_when_no_steps
            .unwrap_or(false);

        self.fire(LifecycleEvent::BeforeRun).await?;
        let cluster_id = self.clusters.launch(&spec).await?;
        self.fire(LifecycleEvent::AfterRun).await?;

        if keep_cluster {
            self.clusters
                .wait_for_state(&cluster_id, &[ClusterState::Waiting])
                .await?;
            self.clusters.ensure_steps_succeeded(&cluster_id).await?;
            info!(cluster_id = %cluster_id, "Steps finished, cluster kept running");
        } else {
            self.clusters
                .wait_for_state(&cluster_id, &[ClusterState::Terminated])
                .await?;
            info!(cluster_id = %cluster_id, "Steps finished, cluster terminated");
        }

        self.fire(LifecycleEvent::AfterComplete).await?;
        Ok(cluster_id)
    }

    /// Terminate idle clusters named after the config
    pub async fn cleanup_idle(&self) -> Result<Vec<String>> {
        self.clusters
            .terminate_idle(&self.config.cluster.name, Utc::now())
            .await
    }

    /// Steps as they would be submitted
    pub fn encoded_steps(&self) -> Result<Vec<ExecutionStep>> {
        step::encode_all(&self.config.steps, &self.config.deploy)
    }

    async fn target_cluster(&self, cluster_id: Option<String>) -> Result<String> {
        match cluster_id {
            Some(id) => Ok(id),
            None => Ok(self.clusters.find_by_name(&self.config.cluster.name).await?.id),
        }
    }
}
