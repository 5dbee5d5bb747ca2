//! EMR-backed [`ClusterApi`]

use super::to_chrono;
use crate::cluster::{ClusterApi, ClusterInfo, ClusterState, ClusterSummary, StepInfo, StepState};
use crate::document::{self, ClusterSpec, KeyValue};
use crate::error::{Result, RunnerError};
use crate::step::ExecutionStep;
use async_trait::async_trait;
use aws_sdk_emr::types::{
    self as emr, ActionOnFailure, AutoTerminationPolicy, BootstrapActionConfig, ComputeLimits,
    ComputeLimitsUnitType, EbsBlockDeviceConfig, EbsConfiguration, HadoopJarStepConfig,
    InstanceFleetConfig, InstanceFleetType, InstanceGroupConfig, InstanceRoleType,
    InstanceTypeConfig, JobFlowInstancesConfig, ManagedScalingPolicy, MarketType, PlacementType,
    ScaleDownBehavior, ScriptBootstrapActionConfig, StepConfig, VolumeSpecification,
};
use aws_sdk_emr::Client;
use tracing::debug;

/// Cluster operations through the EMR API
pub struct EmrClusters {
    client: Client,
}

impl EmrClusters {
    /// Wrap an EMR client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client built from shared AWS config
    pub fn from_config(config: &aws_config::SdkConfig) -> Self {
        Self::new(Client::new(config))
    }
}

fn to_step_config(step: &ExecutionStep) -> StepConfig {
    let jar = HadoopJarStepConfig::builder()
        .jar(&step.hadoop_jar_step.jar)
        .set_main_class(step.hadoop_jar_step.main_class.clone())
        .set_args(Some(step.hadoop_jar_step.args.clone()))
        .set_properties(Some(
            step.hadoop_jar_step
                .properties
                .iter()
                .map(|p| emr::KeyValue::builder().key(&p.key).value(&p.value).build())
                .collect(),
        ))
        .build();

    StepConfig::builder()
        .name(&step.name)
        .action_on_failure(ActionOnFailure::from(step.action_on_failure.as_str()))
        .hadoop_jar_step(jar)
        .build()
}

fn to_application(app: &document::Application) -> emr::Application {
    emr::Application::builder()
        .name(&app.name)
        .set_version(app.version.clone())
        .set_args((!app.args.is_empty()).then(|| app.args.clone()))
        .build()
}

fn to_configuration(config: &document::Configuration) -> emr::Configuration {
    emr::Configuration::builder()
        .classification(&config.classification)
        .set_properties(Some(
            config
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ))
        .set_configurations(Some(config.configurations.iter().map(to_configuration).collect()))
        .build()
}

fn to_configurations(configs: &[document::Configuration]) -> Option<Vec<emr::Configuration>> {
    (!configs.is_empty()).then(|| configs.iter().map(to_configuration).collect())
}

fn to_ebs(ebs: &document::EbsConfiguration) -> EbsConfiguration {
    let devices = ebs
        .ebs_block_device_configs
        .iter()
        .map(|d| {
            let volume = VolumeSpecification::builder()
                .volume_type(&d.volume_specification.volume_type)
                .size_in_gb(d.volume_specification.size_in_gb)
                .set_iops(d.volume_specification.iops)
                .build();
            EbsBlockDeviceConfig::builder()
                .volume_specification(volume)
                .set_volumes_per_instance(d.volumes_per_instance)
                .build()
        })
        .collect();

    EbsConfiguration::builder()
        .set_ebs_block_device_configs(Some(devices))
        .set_ebs_optimized(ebs.ebs_optimized)
        .build()
}

fn to_instance_group(group: &document::InstanceGroup) -> InstanceGroupConfig {
    InstanceGroupConfig::builder()
        .set_name(group.name.clone())
        .instance_role(InstanceRoleType::from(group.instance_role.as_str()))
        .instance_type(&group.instance_type)
        .instance_count(group.instance_count)
        .set_market(group.market.as_deref().map(MarketType::from))
        .set_bid_price(group.bid_price.clone())
        .set_custom_ami_id(group.custom_ami_id.clone())
        .set_configurations(to_configurations(&group.configurations))
        .set_ebs_configuration(group.ebs_configuration.as_ref().map(to_ebs))
        .build()
}

fn to_instance_fleet(fleet: &document::InstanceFleet) -> InstanceFleetConfig {
    let types = fleet
        .instance_type_configs
        .iter()
        .map(|t| {
            InstanceTypeConfig::builder()
                .instance_type(&t.instance_type)
                .set_weighted_capacity(t.weighted_capacity)
                .set_bid_price(t.bid_price.clone())
                .set_configurations(to_configurations(&t.configurations))
                .set_ebs_configuration(t.ebs_configuration.as_ref().map(to_ebs))
                .build()
        })
        .collect();

    InstanceFleetConfig::builder()
        .set_name(fleet.name.clone())
        .instance_fleet_type(InstanceFleetType::from(fleet.instance_fleet_type.as_str()))
        .set_target_on_demand_capacity(fleet.target_on_demand_capacity)
        .set_target_spot_capacity(fleet.target_spot_capacity)
        .set_instance_type_configs(Some(types))
        .build()
}

fn non_empty(items: &[String]) -> Option<Vec<String>> {
    (!items.is_empty()).then(|| items.to_vec())
}

fn to_instances(spec: &document::InstancesSpec) -> JobFlowInstancesConfig {
    let groups: Vec<_> = spec.instance_groups.iter().map(to_instance_group).collect();
    let fleets: Vec<_> = spec.instance_fleets.iter().map(to_instance_fleet).collect();

    JobFlowInstancesConfig::builder()
        .set_ec2_key_name(spec.ec2_key_name.clone())
        .set_ec2_subnet_id(spec.ec2_subnet_id.clone())
        .set_ec2_subnet_ids(non_empty(&spec.ec2_subnet_ids))
        .set_placement(spec.placement.as_ref().map(|p| {
            PlacementType::builder()
                .set_availability_zone(p.availability_zone.clone())
                .set_availability_zones(non_empty(&p.availability_zones))
                .build()
        }))
        .set_keep_job_flow_alive_when_no_steps(spec.keep_job_flow_alive_when_no_steps)
        .set_termination_protected(spec.termination_protected)
        .set_master_instance_type(spec.master_instance_type.clone())
        .set_slave_instance_type(spec.slave_instance_type.clone())
        .set_instance_count(spec.instance_count)
        .set_instance_groups((!groups.is_empty()).then_some(groups))
        .set_instance_fleets((!fleets.is_empty()).then_some(fleets))
        .set_emr_managed_master_security_group(spec.emr_managed_master_security_group.clone())
        .set_emr_managed_slave_security_group(spec.emr_managed_slave_security_group.clone())
        .set_service_access_security_group(spec.service_access_security_group.clone())
        .set_additional_master_security_groups(non_empty(&spec.additional_master_security_groups))
        .set_additional_slave_security_groups(non_empty(&spec.additional_slave_security_groups))
        .build()
}

fn to_managed_scaling(policy: &document::ManagedScalingPolicy) -> ManagedScalingPolicy {
    let limits = &policy.compute_limits;
    ManagedScalingPolicy::builder()
        .compute_limits(
            ComputeLimits::builder()
                .unit_type(ComputeLimitsUnitType::from(limits.unit_type.as_str()))
                .minimum_capacity_units(limits.minimum_capacity_units)
                .maximum_capacity_units(limits.maximum_capacity_units)
                .set_maximum_on_demand_capacity_units(limits.maximum_on_demand_capacity_units)
                .set_maximum_core_capacity_units(limits.maximum_core_capacity_units)
                .build(),
        )
        .build()
}

fn to_bootstrap_action(action: &document::BootstrapAction) -> BootstrapActionConfig {
    let script = ScriptBootstrapActionConfig::builder()
        .path(&action.script_bootstrap_action.path)
        .set_args(Some(action.script_bootstrap_action.args.clone()))
        .build();

    BootstrapActionConfig::builder()
        .name(&action.name)
        .script_bootstrap_action(script)
        .build()
}

fn to_tags(tags: &[KeyValue]) -> Vec<emr::Tag> {
    tags.iter()
        .map(|t| emr::Tag::builder().key(&t.key).value(&t.value).build())
        .collect()
}

#[async_trait]
impl ClusterApi for EmrClusters {
    async fn run_job_flow(&self, spec: &ClusterSpec) -> Result<String> {
        let steps = spec.steps.iter().map(to_step_config).collect();
        let bootstrap_actions = spec.bootstrap_actions.iter().map(to_bootstrap_action).collect();

        debug!(spec = ?spec, "RunJobFlow request");

        let output = self
            .client
            .run_job_flow()
            .name(&spec.name)
            .set_log_uri(spec.log_uri.clone())
            .set_release_label(spec.release_label.clone())
            .set_custom_ami_id(spec.custom_ami_id.clone())
            .set_additional_info(spec.additional_info.clone())
            .set_applications(Some(spec.applications.iter().map(to_application).collect()))
            .set_configurations(Some(spec.configurations.iter().map(to_configuration).collect()))
            .instances(to_instances(&spec.instances))
            .set_job_flow_role(spec.job_flow_role.clone())
            .set_service_role(spec.service_role.clone())
            .set_auto_scaling_role(spec.auto_scaling_role.clone())
            .set_security_configuration(spec.security_configuration.clone())
            .set_scale_down_behavior(spec.scale_down_behavior.as_deref().map(ScaleDownBehavior::from))
            .set_ebs_root_volume_size(spec.ebs_root_volume_size)
            .set_visible_to_all_users(spec.visible_to_all_users)
            .set_step_concurrency_level(spec.step_concurrency_level)
            .set_managed_scaling_policy(spec.managed_scaling_policy.as_ref().map(to_managed_scaling))
            .set_auto_termination_policy(spec.auto_termination_policy.as_ref().map(|p| {
                AutoTerminationPolicy::builder()
                    .set_idle_timeout(p.idle_timeout)
                    .build()
            }))
            .set_bootstrap_actions(Some(bootstrap_actions))
            .set_steps(Some(steps))
            .set_tags(Some(to_tags(&spec.tags)))
            .send()
            .await
            .map_err(RunnerError::from_aws("start cluster", &spec.name))?;

        output
            .job_flow_id()
            .map(str::to_string)
            .ok_or_else(|| RunnerError::service("start cluster", &spec.name, "response has no cluster id"))
    }

    async fn describe_cluster(&self, cluster_id: &str) -> Result<ClusterInfo> {
        let output = self
            .client
            .describe_cluster()
            .cluster_id(cluster_id)
            .send()
            .await
            .map_err(RunnerError::from_aws("describe cluster", cluster_id))?;

        let cluster = output
            .cluster()
            .ok_or_else(|| RunnerError::service("describe cluster", cluster_id, "response has no cluster"))?;
        let status = cluster.status();

        Ok(ClusterInfo {
            id: cluster.id().unwrap_or(cluster_id).to_string(),
            name: cluster.name().unwrap_or_default().to_string(),
            state: ClusterState::parse(
                status
                    .and_then(|s| s.state())
                    .map(|s| s.as_str())
                    .unwrap_or_default(),
            ),
            state_reason: status
                .and_then(|s| s.state_change_reason())
                .and_then(|r| r.message())
                .map(str::to_string),
            ready_at: status
                .and_then(|s| s.timeline())
                .and_then(|t| t.ready_date_time())
                .and_then(to_chrono),
            tags: cluster
                .tags()
                .iter()
                .filter_map(|t| Some(KeyValue::new(t.key()?, t.value().unwrap_or_default())))
                .collect(),
        })
    }

    async fn list_clusters(&self, states: &[ClusterState]) -> Result<Vec<ClusterSummary>> {
        let mut clusters = Vec::new();
        let mut marker: Option<String> = None;
        let states: Vec<emr::ClusterState> = states
            .iter()
            .map(|s| emr::ClusterState::from(s.as_str()))
            .collect();

        loop {
            let output = self
                .client
                .list_clusters()
                .set_cluster_states(Some(states.clone()))
                .set_marker(marker.take())
                .send()
                .await
                .map_err(RunnerError::from_aws("list clusters", "emr"))?;

            clusters.extend(output.clusters().iter().map(|c| ClusterSummary {
                id: c.id().unwrap_or_default().to_string(),
                name: c.name().unwrap_or_default().to_string(),
                state: ClusterState::parse(
                    c.status()
                        .and_then(|s| s.state())
                        .map(|s| s.as_str())
                        .unwrap_or_default(),
                ),
            }));

            match output.marker() {
                Some(next) => marker = Some(next.to_string()),
                None => break,
            }
        }

        Ok(clusters)
    }

    async fn add_job_flow_steps(&self, cluster_id: &str, steps: &[ExecutionStep]) -> Result<Vec<String>> {
        let configs = steps.iter().map(to_step_config).collect();

        let output = self
            .client
            .add_job_flow_steps()
            .job_flow_id(cluster_id)
            .set_steps(Some(configs))
            .send()
            .await
            .map_err(RunnerError::from_aws("add steps to", cluster_id))?;

        Ok(output.step_ids().to_vec())
    }

    async fn describe_step(&self, cluster_id: &str, step_id: &str) -> Result<StepInfo> {
        let output = self
            .client
            .describe_step()
            .cluster_id(cluster_id)
            .step_id(step_id)
            .send()
            .await
            .map_err(RunnerError::from_aws("describe step", step_id))?;

        let step = output
            .step()
            .ok_or_else(|| RunnerError::service("describe step", step_id, "response has no step"))?;
        let status = step.status();

        Ok(StepInfo {
            id: step.id().unwrap_or(step_id).to_string(),
            name: step.name().unwrap_or_default().to_string(),
            state: StepState::parse(
                status
                    .and_then(|s| s.state())
                    .map(|s| s.as_str())
                    .unwrap_or_default(),
            ),
            failure_reason: status
                .and_then(|s| s.failure_details())
                .and_then(|f| f.message().or(f.reason()))
                .map(str::to_string),
            ended_at: status
                .and_then(|s| s.timeline())
                .and_then(|t| t.end_date_time())
                .and_then(to_chrono),
        })
    }

    async fn list_steps(&self, cluster_id: &str, states: &[StepState]) -> Result<Vec<StepInfo>> {
        let mut steps = Vec::new();
        let mut marker: Option<String> = None;
        let states: Vec<emr::StepState> = states
            .iter()
            .map(|s| emr::StepState::from(s.as_str()))
            .collect();

        loop {
            let output = self
                .client
                .list_steps()
                .cluster_id(cluster_id)
                .set_step_states(Some(states.clone()))
                .set_marker(marker.take())
                .send()
                .await
                .map_err(RunnerError::from_aws("list steps of", cluster_id))?;

            steps.extend(output.steps().iter().map(|s| {
                let status = s.status();
                StepInfo {
                    id: s.id().unwrap_or_default().to_string(),
                    name: s.name().unwrap_or_default().to_string(),
                    state: StepState::parse(
                        status
                            .and_then(|st| st.state())
                            .map(|st| st.as_str())
                            .unwrap_or_default(),
                    ),
                    failure_reason: status
                        .and_then(|st| st.failure_details())
                        .and_then(|f| f.message().or(f.reason()))
                        .map(str::to_string),
                    ended_at: status
                        .and_then(|st| st.timeline())
                        .and_then(|t| t.end_date_time())
                        .and_then(to_chrono),
                }
            }));

            match output.marker() {
                Some(next) => marker = Some(next.to_string()),
                None => break,
            }
        }

        Ok(steps)
    }

    async fn terminate_job_flows(&self, cluster_id: &str) -> Result<()> {
        self.client
            .terminate_job_flows()
            .job_flow_ids(cluster_id)
            .send()
            .await
            .map_err(RunnerError::from_aws("terminate cluster", cluster_id))?;
        Ok(())
    }
}
