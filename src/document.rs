//! Resolved configuration document
//!
//! The resolver works on an untyped `serde_json::Value` tree (tag merging
//! and overrides are tree operations) and converts the result into
//! [`ConfigDocument`] at the end.

use crate::error::{Result, RunnerError};
use crate::step::{ExecutionStep, StepConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Tag key read by idle termination
pub const MAX_IDLE_MINUTES_TAG: &str = "maxIdleMinutes";

/// `Key`/`Value` pair used for tags and step properties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyValue {
    /// Key
    pub key: String,
    /// Value
    #[serde(deserialize_with = "de::scalar_string")]
    pub value: String,
}

impl KeyValue {
    /// Create a pair
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Fully resolved configuration for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    /// Pipeline name
    pub name: String,

    /// Deployment settings
    pub deploy: DeployConfig,

    /// EMR cluster definition
    pub cluster: ClusterSpec,

    /// Declarative steps
    #[serde(default)]
    pub steps: Vec<StepConfig>,

    /// CloudFormation resource definitions for the resource stack
    #[serde(default)]
    pub resources: BTreeMap<String, Value>,

    /// Tags applied to the stack, the cluster and the uploaded package,
    /// in declaration order
    #[serde(
        default,
        deserialize_with = "de::pairs_from_map",
        serialize_with = "de::pairs_to_map"
    )]
    pub stack_tags: Vec<KeyValue>,

    /// Lifecycle event name to ordered actions
    #[serde(default, deserialize_with = "de::script_map")]
    pub scripts: BTreeMap<String, Vec<String>>,
}

impl ConfigDocument {
    /// Convert a resolved tree, checking the required top-level keys first
    pub fn from_tree(tree: Value) -> Result<Self> {
        let map = tree
            .as_object()
            .ok_or_else(|| RunnerError::config("config document must be a mapping"))?;

        for key in ["name", "deploy", "cluster"] {
            if map.get(key).is_none_or(Value::is_null) {
                return Err(RunnerError::config(format!(
                    "missing required top-level key '{}'",
                    key
                )));
            }
        }

        serde_json::from_value(tree).map_err(|e| RunnerError::config(format!("invalid config: {}", e)))
    }

    /// Name of the resource stack: `<name>-resources-<environment>`
    pub fn resource_stack_name(&self) -> String {
        format!("{}-resources-{}", self.name, self.deploy.environment)
    }

    /// Stack tags as key/value pairs in declaration order
    pub fn stack_tag_pairs(&self) -> Vec<KeyValue> {
        self.stack_tags.clone()
    }

    /// Actions configured for a lifecycle event
    pub fn scripts_for(&self, event: &str) -> &[String] {
        self.scripts.get(event).map(Vec::as_slice).unwrap_or_default()
    }

    /// Canonical JSON form, used for logging and comparison
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Deployment settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployConfig {
    /// AWS region; the SDK default chain decides when absent
    #[serde(default)]
    pub region: Option<String>,

    /// Deployment environment (`prod`, `dev`, ...)
    pub environment: String,

    /// Local path of the packaged artifact
    #[serde(default)]
    pub package_path: Option<String>,

    /// Bucket the artifact is uploaded to
    #[serde(default, alias = "bucket")]
    pub bucket_name: Option<String>,

    /// Object key of the uploaded artifact
    #[serde(default, alias = "artifactName")]
    pub deploy_package_name: Option<String>,

    /// Resource stack parameters
    #[serde(default, deserialize_with = "de::string_map")]
    pub stack_parameters: BTreeMap<String, String>,

    /// Idle threshold written to the cluster as the `maxIdleMinutes` tag
    #[serde(default)]
    pub max_idle_minutes: Option<u32>,
}

impl DeployConfig {
    /// Minimal settings for an environment
    pub fn for_environment(environment: impl Into<String>) -> Self {
        Self {
            region: None,
            environment: environment.into(),
            package_path: None,
            bucket_name: None,
            deploy_package_name: None,
            stack_parameters: BTreeMap::new(),
            max_idle_minutes: None,
        }
    }

    /// Bucket, failing when unset
    pub fn bucket(&self) -> Result<&str> {
        self.bucket_name
            .as_deref()
            .ok_or_else(|| RunnerError::config("deploy.bucketName is not set"))
    }

    /// Artifact key, failing when unset
    pub fn package_name(&self) -> Result<&str> {
        self.deploy_package_name
            .as_deref()
            .ok_or_else(|| RunnerError::config("deploy.deployPackageName is not set"))
    }

    /// Stack parameters as key/value pairs in key order
    pub fn stack_parameter_pairs(&self) -> Vec<KeyValue> {
        self.stack_parameters
            .iter()
            .map(|(k, v)| KeyValue::new(k, v))
            .collect()
    }

    /// `s3://bucket/key` of the uploaded artifact
    pub fn artifact_location(&self) -> Result<String> {
        Ok(format!("s3://{}/{}", self.bucket()?, self.package_name()?))
    }
}

/// EMR cluster definition (RunJobFlow request shape)
///
/// Keys that are not modelled here are rejected rather than dropped, so a
/// typo or an unsupported RunJobFlow option fails resolution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ClusterSpec {
    /// Cluster name, also the prefix used to find the cluster later
    pub name: String,
    /// S3 location for cluster logs
    #[serde(default)]
    pub log_uri: Option<String>,
    /// EMR release, e.g. `emr-6.15.0`
    #[serde(default)]
    pub release_label: Option<String>,
    /// Custom AMI for every node
    #[serde(default)]
    pub custom_ami_id: Option<String>,
    /// Free-form JSON passed through to EMR
    #[serde(default)]
    pub additional_info: Option<String>,
    /// Applications to install
    #[serde(default)]
    pub applications: Vec<Application>,
    /// Cluster-wide configuration classifications
    #[serde(default)]
    pub configurations: Vec<Configuration>,
    /// Node layout and networking
    #[serde(default)]
    pub instances: InstancesSpec,
    /// EC2 instance profile of the nodes
    #[serde(default)]
    pub job_flow_role: Option<String>,
    /// Service role EMR acts as
    #[serde(default)]
    pub service_role: Option<String>,
    /// Role used by automatic scaling
    #[serde(default)]
    pub auto_scaling_role: Option<String>,
    /// Named security configuration
    #[serde(default)]
    pub security_configuration: Option<String>,
    /// `TERMINATE_AT_INSTANCE_HOUR` or `TERMINATE_AT_TASK_COMPLETION`
    #[serde(default)]
    pub scale_down_behavior: Option<String>,
    /// Root EBS volume size in GiB
    #[serde(default, deserialize_with = "de::lenient_i32")]
    pub ebs_root_volume_size: Option<i32>,
    /// Whether every IAM user of the account can see the cluster
    #[serde(default)]
    pub visible_to_all_users: Option<bool>,
    /// Number of steps that may run at once
    #[serde(default, deserialize_with = "de::lenient_i32")]
    pub step_concurrency_level: Option<i32>,
    /// Managed scaling limits
    #[serde(default)]
    pub managed_scaling_policy: Option<ManagedScalingPolicy>,
    /// Idle auto-termination
    #[serde(default)]
    pub auto_termination_policy: Option<AutoTerminationPolicy>,
    /// Scripts run on every node before applications start
    #[serde(default)]
    pub bootstrap_actions: Vec<BootstrapAction>,
    /// Steps attached at creation
    #[serde(default)]
    pub steps: Vec<ExecutionStep>,
    /// Cluster tags (config tags, computed tags, then stack tags)
    #[serde(default)]
    pub tags: Vec<KeyValue>,
}

/// Application installed on the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Application {
    /// Application name, e.g. `Spark`
    pub name: String,
    /// Pinned version
    #[serde(default)]
    pub version: Option<String>,
    /// Application arguments
    #[serde(default)]
    pub args: Vec<String>,
}

/// Configuration classification, possibly nested
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Configuration {
    /// Classification, e.g. `spark-defaults`
    pub classification: String,
    /// Properties of the classification
    #[serde(default, deserialize_with = "de::string_map")]
    pub properties: BTreeMap<String, String>,
    /// Nested classifications
    #[serde(default)]
    pub configurations: Vec<Configuration>,
}

/// Node layout and networking of the cluster
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct InstancesSpec {
    /// Key pair for SSH access
    #[serde(default)]
    pub ec2_key_name: Option<String>,
    /// Subnet to launch in
    #[serde(default)]
    pub ec2_subnet_id: Option<String>,
    /// Candidate subnets, used with instance fleets
    #[serde(default)]
    pub ec2_subnet_ids: Vec<String>,
    /// Availability zone placement
    #[serde(default)]
    pub placement: Option<Placement>,
    /// Keep the cluster `WAITING` once the steps are done
    #[serde(default)]
    pub keep_job_flow_alive_when_no_steps: Option<bool>,
    /// Protect the nodes from termination
    #[serde(default)]
    pub termination_protected: Option<bool>,
    /// Uniform layout: master node type
    #[serde(default)]
    pub master_instance_type: Option<String>,
    /// Uniform layout: core node type
    #[serde(default)]
    pub slave_instance_type: Option<String>,
    /// Uniform layout: node count
    #[serde(default, deserialize_with = "de::lenient_i32")]
    pub instance_count: Option<i32>,
    /// Instance group layout
    #[serde(default)]
    pub instance_groups: Vec<InstanceGroup>,
    /// Instance fleet layout
    #[serde(default)]
    pub instance_fleets: Vec<InstanceFleet>,
    /// Managed security group of the master node
    #[serde(default)]
    pub emr_managed_master_security_group: Option<String>,
    /// Managed security group of the core and task nodes
    #[serde(default)]
    pub emr_managed_slave_security_group: Option<String>,
    /// Security group for service access in private subnets
    #[serde(default)]
    pub service_access_security_group: Option<String>,
    /// Extra security groups of the master node
    #[serde(default)]
    pub additional_master_security_groups: Vec<String>,
    /// Extra security groups of the core and task nodes
    #[serde(default)]
    pub additional_slave_security_groups: Vec<String>,
}

/// Availability zone placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Placement {
    /// Single availability zone
    #[serde(default)]
    pub availability_zone: Option<String>,
    /// Candidate availability zones, used with instance fleets
    #[serde(default)]
    pub availability_zones: Vec<String>,
}

/// Uniform group of nodes with one role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct InstanceGroup {
    /// Group name
    #[serde(default)]
    pub name: Option<String>,
    /// `MASTER`, `CORE` or `TASK`
    pub instance_role: String,
    /// EC2 instance type
    pub instance_type: String,
    /// Number of nodes
    pub instance_count: i32,
    /// `ON_DEMAND` or `SPOT`
    #[serde(default)]
    pub market: Option<String>,
    /// Spot bid price in USD
    #[serde(default)]
    pub bid_price: Option<String>,
    /// Custom AMI for this group
    #[serde(default)]
    pub custom_ami_id: Option<String>,
    /// Classifications applied to this group only
    #[serde(default)]
    pub configurations: Vec<Configuration>,
    /// Attached EBS volumes
    #[serde(default)]
    pub ebs_configuration: Option<EbsConfiguration>,
}

/// Mixed-type fleet of nodes with one role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct InstanceFleet {
    /// Fleet name
    #[serde(default)]
    pub name: Option<String>,
    /// `MASTER`, `CORE` or `TASK`
    pub instance_fleet_type: String,
    /// On-demand capacity units
    #[serde(default, deserialize_with = "de::lenient_i32")]
    pub target_on_demand_capacity: Option<i32>,
    /// Spot capacity units
    #[serde(default, deserialize_with = "de::lenient_i32")]
    pub target_spot_capacity: Option<i32>,
    /// Instance types the fleet may use
    #[serde(default)]
    pub instance_type_configs: Vec<InstanceTypeConfig>,
}

/// Instance type option of a fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct InstanceTypeConfig {
    /// EC2 instance type
    pub instance_type: String,
    /// Capacity units one instance counts for
    #[serde(default, deserialize_with = "de::lenient_i32")]
    pub weighted_capacity: Option<i32>,
    /// Spot bid price in USD
    #[serde(default)]
    pub bid_price: Option<String>,
    /// Classifications applied to this instance type
    #[serde(default)]
    pub configurations: Vec<Configuration>,
    /// Attached EBS volumes
    #[serde(default)]
    pub ebs_configuration: Option<EbsConfiguration>,
}

/// EBS volumes attached to each instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct EbsConfiguration {
    /// Volumes attached to each instance
    #[serde(default)]
    pub ebs_block_device_configs: Vec<EbsBlockDeviceConfig>,
    /// EBS-optimised instances
    #[serde(default)]
    pub ebs_optimized: Option<bool>,
}

/// Group of identical EBS volumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct EbsBlockDeviceConfig {
    /// Volume shape
    pub volume_specification: VolumeSpecification,
    /// Number of such volumes per instance
    #[serde(default)]
    pub volumes_per_instance: Option<i32>,
}

/// EBS volume shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct VolumeSpecification {
    /// `gp2`, `gp3`, `io1`, ...
    pub volume_type: String,
    /// Size in GiB
    #[serde(rename = "SizeInGB")]
    pub size_in_gb: i32,
    /// Provisioned IOPS
    #[serde(default)]
    pub iops: Option<i32>,
}

/// Managed scaling configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ManagedScalingPolicy {
    /// Scaling bounds
    pub compute_limits: ComputeLimits,
}

/// Capacity bounds of managed scaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ComputeLimits {
    /// `Instances`, `InstanceFleetUnits` or `VCPU`
    pub unit_type: String,
    /// Lower bound
    pub minimum_capacity_units: i32,
    /// Upper bound
    pub maximum_capacity_units: i32,
    /// Upper bound for on-demand capacity
    #[serde(default)]
    pub maximum_on_demand_capacity_units: Option<i32>,
    /// Upper bound for core nodes
    #[serde(default)]
    pub maximum_core_capacity_units: Option<i32>,
}

/// Auto-termination after a period of idleness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct AutoTerminationPolicy {
    /// Idle seconds before EMR terminates the cluster
    #[serde(default)]
    pub idle_timeout: Option<i64>,
}

/// Named bootstrap script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct BootstrapAction {
    /// Action name
    pub name: String,
    /// Script to run
    pub script_bootstrap_action: ScriptBootstrapAction,
}

/// Script location and arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ScriptBootstrapAction {
    /// S3 path of the script
    pub path: String,
    /// Script arguments
    #[serde(default)]
    pub args: Vec<String>,
}

/// Render a scalar as tag text (`true`, `3`, `abc`)
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(_) | Value::Number(_) => Some(value.to_string()),
        _ => None,
    }
}

/// Deep-merge `layer` into `base`: objects merge key by key, anything else replaces.
pub fn deep_merge(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base_map), Value::Object(layer_map)) => {
            for (key, value) in layer_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

/// Set the value at a dotted path, creating intermediate mappings.
///
/// Numeric segments index into existing arrays.
pub fn set_path(tree: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(RunnerError::config(format!("invalid override path '{}'", path)));
    }

    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| RunnerError::config("empty override path"))?;

    let mut current = tree;
    for segment in parents {
        current = child_mut(current, segment, path)?;
    }

    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let slot = last
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| {
                    RunnerError::config(format!("override path '{}' indexes past an array", path))
                })?;
            *slot = value;
            Ok(())
        }
        _ => Err(RunnerError::config(format!(
            "override path '{}' crosses a scalar value",
            path
        ))),
    }
}

/// Dotted paths and new values of everything that differs between two trees.
///
/// Objects are compared key by key; arrays and scalars are replaced whole.
/// A removed key is reported as `null`. Keys containing `.` cannot be
/// addressed by a dotted path, so their parent object is reported whole.
pub fn changed_paths(before: &Value, after: &Value) -> Vec<(String, Value)> {
    let mut changes = Vec::new();
    collect_changes("", before, after, &mut changes);
    changes
}

fn collect_changes(path: &str, before: &Value, after: &Value, changes: &mut Vec<(String, Value)>) {
    if before == after {
        return;
    }

    let (Value::Object(old), Value::Object(new)) = (before, after) else {
        changes.push((path.to_string(), after.clone()));
        return;
    };
    if !path.is_empty() && new.keys().chain(old.keys()).any(|k| k.contains('.')) {
        changes.push((path.to_string(), after.clone()));
        return;
    }

    let join = |key: &str| {
        if path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", path, key)
        }
    };
    for (key, value) in new {
        match old.get(key) {
            Some(previous) => collect_changes(&join(key), previous, value, changes),
            None => changes.push((join(key), value.clone())),
        }
    }
    for key in old.keys().filter(|k| !new.contains_key(*k)) {
        changes.push((join(key), Value::Null));
    }
}

fn child_mut<'a>(current: &'a mut Value, segment: &str, path: &str) -> Result<&'a mut Value> {
    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => Ok(map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()))),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(move |i| items.get_mut(i))
            .ok_or_else(|| {
                RunnerError::config(format!("override path '{}' indexes past an array", path))
            }),
        _ => Err(RunnerError::config(format!(
            "override path '{}' crosses a scalar value",
            path
        ))),
    }
}

/// `cluster.Tags = existing ++ computed ++ stackTags`
pub fn merge_cluster_tags(tree: &mut Value, computed: Vec<KeyValue>) -> Result<()> {
    let stack_tags: Vec<Value> = match tree.get("stackTags") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                scalar_to_string(v)
                    .map(|v| serde_json::json!({"Key": k, "Value": v}))
                    .ok_or_else(|| {
                        RunnerError::config(format!("stackTags.{} must be a scalar", k))
                    })
            })
            .collect::<Result<_>>()?,
        Some(_) => return Err(RunnerError::config("stackTags must be a mapping")),
    };

    let cluster = tree
        .get_mut("cluster")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| RunnerError::config("cluster must be a mapping"))?;

    let mut tags = match cluster.remove("Tags") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(RunnerError::config("cluster.Tags must be a list")),
    };

    for tag in computed {
        tags.push(serde_json::to_value(tag)?);
    }
    tags.extend(stack_tags);

    cluster.insert("Tags".to_string(), Value::Array(tags));
    Ok(())
}

mod de {
    use super::{scalar_to_string, KeyValue};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::{Map, Value};
    use std::collections::BTreeMap;

    pub fn scalar_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        let value = Value::deserialize(d)?;
        scalar_to_string(&value).ok_or_else(|| D::Error::custom("expected a scalar value"))
    }

    pub fn string_map<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<BTreeMap<String, String>, D::Error> {
        let raw = Option::<BTreeMap<String, Value>>::deserialize(d)?.unwrap_or_default();
        raw.into_iter()
            .map(|(k, v)| match scalar_to_string(&v) {
                Some(s) => Ok((k, s)),
                None => Err(D::Error::custom(format!("value of '{}' must be a scalar", k))),
            })
            .collect()
    }

    /// Mapping of scalars to pairs, keeping the mapping's order
    pub fn pairs_from_map<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<KeyValue>, D::Error> {
        let raw = Option::<Map<String, Value>>::deserialize(d)?.unwrap_or_default();
        raw.into_iter()
            .map(|(k, v)| match scalar_to_string(&v) {
                Some(s) => Ok(KeyValue::new(k, s)),
                None => Err(D::Error::custom(format!("value of '{}' must be a scalar", k))),
            })
            .collect()
    }

    pub fn pairs_to_map<S: Serializer>(pairs: &[KeyValue], s: S) -> Result<S::Ok, S::Error> {
        s.collect_map(pairs.iter().map(|p| (&p.key, &p.value)))
    }

    pub fn lenient_i32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i32>, D::Error> {
        match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| D::Error::custom("expected a 32-bit integer")),
            Some(Value::String(s)) => s
                .trim()
                .parse::<i32>()
                .map(Some)
                .map_err(|_| D::Error::custom(format!("expected an integer, got '{}'", s))),
            Some(_) => Err(D::Error::custom("expected an integer")),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    pub fn script_map<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<BTreeMap<String, Vec<String>>, D::Error> {
        let raw = Option::<BTreeMap<String, Option<OneOrMany>>>::deserialize(d)?.unwrap_or_default();
        Ok(raw
            .into_iter()
            .map(|(event, actions)| {
                let actions = match actions {
                    None => Vec::new(),
                    Some(OneOrMany::One(s)) => vec![s],
                    Some(OneOrMany::Many(v)) => v,
                };
                (event, actions)
            })
            .collect())
    }
}
