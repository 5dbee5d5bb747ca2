//! In-memory service fakes for tests

use crate::cluster::{ClusterApi, ClusterInfo, ClusterState, ClusterSummary, StepInfo, StepState};
use crate::document::{ClusterSpec, KeyValue};
use crate::error::{Result, RunnerError, StackEventSummary};
use crate::poll::{PollPolicy, PollSettings};
use crate::services::{AccountApi, ObjectStore, Services};
use crate::stack::{ChangeSetInfo, ChangeSetRequest, StackApi, StackSummary};
use crate::step::ExecutionStep;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Millisecond polls with a small attempt budget
pub fn fast_polls() -> PollSettings {
    PollSettings::uniform(PollPolicy::bounded(Duration::from_millis(1), 50))
}

// Stacks

struct StackRecord {
    status: String,
    body: Option<String>,
    change_sets: Vec<String>,
}

#[derive(Default)]
struct StackStore {
    stacks: HashMap<String, StackRecord>,
    pending: HashMap<String, ChangeSetRequest>,
    requests: Vec<ChangeSetRequest>,
    calls: Vec<String>,
    change_set_failure: Option<String>,
    execution_status: Option<String>,
    events: Vec<StackEventSummary>,
    resources: BTreeMap<String, String>,
}

/// Stack service that applies changesets to an in-memory stack table
#[derive(Default)]
pub struct FakeStackApi {
    store: Mutex<StackStore>,
}

impl FakeStackApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_request(&self) -> Option<ChangeSetRequest> {
        self.store.lock().unwrap().requests.last().cloned()
    }

    pub fn status(&self, stack: &str) -> Option<String> {
        self.store.lock().unwrap().stacks.get(stack).map(|s| s.status.clone())
    }

    pub fn calls(&self) -> Vec<String> {
        self.store.lock().unwrap().calls.clone()
    }

    pub fn calls_named(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.split(' ').next() == Some(name)).count()
    }

    pub fn change_sets(&self, stack: &str) -> Vec<String> {
        self.store
            .lock()
            .unwrap()
            .stacks
            .get(stack)
            .map(|s| s.change_sets.clone())
            .unwrap_or_default()
    }

    pub fn add_stale_change_set(&self, stack: &str, name: &str) {
        if let Some(record) = self.store.lock().unwrap().stacks.get_mut(stack) {
            record.change_sets.push(name.to_string());
        }
    }

    /// Every changeset fails with real changes
    pub fn fail_change_sets(&self, reason: &str) {
        self.store.lock().unwrap().change_set_failure = Some(reason.to_string());
    }

    /// Executions end in `status` instead of the expected complete state
    pub fn finish_executions_with(&self, status: &str) {
        self.store.lock().unwrap().execution_status = Some(status.to_string());
    }

    pub fn add_event(&self, logical_id: &str, status: &str, reason: Option<&str>) {
        self.store.lock().unwrap().events.push(StackEventSummary {
            logical_resource_id: logical_id.to_string(),
            resource_status: status.to_string(),
            resource_status_reason: reason.map(str::to_string),
        });
    }

    pub fn set_resources(&self, resources: BTreeMap<String, String>) {
        self.store.lock().unwrap().resources = resources;
    }
}

#[async_trait]
impl StackApi for FakeStackApi {
    async fn describe_stack(&self, name: &str) -> Result<Option<StackSummary>> {
        Ok(self.store.lock().unwrap().stacks.get(name).map(|s| StackSummary {
            name: name.to_string(),
            status: s.status.clone(),
            status_reason: None,
        }))
    }

    async fn list_change_sets(&self, stack: &str) -> Result<Vec<String>> {
        Ok(self.change_sets(stack))
    }

    async fn delete_change_set(&self, stack: &str, change_set: &str) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        store.calls.push(format!("delete_change_set {}", change_set));
        store.pending.remove(change_set);
        if let Some(record) = store.stacks.get_mut(stack) {
            record.change_sets.retain(|c| c != change_set);
        }
        Ok(())
    }

    async fn create_change_set(&self, request: &ChangeSetRequest) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        store.calls.push(format!("create_change_set {}", request.change_set_name));
        store.requests.push(request.clone());
        store.pending.insert(request.change_set_name.clone(), request.clone());

        let record = store
            .stacks
            .entry(request.stack_name.clone())
            .or_insert_with(|| StackRecord {
                status: "REVIEW_IN_PROGRESS".to_string(),
                body: None,
                change_sets: Vec::new(),
            });
        record.change_sets.push(request.change_set_name.clone());
        Ok(())
    }

    async fn describe_change_set(&self, stack: &str, change_set: &str) -> Result<ChangeSetInfo> {
        let store = self.store.lock().unwrap();
        let request = store
            .pending
            .get(change_set)
            .ok_or_else(|| RunnerError::config(format!("no changeset {}", change_set)))?;

        if let Some(reason) = &store.change_set_failure {
            return Ok(ChangeSetInfo {
                status: "FAILED".to_string(),
                change_count: 1,
                status_reason: Some(reason.clone()),
            });
        }

        let current = store.stacks.get(stack).and_then(|s| s.body.as_deref());
        if current == Some(request.template_body.as_str()) {
            Ok(ChangeSetInfo {
                status: "FAILED".to_string(),
                change_count: 0,
                status_reason: Some("The submitted information didn't contain changes.".to_string()),
            })
        } else {
            Ok(ChangeSetInfo {
                status: "CREATE_COMPLETE".to_string(),
                change_count: 1,
                status_reason: None,
            })
        }
    }

    async fn execute_change_set(&self, stack: &str, change_set: &str) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        store.calls.push(format!("execute_change_set {}", change_set));
        let request = store
            .pending
            .remove(change_set)
            .ok_or_else(|| RunnerError::config(format!("no changeset {}", change_set)))?;
        let status = store
            .execution_status
            .clone()
            .unwrap_or_else(|| request.operation.complete_status().to_string());

        if let Some(record) = store.stacks.get_mut(stack) {
            record.status = status;
            record.body = Some(request.template_body);
            record.change_sets.retain(|c| c != change_set);
        }
        Ok(())
    }

    async fn delete_stack(&self, name: &str) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        store.calls.push(format!("delete_stack {}", name));
        store.stacks.remove(name);
        Ok(())
    }

    async fn describe_stack_events(&self, _name: &str) -> Result<Vec<StackEventSummary>> {
        Ok(self.store.lock().unwrap().events.clone())
    }

    async fn describe_stack_resources(&self, name: &str) -> Result<BTreeMap<String, String>> {
        let store = self.store.lock().unwrap();
        if !store.stacks.contains_key(name) {
            return Err(RunnerError::StackNotFound(name.to_string()));
        }
        Ok(store.resources.clone())
    }
}

// Clusters

struct FakeCluster {
    id: String,
    name: String,
    states: VecDeque<ClusterState>,
    tags: Vec<KeyValue>,
    ready_at: Option<DateTime<Utc>>,
    submitted: Vec<ExecutionStep>,
}

impl FakeCluster {
    fn current(&self) -> ClusterState {
        self.states.front().cloned().unwrap_or(ClusterState::Waiting)
    }
}

#[derive(Default)]
struct ClusterStore {
    clusters: Vec<FakeCluster>,
    new_cluster_script: Vec<ClusterState>,
    launched: Vec<ClusterSpec>,
    step_scripts: HashMap<String, VecDeque<StepState>>,
    step_names: HashMap<String, String>,
    listed_steps: Vec<(String, StepInfo)>,
    step_failures: HashMap<String, String>,
    denied_steps: HashMap<String, String>,
    describe_step_calls: HashMap<String, u32>,
    after_listing: HashMap<String, ClusterState>,
    next_step: u32,
    terminated: Vec<String>,
}

impl ClusterStore {
    fn cluster_mut(&mut self, id: &str) -> Result<&mut FakeCluster> {
        self.clusters
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| RunnerError::config(format!("no cluster {}", id)))
    }
}

/// Cluster service replaying scripted state sequences. The last state of a
/// sequence sticks.
#[derive(Default)]
pub struct FakeClusterApi {
    store: Mutex<ClusterStore>,
}

impl FakeClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cluster(&self, id: &str, name: &str, state: ClusterState) {
        self.store.lock().unwrap().clusters.push(FakeCluster {
            id: id.to_string(),
            name: name.to_string(),
            states: VecDeque::from([state]),
            tags: Vec::new(),
            ready_at: None,
            submitted: Vec::new(),
        });
    }

    /// States the next launched cluster goes through
    pub fn script_new_cluster(&self, states: Vec<ClusterState>) {
        self.store.lock().unwrap().new_cluster_script = states;
    }

    /// States a step goes through, keyed by step id or step name
    pub fn script_step(&self, key: &str, states: Vec<StepState>) {
        self.store
            .lock()
            .unwrap()
            .step_scripts
            .insert(key.to_string(), states.into());
    }

    pub fn add_listed_step(
        &self,
        cluster_id: &str,
        step_id: &str,
        name: &str,
        state: StepState,
        ended_at: Option<DateTime<Utc>>,
    ) {
        self.store.lock().unwrap().listed_steps.push((
            cluster_id.to_string(),
            StepInfo {
                id: step_id.to_string(),
                name: name.to_string(),
                state,
                failure_reason: None,
                ended_at,
            },
        ));
    }

    /// Failure reason reported for a step once it fails
    pub fn set_step_failure(&self, step_id: &str, reason: &str) {
        self.store
            .lock()
            .unwrap()
            .step_failures
            .insert(step_id.to_string(), reason.to_string());
    }

    /// Describing the step fails with a permanent service error
    pub fn deny_describe_step(&self, step_id: &str, message: &str) {
        self.store
            .lock()
            .unwrap()
            .denied_steps
            .insert(step_id.to_string(), message.to_string());
    }

    pub fn describe_step_calls(&self, step_id: &str) -> u32 {
        self.store
            .lock()
            .unwrap()
            .describe_step_calls
            .get(step_id)
            .copied()
            .unwrap_or_default()
    }

    /// The cluster moves to `state` right after it is next listed
    pub fn set_state_after_listing(&self, cluster_id: &str, state: ClusterState) {
        self.store
            .lock()
            .unwrap()
            .after_listing
            .insert(cluster_id.to_string(), state);
    }

    pub fn set_tags(&self, cluster_id: &str, tags: Vec<KeyValue>) {
        if let Ok(cluster) = self.store.lock().unwrap().cluster_mut(cluster_id) {
            cluster.tags = tags;
        }
    }

    pub fn set_ready_at(&self, cluster_id: &str, at: DateTime<Utc>) {
        if let Ok(cluster) = self.store.lock().unwrap().cluster_mut(cluster_id) {
            cluster.ready_at = Some(at);
        }
    }

    pub fn cluster_state(&self, cluster_id: &str) -> Option<ClusterState> {
        self.store
            .lock()
            .unwrap()
            .cluster_mut(cluster_id)
            .ok()
            .map(|c| c.current())
    }

    pub fn launched_specs(&self) -> Vec<ClusterSpec> {
        self.store.lock().unwrap().launched.clone()
    }

    pub fn submitted_step_names(&self, cluster_id: &str) -> Vec<String> {
        self.store
            .lock()
            .unwrap()
            .cluster_mut(cluster_id)
            .map(|c| c.submitted.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.store.lock().unwrap().terminated.clone()
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn run_job_flow(&self, spec: &ClusterSpec) -> Result<String> {
        let mut store = self.store.lock().unwrap();
        store.launched.push(spec.clone());
        let id = format!("j-new-{}", store.launched.len());

        let mut states: VecDeque<ClusterState> = store.new_cluster_script.clone().into();
        if states.is_empty() {
            states.push_back(ClusterState::Waiting);
        }
        store.clusters.push(FakeCluster {
            id: id.clone(),
            name: spec.name.clone(),
            states,
            tags: spec.tags.clone(),
            ready_at: None,
            submitted: spec.steps.clone(),
        });
        Ok(id)
    }

    async fn describe_cluster(&self, cluster_id: &str) -> Result<ClusterInfo> {
        let mut store = self.store.lock().unwrap();
        let cluster = store.cluster_mut(cluster_id)?;
        let state = cluster.current();
        if cluster.states.len() > 1 {
            cluster.states.pop_front();
        }
        Ok(ClusterInfo {
            id: cluster.id.clone(),
            name: cluster.name.clone(),
            state,
            state_reason: None,
            ready_at: cluster.ready_at,
            tags: cluster.tags.clone(),
        })
    }

    async fn list_clusters(&self, states: &[ClusterState]) -> Result<Vec<ClusterSummary>> {
        let mut store = self.store.lock().unwrap();
        let listed: Vec<ClusterSummary> = store
            .clusters
            .iter()
            .filter(|c| states.contains(&c.current()))
            .map(|c| ClusterSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                state: c.current(),
            })
            .collect();

        let moves: Vec<(String, ClusterState)> = store.after_listing.drain().collect();
        for (id, state) in moves {
            store.cluster_mut(&id)?.states = VecDeque::from([state]);
        }
        Ok(listed)
    }

    async fn add_job_flow_steps(&self, cluster_id: &str, steps: &[ExecutionStep]) -> Result<Vec<String>> {
        let mut store = self.store.lock().unwrap();
        store.cluster_mut(cluster_id)?.submitted.extend(steps.iter().cloned());

        let mut ids = Vec::new();
        for step in steps {
            store.next_step += 1;
            let id = format!("s-{}", store.next_step);
            let script = store
                .step_scripts
                .remove(&step.name)
                .unwrap_or_else(|| VecDeque::from([StepState::Completed]));
            store.step_scripts.insert(id.clone(), script);
            store.step_names.insert(id.clone(), step.name.clone());
            ids.push(id);
        }
        Ok(ids)
    }

    async fn describe_step(&self, _cluster_id: &str, step_id: &str) -> Result<StepInfo> {
        let mut store = self.store.lock().unwrap();
        *store.describe_step_calls.entry(step_id.to_string()).or_default() += 1;
        if let Some(message) = store.denied_steps.get(step_id) {
            return Err(RunnerError::service("describe step", step_id, message));
        }
        let name = store.step_names.get(step_id).cloned().unwrap_or_default();
        let failure_reason = store.step_failures.get(step_id).cloned();
        let script = store
            .step_scripts
            .get_mut(step_id)
            .ok_or_else(|| RunnerError::config(format!("no step {}", step_id)))?;
        let state = script.front().cloned().unwrap_or(StepState::Completed);
        if script.len() > 1 {
            script.pop_front();
        }
        Ok(StepInfo {
            id: step_id.to_string(),
            name,
            failure_reason: failure_reason.filter(|_| state.is_failure()),
            state,
            ended_at: None,
        })
    }

    async fn list_steps(&self, cluster_id: &str, states: &[StepState]) -> Result<Vec<StepInfo>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .listed_steps
            .iter()
            .filter(|(cluster, step)| cluster == cluster_id && states.contains(&step.state))
            .map(|(_, step)| step.clone())
            .collect())
    }

    async fn terminate_job_flows(&self, cluster_id: &str) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        store.cluster_mut(cluster_id)?.states =
            VecDeque::from([ClusterState::Terminating, ClusterState::Terminated]);
        store.terminated.push(cluster_id.to_string());
        Ok(())
    }
}

// Objects and identity

/// Records uploads and tag requests
#[derive(Default)]
pub struct FakeObjectStore {
    uploads: Mutex<Vec<(PathBuf, String, String)>>,
    tags: Mutex<Vec<(String, String, Vec<KeyValue>)>>,
}

impl FakeObjectStore {
    pub fn uploads(&self) -> Vec<(PathBuf, String, String)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn tags(&self) -> Vec<(String, String, Vec<KeyValue>)> {
        self.tags.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn upload_file(&self, path: &Path, bucket: &str, key: &str) -> Result<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((path.to_path_buf(), bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn apply_tags(&self, bucket: &str, key: &str, tags: &[KeyValue]) -> Result<()> {
        self.tags
            .lock()
            .unwrap()
            .push((bucket.to_string(), key.to_string(), tags.to_vec()));
        Ok(())
    }
}

pub struct FakeAccount;

#[async_trait]
impl AccountApi for FakeAccount {
    async fn account_id(&self) -> Result<String> {
        Ok("123456789012".to_string())
    }
}

/// All fakes plus the [`Services`] bundle built from them
pub struct Fakes {
    pub stacks: Arc<FakeStackApi>,
    pub clusters: Arc<FakeClusterApi>,
    pub objects: Arc<FakeObjectStore>,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            stacks: Arc::new(FakeStackApi::new()),
            clusters: Arc::new(FakeClusterApi::new()),
            objects: Arc::new(FakeObjectStore::default()),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            stacks: self.stacks.clone(),
            clusters: self.clusters.clone(),
            objects: self.objects.clone(),
            account: Arc::new(FakeAccount),
        }
    }
}
