//! EMR cluster lifecycle
//!
//! Starting, step submission, step tracking, termination, lookup by name and
//! idle cleanup. All waits go through the shared poll primitive with the
//! cluster and step policies from [`PollSettings`].

use crate::document::{ClusterSpec, KeyValue, MAX_IDLE_MINUTES_TAG};
use crate::error::{Result, RunnerError};
use crate::poll::{poll_until, PollResult, PollSettings};
use crate::step::ExecutionStep;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cluster states reported by EMR
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterState {
    /// Provisioning instances
    Starting,
    /// Running bootstrap actions
    Bootstrapping,
    /// Running a step
    Running,
    /// Idle and accepting steps
    Waiting,
    /// Shutting down
    Terminating,
    /// Shut down normally
    Terminated,
    /// Shut down after a failure
    TerminatedWithErrors,
    /// State this crate does not know about
    Unknown(String),
}

impl ClusterState {
    /// Parse the service representation
    pub fn parse(value: &str) -> Self {
        match value {
            "STARTING" => Self::Starting,
            "BOOTSTRAPPING" => Self::Bootstrapping,
            "RUNNING" => Self::Running,
            "WAITING" => Self::Waiting,
            "TERMINATING" => Self::Terminating,
            "TERMINATED" => Self::Terminated,
            "TERMINATED_WITH_ERRORS" => Self::TerminatedWithErrors,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Service representation
    pub fn as_str(&self) -> &str {
        match self {
            Self::Starting => "STARTING",
            Self::Bootstrapping => "BOOTSTRAPPING",
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
            Self::TerminatedWithErrors => "TERMINATED_WITH_ERRORS",
            Self::Unknown(s) => s,
        }
    }

    /// No further transitions happen from this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::TerminatedWithErrors)
    }

    /// States that count as an active cluster when looking one up by name
    pub fn active() -> [ClusterState; 4] {
        [Self::Starting, Self::Bootstrapping, Self::Running, Self::Waiting]
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step states reported by EMR
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepState {
    /// Queued
    Pending,
    /// Cancellation requested
    CancelPending,
    /// Running on the cluster
    Running,
    /// Finished successfully
    Completed,
    /// Cancelled before or while running
    Cancelled,
    /// Finished with an error
    Failed,
    /// Stopped by a cluster shutdown
    Interrupted,
    /// State this crate does not know about
    Unknown(String),
}

impl StepState {
    /// Parse the service representation
    pub fn parse(value: &str) -> Self {
        match value {
            "PENDING" => Self::Pending,
            "CANCEL_PENDING" => Self::CancelPending,
            "RUNNING" => Self::Running,
            "COMPLETED" => Self::Completed,
            "CANCELLED" => Self::Cancelled,
            "FAILED" => Self::Failed,
            "INTERRUPTED" => Self::Interrupted,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Service representation
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::CancelPending => "CANCEL_PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
            Self::Interrupted => "INTERRUPTED",
            Self::Unknown(s) => s,
        }
    }

    /// Terminal states other than `COMPLETED`
    pub fn failing() -> [StepState; 3] {
        [Self::Cancelled, Self::Failed, Self::Interrupted]
    }

    /// Every terminal state
    pub fn finished() -> [StepState; 4] {
        [Self::Completed, Self::Cancelled, Self::Failed, Self::Interrupted]
    }

    /// One of [`StepState::failing`]
    pub fn is_failure(&self) -> bool {
        Self::failing().contains(self)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster details from a describe call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    /// Cluster id (`j-...`)
    pub id: String,
    /// Cluster name
    pub name: String,
    /// Current state
    pub state: ClusterState,
    /// State change reason message
    pub state_reason: Option<String>,
    /// When the cluster became ready for work
    pub ready_at: Option<DateTime<Utc>>,
    /// Cluster tags
    pub tags: Vec<KeyValue>,
}

impl ClusterInfo {
    /// Value of the tag `key`
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

/// Cluster entry from a list call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSummary {
    /// Cluster id
    pub id: String,
    /// Cluster name
    pub name: String,
    /// State at listing time
    pub state: ClusterState,
}

/// Step details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInfo {
    /// Step id (`s-...`)
    pub id: String,
    /// Step name
    pub name: String,
    /// Current state
    pub state: StepState,
    /// Failure reason for failed steps
    pub failure_reason: Option<String>,
    /// When the step finished
    pub ended_at: Option<DateTime<Utc>>,
}

/// Cluster management service
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create a cluster, returning its id
    async fn run_job_flow(&self, spec: &ClusterSpec) -> Result<String>;

    /// Current details of one cluster
    async fn describe_cluster(&self, cluster_id: &str) -> Result<ClusterInfo>;

    /// Clusters in any of `states`, in service listing order
    async fn list_clusters(&self, states: &[ClusterState]) -> Result<Vec<ClusterSummary>>;

    /// Submit steps, returning their ids in submission order
    async fn add_job_flow_steps(&self, cluster_id: &str, steps: &[ExecutionStep]) -> Result<Vec<String>>;

    /// Current details of one step
    async fn describe_step(&self, cluster_id: &str, step_id: &str) -> Result<StepInfo>;

    /// Steps of the cluster in any of `states`
    async fn list_steps(&self, cluster_id: &str, states: &[StepState]) -> Result<Vec<StepInfo>>;

    /// Request termination without waiting
    async fn terminate_job_flows(&self, cluster_id: &str) -> Result<()>;
}

/// Drives cluster and step state through the cluster service
pub struct ClusterController {
    api: Arc<dyn ClusterApi>,
    polls: PollSettings,
    cancel: CancellationToken,
}

impl ClusterController {
    /// Controller over `api`, waiting with `polls` until `cancel` fires
    pub fn new(api: Arc<dyn ClusterApi>, polls: PollSettings, cancel: CancellationToken) -> Self {
        Self { api, polls, cancel }
    }

    /// Create a cluster without waiting for it
    pub async fn launch(&self, spec: &ClusterSpec) -> Result<String> {
        let cluster_id = self.api.run_job_flow(spec).await?;
        info!(cluster_id = %cluster_id, name = %spec.name, "Cluster created");
        Ok(cluster_id)
    }

    /// Create a cluster and wait until it reaches one of `ready_states`
    pub async fn start(&self, spec: &ClusterSpec, ready_states: &[ClusterState]) -> Result<String> {
        let cluster_id = self.launch(spec).await?;
        self.wait_for_state(&cluster_id, ready_states).await?;
        Ok(cluster_id)
    }

    /// Wait until the cluster reaches one of `ready_states`.
    ///
    /// `TERMINATED_WITH_ERRORS` always fails. `TERMINATED` fails when it is
    /// not a ready state or when any step ended in a failing state.
    pub async fn wait_for_state(
        &self,
        cluster_id: &str,
        ready_states: &[ClusterState],
    ) -> Result<ClusterState> {
        info!(
            cluster_id = %cluster_id,
            states = ?ready_states.iter().map(ClusterState::as_str).collect::<Vec<_>>(),
            "Waiting for cluster"
        );

        let api = &self.api;
        let this = self;
        let state = poll_until(
            &format!("cluster {}", cluster_id),
            self.polls.cluster,
            &self.cancel,
            move |_| async move {
                let info = api.describe_cluster(cluster_id).await?;
                debug!(cluster_id = %cluster_id, state = %info.state, "Cluster state");

                match info.state {
                    ClusterState::TerminatedWithErrors => Ok(PollResult::Fail(RunnerError::ClusterFailed {
                        cluster_id: cluster_id.to_string(),
                        state: info.state.to_string(),
                        reason: info.state_reason.unwrap_or_default(),
                    })),
                    ClusterState::Terminated => {
                        this.ensure_steps_succeeded(cluster_id).await?;
                        if ready_states.contains(&ClusterState::Terminated) {
                            Ok(PollResult::Done(info.state))
                        } else {
                            Ok(PollResult::Fail(RunnerError::ClusterFailed {
                                cluster_id: cluster_id.to_string(),
                                state: info.state.to_string(),
                                reason: info
                                    .state_reason
                                    .unwrap_or_else(|| "terminated before becoming ready".to_string()),
                            }))
                        }
                    }
                    state if ready_states.contains(&state) => Ok(PollResult::Done(state)),
                    _ => Ok(PollResult::Retry),
                }
            },
        )
        .await?;

        info!(cluster_id = %cluster_id, state = %state, "Cluster reached state");
        Ok(state)
    }

    /// Fail with [`RunnerError::ClusterFailed`] when any step ended cancelled,
    /// failed or interrupted
    pub async fn ensure_steps_succeeded(&self, cluster_id: &str) -> Result<()> {
        let failed = self.api.list_steps(cluster_id, &StepState::failing()).await?;
        if failed.is_empty() {
            return Ok(());
        }

        let reason = failed
            .iter()
            .map(|s| format!("{} ({}) {}", s.name, s.id, s.state))
            .collect::<Vec<_>>()
            .join(", ");
        Err(RunnerError::ClusterFailed {
            cluster_id: cluster_id.to_string(),
            state: "steps failed".to_string(),
            reason,
        })
    }

    /// Submit steps; ids come back in submission order
    pub async fn add_steps(&self, cluster_id: &str, steps: &[ExecutionStep]) -> Result<Vec<String>> {
        if steps.is_empty() {
            info!(cluster_id = %cluster_id, "No steps to submit");
            return Ok(Vec::new());
        }

        let step_ids = self.api.add_job_flow_steps(cluster_id, steps).await?;
        info!(cluster_id = %cluster_id, step_ids = ?step_ids, "Steps submitted");
        Ok(step_ids)
    }

    /// Wait for a step to reach a terminal state and return its final details
    pub async fn wait_for_step(&self, cluster_id: &str, step_id: &str) -> Result<StepInfo> {
        let api = &self.api;
        poll_until(
            &format!("step {} on cluster {}", step_id, cluster_id),
            self.polls.step,
            &self.cancel,
            move |_| async move {
                let step = api.describe_step(cluster_id, step_id).await?;
                match step.state {
                    StepState::Completed => {
                        info!(cluster_id = %cluster_id, step_id = %step_id, name = %step.name, "Step completed");
                        Ok(PollResult::Done(step))
                    }
                    ref state if state.is_failure() => {
                        warn!(
                            cluster_id = %cluster_id,
                            step_id = %step_id,
                            name = %step.name,
                            state = %state,
                            reason = ?step.failure_reason,
                            "Step did not complete"
                        );
                        Ok(PollResult::Done(step))
                    }
                    _ => Ok(PollResult::Retry),
                }
            },
        )
        .await
    }

    /// Wait for every step concurrently. All steps are awaited before the
    /// outcome is decided, so every failed step is reported, including steps
    /// whose status could not be read.
    pub async fn wait_for_steps(&self, cluster_id: &str, step_ids: &[String]) -> Result<()> {
        info!(cluster_id = %cluster_id, step_ids = ?step_ids, "Waiting for steps");

        let outcomes = join_all(step_ids.iter().map(|id| self.wait_for_step(cluster_id, id))).await;

        let mut failed = Vec::new();
        for (id, outcome) in step_ids.iter().zip(outcomes) {
            match outcome {
                Ok(step) if step.state == StepState::Completed => {}
                Ok(step) => failed.push(match step.failure_reason {
                    Some(reason) => format!("{} ({}) {}: {}", id, step.name, step.state, reason),
                    None => format!("{} ({}) {}", id, step.name, step.state),
                }),
                Err(RunnerError::Cancelled(what)) => return Err(RunnerError::Cancelled(what)),
                Err(err) => failed.push(format!("{}: {}", id, err)),
            }
        }

        if failed.is_empty() {
            info!(cluster_id = %cluster_id, "All steps completed");
            Ok(())
        } else {
            Err(RunnerError::StepsFailed {
                cluster_id: cluster_id.to_string(),
                failed,
            })
        }
    }

    /// Terminate the cluster and wait until it reaches a terminal state
    pub async fn terminate(&self, cluster_id: &str) -> Result<String> {
        info!(cluster_id = %cluster_id, "Terminating cluster");
        self.api.terminate_job_flows(cluster_id).await?;

        let api = &self.api;
        let state = poll_until(
            &format!("cluster {} termination", cluster_id),
            self.polls.cluster,
            &self.cancel,
            move |_| async move {
                let info = api.describe_cluster(cluster_id).await?;
                if info.state.is_terminal() {
                    Ok(PollResult::Done(info.state))
                } else {
                    Ok(PollResult::Retry)
                }
            },
        )
        .await?;

        info!(cluster_id = %cluster_id, state = %state, "Cluster terminated");
        Ok(cluster_id.to_string())
    }

    /// First active cluster, in listing order, whose name starts with `prefix`
    pub async fn find_by_name(&self, prefix: &str) -> Result<ClusterSummary> {
        let clusters = self.api.list_clusters(&ClusterState::active()).await?;

        let cluster = clusters
            .into_iter()
            .find(|c| c.name.starts_with(prefix))
            .ok_or_else(|| RunnerError::ClusterNotFound {
                prefix: prefix.to_string(),
            })?;

        info!(cluster_id = %cluster.id, name = %cluster.name, "Found cluster");
        Ok(cluster)
    }

    /// Terminate `WAITING` clusters named `prefix*` that have been idle longer
    /// than their `maxIdleMinutes` tag. Returns the terminated ids.
    pub async fn terminate_idle(&self, prefix: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        let candidates = self.api.list_clusters(&[ClusterState::Waiting]).await?;
        let mut terminated = Vec::new();

        for summary in candidates.into_iter().filter(|c| c.name.starts_with(prefix)) {
            let info = self.api.describe_cluster(&summary.id).await?;
            if info.state != ClusterState::Waiting {
                debug!(cluster_id = %info.id, state = %info.state, "Cluster no longer waiting");
                continue;
            }

            let Some(max_idle) = info.tag(MAX_IDLE_MINUTES_TAG).and_then(|v| v.trim().parse::<i64>().ok()) else {
                debug!(cluster_id = %info.id, "No {} tag, skipping", MAX_IDLE_MINUTES_TAG);
                continue;
            };

            let last_step_end = self
                .api
                .list_steps(&info.id, &StepState::finished())
                .await?
                .into_iter()
                .filter_map(|s| s.ended_at)
                .max();

            let Some(idle_since) = last_step_end.or(info.ready_at) else {
                debug!(cluster_id = %info.id, "Cluster has no ready time yet");
                continue;
            };

            let idle_minutes = (now - idle_since).num_minutes();
            if idle_minutes > max_idle {
                info!(
                    cluster_id = %info.id,
                    name = %info.name,
                    idle_minutes,
                    max_idle,
                    "Terminating idle cluster"
                );
                self.api.terminate_job_flows(&info.id).await?;
                terminated.push(info.id);
            } else {
                debug!(cluster_id = %info.id, idle_minutes, max_idle, "Cluster within idle limit");
            }
        }

        Ok(terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{fast_polls, FakeClusterApi};
    use crate::poll::PollPolicy;
    use chrono::{Duration, TimeZone};

    fn controller(api: Arc<FakeClusterApi>) -> ClusterController {
        ClusterController::new(api, fast_polls(), CancellationToken::new())
    }

    fn spec() -> ClusterSpec {
        ClusterSpec {
            name: "demo-cluster".to_string(),
            ..ClusterSpec::default()
        }
    }

    #[tokio::test]
    async fn test_find_by_name_returns_first_match() {
        let api = Arc::new(FakeClusterApi::new());
        api.add_cluster("j-1", "foo-1", ClusterState::Waiting);
        api.add_cluster("j-2", "bar-2", ClusterState::Running);
        api.add_cluster("j-3", "foo-3", ClusterState::Waiting);

        let found = controller(api.clone()).find_by_name("foo").await.unwrap();
        assert_eq!(found.name, "foo-1");

        let missing = controller(api).find_by_name("baz").await;
        assert!(matches!(missing, Err(RunnerError::ClusterNotFound { .. })));
    }

    #[tokio::test]
    async fn test_find_by_name_skips_terminated_clusters() {
        let api = Arc::new(FakeClusterApi::new());
        api.add_cluster("j-1", "foo-1", ClusterState::Terminated);
        api.add_cluster("j-2", "foo-2", ClusterState::Starting);

        let found = controller(api).find_by_name("foo").await.unwrap();
        assert_eq!(found.id, "j-2");
    }

    #[tokio::test]
    async fn test_start_waits_for_ready_state() {
        let api = Arc::new(FakeClusterApi::new());
        api.script_new_cluster(vec![
            ClusterState::Starting,
            ClusterState::Bootstrapping,
            ClusterState::Running,
            ClusterState::Waiting,
        ]);

        let id = controller(api.clone())
            .start(&spec(), &[ClusterState::Waiting])
            .await
            .unwrap();

        assert_eq!(api.cluster_state(&id), Some(ClusterState::Waiting));
        assert_eq!(api.launched_specs()[0].name, "demo-cluster");
    }

    #[tokio::test]
    async fn test_start_fails_on_terminated_with_errors() {
        let api = Arc::new(FakeClusterApi::new());
        api.script_new_cluster(vec![ClusterState::Starting, ClusterState::TerminatedWithErrors]);

        let result = controller(api).start(&spec(), &[ClusterState::Waiting]).await;

        assert!(matches!(result, Err(RunnerError::ClusterFailed { .. })));
    }

    #[tokio::test]
    async fn test_terminated_cluster_checks_step_outcomes() {
        let api = Arc::new(FakeClusterApi::new());
        api.script_new_cluster(vec![ClusterState::Running, ClusterState::Terminated]);
        api.add_listed_step("j-new-1", "s-1", "Enrich", StepState::Failed, None);

        let result = controller(api).start(&spec(), &[ClusterState::Terminated]).await;

        match result {
            Err(RunnerError::ClusterFailed { reason, .. }) => assert!(reason.contains("Enrich")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminated_cluster_with_clean_steps_succeeds() {
        let api = Arc::new(FakeClusterApi::new());
        api.script_new_cluster(vec![ClusterState::Running, ClusterState::Terminated]);
        api.add_listed_step("j-new-1", "s-1", "Enrich", StepState::Completed, None);

        let result = controller(api).start(&spec(), &[ClusterState::Terminated]).await;

        assert_eq!(result.unwrap(), "j-new-1");
    }

    #[tokio::test]
    async fn test_terminated_before_ready_is_failure() {
        let api = Arc::new(FakeClusterApi::new());
        api.script_new_cluster(vec![ClusterState::Starting, ClusterState::Terminated]);

        let result = controller(api).start(&spec(), &[ClusterState::Waiting]).await;

        assert!(matches!(result, Err(RunnerError::ClusterFailed { .. })));
    }

    #[tokio::test]
    async fn test_wait_for_step_returns_final_state() {
        let api = Arc::new(FakeClusterApi::new());
        api.script_step("s-a", vec![StepState::Pending, StepState::Running, StepState::Completed]);
        api.script_step("s-b", vec![StepState::Running, StepState::Failed]);
        let controller = controller(api);

        assert_eq!(controller.wait_for_step("j-1", "s-a").await.unwrap().state, StepState::Completed);
        assert_eq!(controller.wait_for_step("j-1", "s-b").await.unwrap().state, StepState::Failed);
    }

    #[tokio::test]
    async fn test_wait_for_steps_reports_every_failure() {
        let api = Arc::new(FakeClusterApi::new());
        api.script_step("s-a", vec![StepState::Running, StepState::Completed]);
        api.script_step("s-b", vec![StepState::Running, StepState::Failed]);
        api.script_step("s-c", vec![StepState::Pending, StepState::Running, StepState::Cancelled]);
        api.script_step("s-d", vec![StepState::Running, StepState::Interrupted]);
        api.set_step_failure("s-b", "Exception in thread main");
        let ids: Vec<String> = ["s-a", "s-b", "s-c", "s-d"].iter().map(|s| s.to_string()).collect();

        let result = controller(api).wait_for_steps("j-1", &ids).await;

        match result {
            Err(RunnerError::StepsFailed { cluster_id, failed }) => {
                assert_eq!(cluster_id, "j-1");
                assert_eq!(failed.len(), 3);
                assert!(failed[0].starts_with("s-b"));
                assert!(failed[0].contains("FAILED: Exception in thread main"));
                assert!(failed[1].starts_with("s-c") && failed[1].contains("CANCELLED"));
                assert!(failed[2].starts_with("s-d") && failed[2].contains("INTERRUPTED"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_for_steps_reports_unreadable_step_with_the_others() {
        let api = Arc::new(FakeClusterApi::new());
        api.script_step("s-a", vec![StepState::Running, StepState::Failed]);
        api.script_step("s-b", vec![StepState::Running]);
        api.deny_describe_step("s-b", "AccessDeniedException");
        let ids = vec!["s-a".to_string(), "s-b".to_string()];

        let result = controller(api).wait_for_steps("j-1", &ids).await;

        match result {
            Err(RunnerError::StepsFailed { failed, .. }) => {
                assert_eq!(failed.len(), 2);
                assert!(failed[1].starts_with("s-b") && failed[1].contains("AccessDeniedException"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_permanent_describe_error_ends_step_wait() {
        let api = Arc::new(FakeClusterApi::new());
        api.script_step("s-1", vec![StepState::Running]);
        api.deny_describe_step("s-1", "AccessDeniedException");
        let controller = ClusterController::new(
            api.clone(),
            PollSettings::uniform(PollPolicy::unbounded(std::time::Duration::from_millis(1))),
            CancellationToken::new(),
        );

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            controller.wait_for_step("j-1", "s-1"),
        )
        .await
        .expect("permanent error must end the wait");

        assert!(matches!(result, Err(RunnerError::Service { retryable: false, .. })));
        assert_eq!(api.describe_step_calls("s-1"), 1);
    }

    #[tokio::test]
    async fn test_cluster_wait_stops_when_cancelled() {
        let api = Arc::new(FakeClusterApi::new());
        api.add_cluster("j-1", "demo", ClusterState::Starting);
        let cancel = CancellationToken::new();
        let controller = ClusterController::new(
            api,
            PollSettings::uniform(PollPolicy::unbounded(std::time::Duration::from_secs(3600))),
            cancel.clone(),
        );

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = controller.wait_for_state("j-1", &[ClusterState::Waiting]).await;

        match result {
            Err(RunnerError::Cancelled(what)) => assert_eq!(what, "cluster j-1"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_step_wait_cancellation_is_not_reported_as_step_failure() {
        let api = Arc::new(FakeClusterApi::new());
        api.script_step("s-1", vec![StepState::Running]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let controller = ClusterController::new(api, fast_polls(), cancel);

        let result = controller.wait_for_steps("j-1", &["s-1".to_string()]).await;

        assert!(matches!(result, Err(RunnerError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_add_steps_preserves_order() {
        let api = Arc::new(FakeClusterApi::new());
        api.add_cluster("j-1", "demo", ClusterState::Waiting);
        let steps = vec![
            crate::step::hadoop_debugging_step(),
            ExecutionStep {
                name: "Second".to_string(),
                ..crate::step::hadoop_debugging_step()
            },
        ];

        let ids = controller(api.clone()).add_steps("j-1", &steps).await.unwrap();

        assert_eq!(ids, vec!["s-1".to_string(), "s-2".to_string()]);
        assert_eq!(api.submitted_step_names("j-1"), vec!["Setup Hadoop Debugging", "Second"]);
    }

    #[tokio::test]
    async fn test_add_no_steps_makes_no_call() {
        let api = Arc::new(FakeClusterApi::new());

        let ids = controller(api.clone()).add_steps("j-1", &[]).await.unwrap();

        assert!(ids.is_empty());
        assert!(api.submitted_step_names("j-1").is_empty());
    }

    #[tokio::test]
    async fn test_terminate_waits_for_terminal_state() {
        let api = Arc::new(FakeClusterApi::new());
        api.add_cluster("j-1", "demo", ClusterState::Waiting);

        let id = controller(api.clone()).terminate("j-1").await.unwrap();

        assert_eq!(id, "j-1");
        assert_eq!(api.cluster_state("j-1"), Some(ClusterState::Terminated));
    }

    #[tokio::test]
    async fn test_terminate_idle_clusters() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let api = Arc::new(FakeClusterApi::new());

        // idle since its last step ended 2h ago, limit 60
        api.add_cluster("j-1", "demo-1", ClusterState::Waiting);
        api.set_tags("j-1", vec![KeyValue::new("maxIdleMinutes", "60")]);
        api.set_ready_at("j-1", now - Duration::hours(5));
        api.add_listed_step("j-1", "s-1", "Job", StepState::Completed, Some(now - Duration::hours(2)));

        // ready 30 minutes ago, within limit
        api.add_cluster("j-2", "demo-2", ClusterState::Waiting);
        api.set_tags("j-2", vec![KeyValue::new("maxIdleMinutes", "60")]);
        api.set_ready_at("j-2", now - Duration::minutes(30));

        // no tag
        api.add_cluster("j-3", "demo-3", ClusterState::Waiting);
        api.set_ready_at("j-3", now - Duration::hours(10));

        // other name
        api.add_cluster("j-4", "other-4", ClusterState::Waiting);
        api.set_tags("j-4", vec![KeyValue::new("maxIdleMinutes", "1")]);
        api.set_ready_at("j-4", now - Duration::hours(10));

        let terminated = controller(api.clone()).terminate_idle("demo", now).await.unwrap();

        assert_eq!(terminated, vec!["j-1".to_string()]);
        assert_eq!(api.terminated(), vec!["j-1".to_string()]);
    }

    #[tokio::test]
    async fn test_terminate_idle_skips_cluster_that_left_waiting() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let api = Arc::new(FakeClusterApi::new());

        // listed as WAITING, RUNNING again by the time it is described
        api.add_cluster("j-1", "demo-1", ClusterState::Waiting);
        api.set_state_after_listing("j-1", ClusterState::Running);
        api.set_tags("j-1", vec![KeyValue::new("maxIdleMinutes", "5")]);
        api.set_ready_at("j-1", now - Duration::hours(3));

        // idle for hours but not tagged
        api.add_cluster("j-2", "demo-2", ClusterState::Waiting);
        api.set_tags("j-2", vec![KeyValue::new("team", "data")]);
        api.set_ready_at("j-2", now - Duration::hours(3));

        // unparseable limit
        api.add_cluster("j-3", "demo-3", ClusterState::Waiting);
        api.set_tags("j-3", vec![KeyValue::new("maxIdleMinutes", "soon")]);
        api.set_ready_at("j-3", now - Duration::hours(3));

        let terminated = controller(api.clone()).terminate_idle("demo", now).await.unwrap();

        assert!(terminated.is_empty());
        assert!(api.terminated().is_empty());
    }

    #[test]
    fn test_state_round_trip_of_service_strings() {
        assert_eq!(ClusterState::parse("TERMINATED_WITH_ERRORS"), ClusterState::TerminatedWithErrors);
        assert_eq!(ClusterState::parse("NEW_STATE").as_str(), "NEW_STATE");
        assert!(StepState::parse("INTERRUPTED").is_failure());
        assert!(!StepState::parse("COMPLETED").is_failure());
    }
}
