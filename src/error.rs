//! Error types for the runner

use aws_sdk_cloudformation::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use thiserror::Error;

/// Service error codes that mean "try again later"
const RETRYABLE_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestLimitExceeded",
    "RequestThrottled",
    "RequestThrottledException",
    "TooManyRequestsException",
    "SlowDown",
    "PriorRequestNotComplete",
    "InternalError",
    "InternalFailure",
    "InternalServerError",
    "InternalServerException",
    "ServiceUnavailable",
];

/// Runner result type
pub type Result<T> = std::result::Result<T, RunnerError>;

/// A resource event reported by the stack service, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StackEventSummary {
    /// Logical id of the resource the event belongs to
    pub logical_resource_id: String,
    /// Resource status at the time of the event
    pub resource_status: String,
    /// Reason reported by the service, if any
    pub resource_status_reason: Option<String>,
}

/// Errors that can occur while resolving configuration or driving AWS
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Configuration error (malformed document, missing keys, bad values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Template references variables that are not present in the value set
    #[error("Variable not found: {}", variables.join(", "))]
    MissingVariable {
        /// Every unresolved reference found in the template
        variables: Vec<String>,
    },

    /// Malformed template markup
    #[error("Template error: {0}")]
    Template(String),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport or service error from an AWS call
    #[error("Failed to {operation} '{target}', caused by {message}")]
    Service {
        /// What was being attempted
        operation: String,
        /// Identifier of the stack, cluster, step or object involved
        target: String,
        /// Underlying error text
        message: String,
        /// Whether a poll loop may retry the call
        retryable: bool,
    },

    /// Stack does not exist
    #[error("Stack '{0}' does not exist")]
    StackNotFound(String),

    /// No active cluster matches the name prefix
    #[error("Cluster not found started with name: '{prefix}'")]
    ClusterNotFound {
        /// Name prefix that was searched for
        prefix: String,
    },

    /// Changeset creation failed while carrying real changes
    #[error("Changeset '{change_set}' on stack '{stack}' failed: {reason}")]
    ChangeSetFailed {
        /// Stack name
        stack: String,
        /// Changeset name
        change_set: String,
        /// Status reason reported by the service
        reason: String,
    },

    /// Stack reached a failed terminal state
    #[error("Stack '{stack}' is not in the state '{expected}', detailed events:\n{}", format_events(events))]
    StackFailed {
        /// Stack name
        stack: String,
        /// State the stack was expected to reach
        expected: String,
        /// Most recent stack events
        events: Vec<StackEventSummary>,
    },

    /// Cluster terminated with errors or with failed steps
    #[error("Cluster {cluster_id} failed in state {state}: {reason}")]
    ClusterFailed {
        /// Cluster id
        cluster_id: String,
        /// Final cluster state
        state: String,
        /// Reason reported by the service or derived from step outcomes
        reason: String,
    },

    /// One or more steps finished in a failing state
    #[error("Steps failed on cluster {cluster_id}: {}", failed.join(", "))]
    StepsFailed {
        /// Cluster id
        cluster_id: String,
        /// Failed steps as `id (reason)`
        failed: Vec<String>,
    },

    /// Step type without an encoder
    #[error("Unsupported step type: {0}")]
    UnsupportedStepType(String),

    /// Bounded poll ran out of attempts
    #[error("Gave up waiting for {what} after {attempts} attempts")]
    PollExhausted {
        /// What was being waited for
        what: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// Operation cancelled by the caller
    #[error("Cancelled while waiting for {0}")]
    Cancelled(String),

    /// Lifecycle hook action failed
    #[error("Hook '{action}' for event {event} failed: {message}")]
    Hook {
        /// Event name
        event: String,
        /// Action that failed
        action: String,
        /// Failure description
        message: String,
    },
}

fn format_events(events: &[StackEventSummary]) -> String {
    serde_json::to_string_pretty(events).unwrap_or_default()
}

impl RunnerError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a template error
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Wrap a service error that retrying will not fix
    pub fn service(
        operation: impl Into<String>,
        target: impl Into<String>,
        err: impl std::fmt::Display,
    ) -> Self {
        Self::Service {
            operation: operation.into(),
            target: target.into(),
            message: err.to_string(),
            retryable: false,
        }
    }

    /// Wrap a service error that may clear up on retry
    pub fn transient(
        operation: impl Into<String>,
        target: impl Into<String>,
        err: impl std::fmt::Display,
    ) -> Self {
        Self::Service {
            operation: operation.into(),
            target: target.into(),
            message: err.to_string(),
            retryable: true,
        }
    }

    /// Convert from an AWS SDK error, classifying it as retryable or not.
    ///
    /// Timeouts, dispatch failures, unparseable responses and throttling or
    /// internal service errors are retryable. Everything else is permanent.
    pub fn from_aws<E, R>(operation: &str, target: &str) -> impl FnOnce(SdkError<E, R>) -> Self
    where
        E: std::error::Error + ProvideErrorMetadata + 'static,
        R: std::fmt::Debug + 'static,
    {
        let operation = operation.to_string();
        let target = target.to_string();
        move |err| {
            let retryable = match &err {
                SdkError::TimeoutError(_) | SdkError::ResponseError(_) => true,
                SdkError::DispatchFailure(f) => f.is_io() || f.is_timeout(),
                SdkError::ServiceError(e) => e
                    .err()
                    .code()
                    .is_some_and(|code| RETRYABLE_CODES.contains(&code)),
                _ => false,
            };
            Self::Service {
                operation,
                target,
                message: DisplayErrorContext(&err).to_string(),
                retryable,
            }
        }
    }

    /// Errors that a poll loop retries instead of surfacing
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Service { retryable: true, .. })
    }

    /// Absence of a stack or cluster
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::StackNotFound(_) | Self::ClusterNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_cloudformation::error::ErrorMetadata;
    use aws_sdk_emr::operation::describe_step::DescribeStepError;

    #[test]
    fn test_missing_variable_lists_all_names() {
        let err = RunnerError::MissingVariable {
            variables: vec!["Values.a".to_string(), "Values.b".to_string()],
        };

        assert_eq!(err.to_string(), "Variable not found: Values.a, Values.b");
    }

    #[test]
    fn test_service_error_carries_context() {
        let err = RunnerError::service("describe stack", "demo-resources-prod", "throttled");

        assert!(!err.is_transient());
        assert!(RunnerError::transient("describe stack", "demo", "reset").is_transient());
        assert_eq!(
            err.to_string(),
            "Failed to describe stack 'demo-resources-prod', caused by throttled"
        );
    }

    fn describe_step_error(code: &str) -> SdkError<DescribeStepError, ()> {
        SdkError::service_error(
            DescribeStepError::generic(ErrorMetadata::builder().code(code).message("nope").build()),
            (),
        )
    }

    #[test]
    fn test_sdk_errors_are_classified() {
        let convert = |err| RunnerError::from_aws("describe step", "s-1")(err);

        assert!(convert(SdkError::timeout_error("slow")).is_transient());
        assert!(convert(describe_step_error("ThrottlingException")).is_transient());
        assert!(convert(describe_step_error("InternalServerError")).is_transient());
        assert!(!convert(describe_step_error("AccessDeniedException")).is_transient());
        assert!(!convert(describe_step_error("ValidationException")).is_transient());
        assert!(!convert(SdkError::construction_failure("bad input")).is_transient());
    }

    #[test]
    fn test_permanent_sdk_error_keeps_context() {
        let err = RunnerError::from_aws("describe step", "s-1")(describe_step_error("AccessDeniedException"));

        match err {
            RunnerError::Service { operation, target, message, retryable } => {
                assert_eq!(operation, "describe step");
                assert_eq!(target, "s-1");
                assert!(message.contains("AccessDeniedException"), "{}", message);
                assert!(!retryable);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_not_found_classification() {
        assert!(RunnerError::StackNotFound("s".to_string()).is_not_found());
        assert!(RunnerError::ClusterNotFound { prefix: "baz".to_string() }.is_not_found());
        assert!(!RunnerError::config("bad").is_not_found());
    }

    #[test]
    fn test_stack_failed_includes_events() {
        let err = RunnerError::StackFailed {
            stack: "demo".to_string(),
            expected: "CREATE_COMPLETE".to_string(),
            events: vec![StackEventSummary {
                logical_resource_id: "Bucket".to_string(),
                resource_status: "CREATE_FAILED".to_string(),
                resource_status_reason: Some("Access Denied".to_string()),
            }],
        };

        let message = err.to_string();
        assert!(message.contains("CREATE_COMPLETE"));
        assert!(message.contains("Access Denied"));
    }
}
