use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, LisaError, ProviderFailure};

/// Unique submission identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SubmissionId(pub String);

impl SubmissionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named unit of work within one submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique within the submission.
    pub id: String,
    /// Registry name of the capability to invoke.
    #[serde(alias = "capabilityName", alias = "capability_name")]
    pub capability: String,
    /// Input handed to the capability after reference substitution.
    #[serde(default)]
    pub input: serde_json::Value,
    /// Ids of tasks that must succeed before this one starts.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            input: serde_json::Value::Null,
            dependencies: BTreeSet::new(),
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.insert(id.into());
        self
    }
}

/// Lifecycle of a task: `pending -> running -> {succeeded, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Structured, serializable form of a task failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&LisaError> for TaskError {
    fn from(e: &LisaError) -> Self {
        let details = match e {
            LisaError::ProvidersExhausted { failures, .. } => {
                serde_json::to_value(failures).ok()
            }
            LisaError::BlockedByDependency { dependency } => {
                Some(serde_json::json!({ "dependency": dependency }))
            }
            LisaError::CyclicDependency { cycle } => Some(serde_json::json!({ "cycle": cycle })),
            _ => None,
        };
        Self {
            kind: e.kind(),
            message: e.to_string(),
            details,
        }
    }
}

impl From<LisaError> for TaskError {
    fn from(e: LisaError) -> Self {
        Self::from(&e)
    }
}

/// Per-task execution record, written only by that task's own execution step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_id: String,
    pub capability: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Monotonic run time; absent for tasks that never started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ExecutionRecord {
    pub fn pending(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            capability: task.capability.clone(),
            status: TaskStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
        }
    }
}

/// Outcome of a whole submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub submission_id: SubmissionId,
    /// Every submitted task, keyed by id, always in a terminal state.
    pub tasks: BTreeMap<String, ExecutionRecord>,
    /// Submission start to last task completion, monotonic.
    pub total_duration_ms: u64,
    /// Sum of individual task durations divided by the wall-clock duration.
    pub parallelism: f64,
}

impl Report {
    pub fn get(&self, task_id: &str) -> Option<&ExecutionRecord> {
        self.tasks.get(task_id)
    }

    pub fn succeeded(&self) -> usize {
        self.count(TaskStatus::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|r| r.status == status).count()
    }
}

/// Read-only ambient data supplied to every capability invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityContext {
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default)]
    pub preferences: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub workspace: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<SubmissionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

fn default_locale() -> String {
    "en-US".to_string()
}

impl Default for CapabilityContext {
    fn default() -> Self {
        Self {
            locale: default_locale(),
            preferences: HashMap::new(),
            workspace: PathBuf::from("."),
            submission_id: None,
            task_id: None,
        }
    }
}

/// What a capability handler reports back: `{success, output, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutput {
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CapabilityOutput {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Telemetry event broadcast to all subscribers. Best-effort only.
#[derive(Debug, Clone)]
pub enum LisaEvent {
    /// A validated submission started executing.
    SubmissionStarted {
        submission_id: SubmissionId,
        task_count: usize,
    },
    /// A task was launched.
    TaskStarted {
        submission_id: SubmissionId,
        task_id: String,
        capability: String,
    },
    /// A task reached `succeeded`.
    TaskSucceeded {
        submission_id: SubmissionId,
        task_id: String,
        duration_ms: u64,
    },
    /// A task ran and reached `failed`.
    TaskFailed {
        submission_id: SubmissionId,
        task_id: String,
        error: TaskError,
    },
    /// A task was failed without running because a dependency failed.
    TaskBlocked {
        submission_id: SubmissionId,
        task_id: String,
        dependency: String,
    },
    /// Every task reached a terminal state.
    SubmissionCompleted {
        submission_id: SubmissionId,
        succeeded: usize,
        failed: usize,
        total_duration_ms: u64,
    },
    /// The invoker is about to retry an operation.
    RetryAttempted {
        operation: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// A breaker moved between states.
    CircuitStateChanged {
        operation: String,
        from: CircuitState,
        to: CircuitState,
    },
    /// A provider call failed during failover.
    ProviderFailed { provider: String, error: String },
    /// A provider was removed from the failover rotation.
    ProviderMarkedUnhealthy { provider: String },
    /// A health probe brought a provider back into rotation.
    ProviderRecovered { provider: String },
    /// Every provider failed for one request.
    AllProvidersExhausted {
        capability: String,
        failures: Vec<ProviderFailure>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_deserializes_camel_case_capability() {
        let task: Task = serde_json::from_str(
            r#"{"id":"b","capabilityName":"echo","input":{"x":1},"dependencies":["a"]}"#,
        )
        .unwrap();
        assert_eq!(task.capability, "echo");
        assert!(task.dependencies.contains("a"));
    }

    #[test]
    fn test_task_builder() {
        let task = Task::new("b", "echo")
            .with_input(serde_json::json!("$task.a.output"))
            .depends_on("a");
        assert_eq!(task.id, "b");
        assert_eq!(task.dependencies.len(), 1);
    }

    #[test]
    fn test_task_error_from_blocked() {
        let err = TaskError::from(LisaError::BlockedByDependency {
            dependency: "a".into(),
        });
        assert_eq!(err.kind, ErrorKind::BlockedByDependency);
        assert_eq!(err.details, Some(serde_json::json!({ "dependency": "a" })));
    }

    #[test]
    fn test_terminal_status() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }
}
