use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::RanklabError;
use crate::plan::Plan;

/// Current epoch time in milliseconds. The crate-wide timestamp convention.
pub fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Task lifecycle states. Terminal states are sticky.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "STARTED" => Some(Self::Started),
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }

    /// The task state machine. Reclaim (STARTED → PENDING after a lost
    /// lease) is deliberately NOT part of this relation; it is a separate
    /// registry operation with its own rule.
    pub fn can_transition(self, to: TaskStatus) -> bool {
        match self {
            Self::Pending => matches!(to, Self::Started | Self::Cancelled),
            Self::Started => matches!(to, Self::Success | Self::Failure | Self::Cancelled),
            Self::Success | Self::Failure | Self::Cancelled => false,
        }
    }
}

/// What kind of work the task performs. Maintenance cleanups reuse the task
/// lifecycle, so both kinds share status tracking, progress, and polling.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Evaluation,
    Cleanup,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evaluation => "evaluation",
            Self::Cleanup => "cleanup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "evaluation" => Some(Self::Evaluation),
            "cleanup" => Some(Self::Cleanup),
            _ => None,
        }
    }
}

/// Structured error recorded on a FAILURE task. The message is the
/// sanitized user form, never the internal one.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

impl From<&RanklabError> for TaskError {
    fn from(e: &RanklabError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.user_message(),
        }
    }
}

/// One aggregate score slice, as surfaced on a terminal task and in
/// leaderboard responses.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AggregateRow {
    pub model_name: String,
    pub language: String,
    pub subject_type: String,
    pub task_type: String,
    pub score: f64,
    pub sample_count: u64,
}

/// Structured result of a successful task.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct TaskResult {
    pub rows: Vec<AggregateRow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupReport>,
}

/// Outcome of a maintenance cleanup pass.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub tasks_affected: u64,
    pub samples_affected: u64,
    pub cache_affected: u64,
}

/// Parameters of a maintenance cleanup job (`POST /maintenance/cleanup`).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CleanupSpec {
    #[serde(default)]
    pub dry_run: bool,
    pub resources: Vec<CleanupResource>,
    pub days_old: u32,
    #[serde(default = "default_cleanup_limit")]
    pub limit: u32,
    #[serde(default)]
    pub hard_delete: bool,
}

fn default_cleanup_limit() -> u32 {
    10_000
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CleanupResource {
    Tasks,
    Samples,
    Cache,
}

/// One execution attempt for one (plan, fingerprint) pair.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Task {
    pub task_id: String,
    pub fingerprint: String,
    pub status: TaskStatus,
    pub job: JobKind,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    /// 0..=100.
    pub progress: u8,
    /// Redacted plan (evaluation) or cleanup spec (cleanup). Never contains
    /// credentials.
    pub plan_snapshot: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Strictly increases on any mutation.
    pub revision: u64,
}

impl Task {
    pub fn new_evaluation(fingerprint: String, plan: &Plan) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            fingerprint,
            status: TaskStatus::Pending,
            job: JobKind::Evaluation,
            created_at: epoch_ms(),
            started_at: None,
            completed_at: None,
            progress: 0,
            plan_snapshot: serde_json::to_value(plan.redacted()).unwrap_or_default(),
            result: None,
            error: None,
            revision: 1,
        }
    }

    pub fn new_cleanup(fingerprint: String, spec: &CleanupSpec) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            fingerprint,
            status: TaskStatus::Pending,
            job: JobKind::Cleanup,
            created_at: epoch_ms(),
            started_at: None,
            completed_at: None,
            progress: 0,
            plan_snapshot: serde_json::to_value(spec).unwrap_or_default(),
            result: None,
            error: None,
            revision: 1,
        }
    }

    /// Deserialize the redacted plan back out of the snapshot.
    pub fn plan(&self) -> Result<Plan, RanklabError> {
        serde_json::from_value(self.plan_snapshot.clone())
            .map_err(|e| RanklabError::Validation(format!("corrupt plan snapshot: {e}")))
    }

    pub fn cleanup_spec(&self) -> Result<CleanupSpec, RanklabError> {
        serde_json::from_value(self.plan_snapshot.clone())
            .map_err(|e| RanklabError::Validation(format!("corrupt cleanup snapshot: {e}")))
    }
}

/// Fields a transition may set alongside the status change.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub progress: Option<u8>,
    pub result: Option<TaskResult>,
    pub error: Option<TaskError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_names_are_uppercase() {
        assert_eq!(serde_json::to_value(TaskStatus::Pending).unwrap(), "PENDING");
        assert_eq!(serde_json::to_value(TaskStatus::Cancelled).unwrap(), "CANCELLED");
        assert_eq!(TaskStatus::parse("SUCCESS"), Some(TaskStatus::Success));
        assert_eq!(TaskStatus::parse("success"), None);
    }

    #[test]
    fn state_machine_paths() {
        use TaskStatus::*;
        assert!(Pending.can_transition(Started));
        assert!(Pending.can_transition(Cancelled));
        assert!(!Pending.can_transition(Success));
        assert!(Started.can_transition(Success));
        assert!(Started.can_transition(Failure));
        assert!(Started.can_transition(Cancelled));
        assert!(!Started.can_transition(Pending), "reclaim is not a regular transition");
    }

    #[test]
    fn terminal_states_are_sticky() {
        use TaskStatus::*;
        for terminal in [Success, Failure, Cancelled] {
            assert!(terminal.is_terminal());
            for to in [Pending, Started, Success, Failure, Cancelled] {
                assert!(!terminal.can_transition(to), "{terminal:?} -> {to:?} must be rejected");
            }
        }
    }

    #[test]
    fn new_evaluation_snapshot_has_no_credentials() {
        let plan = crate::plan::sample_plan();
        let task = Task::new_evaluation("f".repeat(64), &plan);
        let raw = task.plan_snapshot.to_string();
        assert!(!raw.contains("sk-secret"), "credential leaked into snapshot");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.revision, 1);
        assert_eq!(task.job, JobKind::Evaluation);
    }

    #[test]
    fn snapshot_round_trips_to_plan() {
        let plan = crate::plan::sample_plan();
        let task = Task::new_evaluation("f".repeat(64), &plan);
        let restored = task.plan().unwrap();
        assert_eq!(restored.models.len(), plan.models.len());
        assert!(restored.models[0].credential.is_none());
    }

    #[test]
    fn cleanup_snapshot_round_trips() {
        let spec = CleanupSpec {
            dry_run: true,
            resources: vec![CleanupResource::Tasks, CleanupResource::Cache],
            days_old: 30,
            limit: 100,
            hard_delete: false,
        };
        let task = Task::new_cleanup("cleanup-x".into(), &spec);
        assert_eq!(task.job, JobKind::Cleanup);
        assert_eq!(task.cleanup_spec().unwrap(), spec);
    }

    #[test]
    fn task_error_from_ranklab_error_uses_sanitized_message() {
        let err = RanklabError::StorageUnavailable("secret path /srv/db".into());
        let te = TaskError::from(&err);
        assert_eq!(te.kind, "storage_unavailable");
        assert!(!te.message.contains("/srv/db"));
    }

    #[test]
    fn task_ids_are_unique() {
        let plan = crate::plan::sample_plan();
        let a = Task::new_evaluation("f".repeat(64), &plan);
        let b = Task::new_evaluation("f".repeat(64), &plan);
        assert_ne!(a.task_id, b.task_id);
    }
}
