//! Strongly consistent task registry.

use std::sync::Arc;

use super::{Store, StoreError, worker::DbCommand};
use crate::task::{CleanupReport, CleanupSpec, JobKind, Task, TaskPatch, TaskStatus};

/// Filter for `list`. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub fingerprint: Option<String>,
    pub job: Option<JobKind>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Clone)]
pub struct TaskRegistry {
    store: Arc<Store>,
}

impl TaskRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Insert a new task. Fails with `DuplicateFingerprint` (carrying the
    /// winner's id) when another non-terminal task holds the same
    /// fingerprint — the coalescing primitive. The uniqueness check and the
    /// insert execute on the single store thread, so concurrent creates
    /// linearize.
    pub async fn create(&self, task: Task) -> Result<(), StoreError> {
        let task = Box::new(task);
        self.store
            .call(|reply| DbCommand::CreateTask { task, reply })
            .await
    }

    pub async fn get(&self, task_id: &str) -> Result<Task, StoreError> {
        let task_id = task_id.to_string();
        self.store
            .call(|reply| DbCommand::GetTask { task_id, reply })
            .await
    }

    /// The non-terminal task currently holding a fingerprint, if any.
    pub async fn find_in_flight(&self, fingerprint: &str) -> Result<Option<Task>, StoreError> {
        let fingerprint = fingerprint.to_string();
        self.store
            .call(|reply| DbCommand::FindInFlight { fingerprint, reply })
            .await
    }

    /// Conditional state change. Rejected unless the current status is in
    /// `allowed_from` and the edge exists in the state machine. Bumps the
    /// revision; sets `started_at`/`completed_at` as the edge requires.
    pub async fn transition(
        &self,
        task_id: &str,
        allowed_from: &[TaskStatus],
        to: TaskStatus,
        patch: TaskPatch,
    ) -> Result<Task, StoreError> {
        let task_id = task_id.to_string();
        let allowed_from = allowed_from.to_vec();
        self.store
            .call(|reply| DbCommand::Transition {
                task_id,
                allowed_from,
                to,
                patch,
                reply,
            })
            .await
    }

    /// Progress write while STARTED. Rate limiting is the caller's job
    /// (the worker loop holds the interval clock).
    pub async fn progress(&self, task_id: &str, progress: u8) -> Result<Task, StoreError> {
        let task_id = task_id.to_string();
        self.store
            .call(|reply| DbCommand::Progress {
                task_id,
                progress,
                reply,
            })
            .await
    }

    /// Force a non-terminal task back to PENDING after a lost lease,
    /// bumping the revision. Terminal tasks are returned unchanged.
    pub async fn reclaim(&self, task_id: &str) -> Result<Task, StoreError> {
        let task_id = task_id.to_string();
        self.store
            .call(|reply| DbCommand::Reclaim { task_id, reply })
            .await
    }

    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        self.store
            .call(|reply| DbCommand::ListTasks { filter, reply })
            .await
    }

    /// Execute a maintenance cleanup (or count what it would do, when
    /// `dry_run`).
    pub async fn run_cleanup(&self, spec: CleanupSpec) -> Result<CleanupReport, StoreError> {
        self.store
            .call(|reply| DbCommand::Cleanup { spec, reply })
            .await
    }
}
