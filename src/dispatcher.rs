//! The dispatcher: validate, fingerprint, cache-or-coalesce-or-enqueue.
//!
//! All collaborators arrive at construction; nothing here reads hidden
//! process state. The per-fingerprint critical section lives in the task
//! registry's create (single store thread + unique in-flight check), so two
//! racing submits resolve to one enqueue without a keyed lock here.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::credentials::CredentialVault;
use crate::error::RanklabError;
use crate::fingerprint::{Fingerprinter, short};
use crate::plan::{Plan, SubjectTaxonomy};
use crate::queue::{JobMessage, JobQueue};
use crate::store::StoreError;
use crate::store::cache::{CacheIndex, CacheLookup, CacheRow};
use crate::store::tasks::TaskRegistry;
use crate::task::{CleanupSpec, Task, TaskError, TaskPatch, TaskResult, TaskStatus};

/// Process-local cancellation signals, keyed by task id. The dispatcher
/// fires them; workers select on them between provider calls.
#[derive(Default)]
pub struct CancelHub {
    inner: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a task, created on first use.
    pub fn register(&self, task_id: &str) -> CancellationToken {
        lock(&self.inner)
            .entry(task_id.to_string())
            .or_default()
            .clone()
    }

    /// Fire the task's token. A cancel that races worker registration still
    /// lands: the token is created cancelled if absent.
    pub fn cancel(&self, task_id: &str) {
        lock(&self.inner)
            .entry(task_id.to_string())
            .or_default()
            .cancel();
    }

    pub fn remove(&self, task_id: &str) {
        lock(&self.inner).remove(task_id);
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<'a>(
    inner: &'a Mutex<HashMap<String, CancellationToken>>,
) -> std::sync::MutexGuard<'a, HashMap<String, CancellationToken>> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// What a submit resolved to.
#[derive(Debug)]
pub struct SubmitOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    /// Some or all of the response came from the leaderboard cache.
    pub cached: bool,
    /// The cache covered only a subset of models; `task_id` tracks the
    /// reduced evaluation for the rest.
    pub partial: bool,
    /// Attached to an already-in-flight task instead of enqueuing.
    pub coalesced: bool,
    pub result: Option<TaskResult>,
}

#[derive(Debug)]
pub struct CancelOutcome {
    pub task: Task,
    /// False when the task was already terminal (HTTP 409 at the API).
    pub changed: bool,
}

pub struct Dispatcher {
    fingerprinter: Fingerprinter,
    taxonomy: SubjectTaxonomy,
    registry: TaskRegistry,
    cache: CacheIndex,
    queue: Arc<dyn JobQueue>,
    vault: Arc<CredentialVault>,
    cancels: Arc<CancelHub>,
    min_cache_reuse_samples: u32,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        taxonomy: SubjectTaxonomy,
        registry: TaskRegistry,
        cache: CacheIndex,
        queue: Arc<dyn JobQueue>,
        vault: Arc<CredentialVault>,
        cancels: Arc<CancelHub>,
    ) -> Self {
        Self {
            fingerprinter: Fingerprinter::new(
                &config.sample_size_buckets,
                config.max_sample_size,
            ),
            taxonomy,
            registry,
            cache,
            queue,
            vault,
            cancels,
            min_cache_reuse_samples: config.min_cache_reuse_samples,
        }
    }

    /// Submit an evaluation plan: validate, fingerprint, consult the cache,
    /// and either answer immediately, attach to in-flight work, or enqueue.
    pub async fn submit(&self, plan: Plan) -> Result<SubmitOutcome, RanklabError> {
        plan.validate(&self.taxonomy)?;

        // Normalize the requested size to its bucket before anything else,
        // so snapshots, evaluation, and cache rows all agree with the
        // fingerprint. The cache-reuse floor applies to the size the caller
        // actually asked for, not the bucket it lands on.
        let mut plan = plan;
        let requested_samples = plan.profile.sample_size;
        plan.profile.sample_size = self
            .fingerprinter
            .bucketed_sample_size(plan.profile.sample_size);
        let fingerprint = self.fingerprinter.fingerprint(&plan);

        if requested_samples < self.min_cache_reuse_samples {
            // Too few samples to trust for reuse.
            tracing::debug!(
                fingerprint = short(&fingerprint),
                sample_size = requested_samples,
                "cache bypassed: below min_cache_reuse_samples"
            );
        } else if let Some(outcome) = self.try_cache(&plan, &fingerprint).await? {
            return Ok(outcome);
        }

        let (task_id, status, coalesced) = self.create_or_attach(&plan, &fingerprint).await?;
        Ok(SubmitOutcome {
            task_id,
            status,
            cached: false,
            partial: false,
            coalesced,
            result: None,
        })
    }

    /// Cache resolution. Returns an outcome when the cache fully or partly
    /// answers the plan; `None` falls through to the normal enqueue path.
    async fn try_cache(
        &self,
        plan: &Plan,
        fingerprint: &str,
    ) -> Result<Option<SubmitOutcome>, RanklabError> {
        let requested: HashSet<String> = plan.models.iter().map(|m| m.name.clone()).collect();

        // Keyed by (model, subject, task) slice; exact-fingerprint rows win
        // over singleton rows.
        let mut covered: HashMap<(String, String, String), CacheRow> = HashMap::new();

        let lookup = self
            .cache
            .lookup(fingerprint)
            .await
            .map_err(|e| e.into_ranklab(fingerprint))?;
        if let CacheLookup::Fresh(rows) = lookup {
            for row in rows {
                covered.insert(
                    (row.model_name.clone(), row.subject_type.clone(), row.task_type.clone()),
                    row,
                );
            }
        }

        // Singleton probes for models the exact lookup did not cover.
        if plan.models.len() > 1 {
            let covered_models: HashSet<String> =
                covered.keys().map(|(m, _, _)| m.clone()).collect();
            for model in &plan.models {
                if covered_models.contains(&model.name) {
                    continue;
                }
                let singleton = self.fingerprinter.singleton(plan, &model.name);
                if let CacheLookup::Fresh(rows) = self
                    .cache
                    .lookup(&singleton)
                    .await
                    .map_err(|e| e.into_ranklab(&singleton))?
                {
                    for row in rows {
                        covered
                            .entry((
                                row.model_name.clone(),
                                row.subject_type.clone(),
                                row.task_type.clone(),
                            ))
                            .or_insert(row);
                    }
                }
            }
        }

        if covered.is_empty() {
            return Ok(None);
        }

        let covered_models: HashSet<String> = covered.keys().map(|(m, _, _)| m.clone()).collect();
        let missing: HashSet<String> = requested
            .iter()
            .filter(|m| !covered_models.contains(*m))
            .cloned()
            .collect();

        let mut rows: Vec<CacheRow> = covered.into_values().collect();
        rows.sort_by(|a, b| {
            (&a.model_name, &a.subject_type, &a.task_type)
                .cmp(&(&b.model_name, &b.subject_type, &b.task_type))
        });
        let result = TaskResult {
            rows: rows.iter().map(CacheRow::to_aggregate).collect(),
            cleanup: None,
        };

        if missing.is_empty() {
            tracing::info!(fingerprint = short(fingerprint), "cache hit");
            return Ok(Some(SubmitOutcome {
                task_id: format!("cached-{}", short(fingerprint)),
                status: TaskStatus::Success,
                cached: true,
                partial: false,
                coalesced: false,
                result: Some(result),
            }));
        }

        // Partial hit: enqueue a reduced plan for the uncovered models and
        // hand back the cached subset alongside the tracking task.
        let reduced = plan.retain_models(&missing);
        let reduced_fingerprint = self.fingerprinter.fingerprint(&reduced);
        let (task_id, status, coalesced) =
            self.create_or_attach(&reduced, &reduced_fingerprint).await?;
        tracing::info!(
            fingerprint = short(fingerprint),
            task_id = task_id,
            cached_models = covered_models.len(),
            missing_models = missing.len(),
            "partial cache hit, reduced plan enqueued"
        );
        Ok(Some(SubmitOutcome {
            task_id,
            status,
            cached: true,
            partial: true,
            coalesced,
            result: Some(result),
        }))
    }

    /// Create a task for the plan, or attach to the in-flight task holding
    /// its fingerprint. At most one of any set of racing callers enqueues.
    async fn create_or_attach(
        &self,
        plan: &Plan,
        fingerprint: &str,
    ) -> Result<(String, TaskStatus, bool), RanklabError> {
        let credentials: HashMap<String, String> = plan
            .models
            .iter()
            .filter_map(|m| m.credential.clone().map(|c| (m.name.clone(), c)))
            .collect();

        let task = Task::new_evaluation(fingerprint.to_string(), plan);
        let task_id = task.task_id.clone();

        match self.registry.create(task).await {
            Ok(()) => {
                if let Err(e) = self.vault.store(&task_id, credentials) {
                    let _ = self
                        .registry
                        .transition(
                            &task_id,
                            &[TaskStatus::Pending],
                            TaskStatus::Cancelled,
                            TaskPatch::default(),
                        )
                        .await;
                    return Err(e);
                }
                if let Err(e) = self
                    .queue
                    .enqueue(JobMessage::new(&task_id, fingerprint))
                    .await
                {
                    let patch = TaskPatch {
                        error: Some(TaskError {
                            kind: "queue_unavailable".into(),
                            message: "evaluation queue is unavailable".into(),
                        }),
                        ..Default::default()
                    };
                    let _ = self
                        .registry
                        .transition(&task_id, &[TaskStatus::Pending], TaskStatus::Cancelled, patch)
                        .await;
                    self.vault.purge(&task_id);
                    return Err(RanklabError::QueueUnavailable(e.to_string()));
                }
                tracing::info!(
                    task_id = task_id,
                    fingerprint = short(fingerprint),
                    "task created and enqueued"
                );
                Ok((task_id, TaskStatus::Pending, false))
            }
            Err(StoreError::DuplicateFingerprint { task_id: winner }) => {
                // Coalesced attach. Refresh the winner's credential envelope
                // so a long-queued task can still run with the newest keys.
                if !credentials.is_empty() {
                    let _ = self.vault.store(&winner, credentials);
                }
                let task = self
                    .registry
                    .get(&winner)
                    .await
                    .map_err(|e| e.into_ranklab(fingerprint))?;
                tracing::info!(
                    task_id = winner,
                    fingerprint = short(fingerprint),
                    "submit coalesced onto in-flight task"
                );
                Ok((winner, task.status, true))
            }
            Err(e) => Err(e.into_ranklab(fingerprint)),
        }
    }

    /// Cancel a task. No-op (changed=false) on terminal states.
    pub async fn cancel(&self, task_id: &str) -> Result<CancelOutcome, RanklabError> {
        let task = self
            .registry
            .get(task_id)
            .await
            .map_err(|e| e.into_ranklab(""))?;
        if task.status.is_terminal() {
            return Ok(CancelOutcome { task, changed: false });
        }

        let was_pending = task.status == TaskStatus::Pending;
        match self
            .registry
            .transition(
                task_id,
                &[TaskStatus::Pending, TaskStatus::Started],
                TaskStatus::Cancelled,
                TaskPatch::default(),
            )
            .await
        {
            Ok(task) => {
                if was_pending {
                    let _ = self.queue.drop_task(task_id).await;
                }
                self.cancels.cancel(task_id);
                self.vault.purge(task_id);
                tracing::info!(task_id = task_id, "task cancelled");
                Ok(CancelOutcome { task, changed: true })
            }
            Err(StoreError::InvalidTransition { .. }) => {
                // Raced a terminal transition; report the settled state.
                let task = self
                    .registry
                    .get(task_id)
                    .await
                    .map_err(|e| e.into_ranklab(""))?;
                Ok(CancelOutcome { task, changed: false })
            }
            Err(e) => Err(e.into_ranklab("")),
        }
    }

    /// Register a maintenance cleanup as a tracked task and enqueue it.
    /// Cleanups are never coalesced or cache-served.
    pub async fn submit_cleanup(&self, spec: CleanupSpec) -> Result<SubmitOutcome, RanklabError> {
        if spec.resources.is_empty() {
            return Err(RanklabError::Validation(
                "cleanup resources must be non-empty".into(),
            ));
        }
        let fingerprint = format!("cleanup-{}", uuid::Uuid::new_v4());
        let task = Task::new_cleanup(fingerprint.clone(), &spec);
        let task_id = task.task_id.clone();

        self.registry
            .create(task)
            .await
            .map_err(|e| e.into_ranklab(&fingerprint))?;
        if let Err(e) = self
            .queue
            .enqueue(JobMessage::new(&task_id, &fingerprint))
            .await
        {
            let _ = self
                .registry
                .transition(
                    &task_id,
                    &[TaskStatus::Pending],
                    TaskStatus::Cancelled,
                    TaskPatch::default(),
                )
                .await;
            return Err(RanklabError::QueueUnavailable(e.to_string()));
        }
        tracing::info!(task_id = task_id, "cleanup task enqueued");
        Ok(SubmitOutcome {
            task_id,
            status: TaskStatus::Pending,
            cached: false,
            partial: false,
            coalesced: false,
            result: None,
        })
    }
}
