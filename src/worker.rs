//! The worker loop.
//!
//! Claims jobs from the queue, drives the pluggable evaluator, streams
//! sample batches into the result store, rate-limits progress writes, and
//! finishes with aggregate writes strictly before the terminal transition.
//! A worker only mutates a task while it holds the queue lease.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::credentials::CredentialVault;
use crate::dispatcher::CancelHub;
use crate::error::RanklabError;
use crate::evaluator::{EvalError, EvalSample, EvalSink, Evaluator};
use crate::fingerprint::Fingerprinter;
use crate::plan::Plan;
use crate::queue::{ClaimedJob, JobQueue, LeaseId};
use crate::store::StoreError;
use crate::store::cache::{CacheIndex, CacheRow};
use crate::store::samples::{SampleRow, SampleStore};
use crate::store::tasks::TaskRegistry;
use crate::task::{JobKind, Task, TaskError, TaskPatch, TaskResult, TaskStatus, epoch_ms};

/// How long one claim call blocks before the loop re-checks shutdown.
const CLAIM_WAIT: Duration = Duration::from_secs(2);

/// Evaluator attempts per task (first run + retries of retryable errors).
pub const MAX_EVAL_ATTEMPTS: u32 = 3;
const EVAL_BACKOFF_BASE: Duration = Duration::from_millis(500);
const EVAL_BACKOFF_JITTER_MS: u64 = 250;

/// Sample batch persistence retries before `storage_unavailable`.
const STORAGE_ATTEMPTS: u32 = 5;
const STORAGE_BACKOFF_BASE: Duration = Duration::from_millis(200);
const STORAGE_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Samples buffered before a batch write.
const SAMPLE_BATCH_SIZE: usize = 32;

/// A partially filled batch is flushed at least this often, bounding how
/// much streamed work a dead worker can lose.
const SAMPLE_FLUSH_INTERVAL: Duration = Duration::from_millis(250);

/// Everything a worker needs, passed explicitly at construction.
pub struct WorkerContext {
    pub registry: TaskRegistry,
    pub samples: SampleStore,
    pub cache: CacheIndex,
    pub queue: Arc<dyn JobQueue>,
    pub vault: Arc<CredentialVault>,
    pub evaluator: Arc<dyn Evaluator>,
    pub cancels: Arc<CancelHub>,
    pub config: Config,
}

enum JobOutcome {
    /// Task reached a terminal state (or was already terminal): ack.
    Done,
    /// Lease lost mid-run; stop mutating and let redelivery handle it.
    Abandoned,
    /// Infrastructure failure before any terminal transition: nack.
    Redeliver(String),
}

enum AttemptError {
    Cancelled,
    DeadlineExceeded,
    Storage(RanklabError),
    Evaluator(EvalError),
    LeaseLost,
}

/// Spawn `worker_concurrency` worker loops.
pub fn spawn_workers(
    ctx: Arc<WorkerContext>,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..ctx.config.worker_concurrency)
        .map(|index| {
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(run_worker(ctx, index, shutdown))
        })
        .collect()
}

pub async fn run_worker(ctx: Arc<WorkerContext>, index: usize, shutdown: CancellationToken) {
    tracing::debug!(worker = index, "worker loop starting");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            claimed = ctx.queue.claim(CLAIM_WAIT) => match claimed {
                Ok(Some(job)) => process_job(&ctx, job).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(worker = index, "queue claim failed: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
    tracing::debug!(worker = index, "worker loop stopped");
}

async fn process_job(ctx: &WorkerContext, job: ClaimedJob) {
    let task_id = job.message.task_id.clone();

    let task = match ctx.registry.get(&task_id).await {
        Ok(task) => task,
        Err(StoreError::NotFound(_)) => {
            tracing::warn!(task_id = task_id, "claimed job references unknown task, dropping");
            let _ = ctx.queue.ack(&job.lease).await;
            return;
        }
        Err(e) => {
            tracing::warn!(task_id = task_id, "store unreachable on claim: {e}");
            let _ = ctx.queue.nack(&job.lease, "store unreachable").await;
            return;
        }
    };

    // Cancelled (or otherwise settled) while queued: consume silently.
    if task.status.is_terminal() {
        finish(ctx, &task_id, &job.lease, JobOutcome::Done).await;
        return;
    }

    // Redelivery after a lost lease: force the task back to PENDING
    // (revision bump) before claiming it again. Samples from the dead run
    // deduplicate on (task_id, model_name, sample_index).
    let task = if job.redelivered && task.status == TaskStatus::Started {
        match ctx.registry.reclaim(&task_id).await {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(task_id = task_id, "reclaim failed: {e}");
                let _ = ctx.queue.nack(&job.lease, "reclaim failed").await;
                return;
            }
        }
    } else {
        task
    };
    if task.status.is_terminal() {
        finish(ctx, &task_id, &job.lease, JobOutcome::Done).await;
        return;
    }

    let task = match ctx
        .registry
        .transition(&task_id, &[TaskStatus::Pending], TaskStatus::Started, TaskPatch::default())
        .await
    {
        Ok(task) => task,
        Err(StoreError::InvalidTransition { .. }) => {
            // Raced a cancel between claim and ownership; settled elsewhere.
            finish(ctx, &task_id, &job.lease, JobOutcome::Done).await;
            return;
        }
        Err(e) => {
            tracing::warn!(task_id = task_id, "cannot start task: {e}");
            let _ = ctx.queue.nack(&job.lease, "store error on start").await;
            return;
        }
    };

    tracing::info!(task_id = task_id, job = task.job.as_str(), "task started");
    let outcome = match task.job {
        JobKind::Evaluation => run_evaluation(ctx, &task, &job.lease).await,
        JobKind::Cleanup => run_cleanup(ctx, &task).await,
    };
    finish(ctx, &task_id, &job.lease, outcome).await;
}

async fn finish(ctx: &WorkerContext, task_id: &str, lease: &LeaseId, outcome: JobOutcome) {
    match outcome {
        JobOutcome::Done => {
            let _ = ctx.queue.ack(lease).await;
            ctx.vault.purge(task_id);
            ctx.cancels.remove(task_id);
        }
        JobOutcome::Abandoned => {
            // Not ours anymore. Keep the envelope and the cancel token: the
            // worker that took over needs both.
        }
        JobOutcome::Redeliver(reason) => {
            let _ = ctx.queue.nack(lease, &reason).await;
            ctx.cancels.remove(task_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation jobs
// ---------------------------------------------------------------------------

async fn run_evaluation(ctx: &WorkerContext, task: &Task, lease: &LeaseId) -> JobOutcome {
    let task_id = task.task_id.as_str();

    let plan = match task.plan() {
        Ok(plan) => plan,
        Err(_) => {
            let err = RanklabError::EvaluatorFatal("corrupt plan snapshot".into());
            return if fail_task(ctx, task_id, &err).await {
                JobOutcome::Done
            } else {
                JobOutcome::Redeliver("store error on failure".into())
            };
        }
    };

    let credentials = match ctx.vault.fetch(task_id) {
        Ok(credentials) => credentials,
        Err(e) => {
            // TTL expired or the dispatcher process restarted.
            return if fail_task(ctx, task_id, &e).await {
                JobOutcome::Done
            } else {
                JobOutcome::Redeliver("store error on failure".into())
            };
        }
    };

    let cancel = ctx.cancels.register(task_id);
    let deadline = tokio::time::Instant::now() + ctx.config.task_max_duration;

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result =
            run_attempt(ctx, task, &plan, &credentials, &cancel, deadline, lease).await;

        match result {
            Ok(()) => return complete_success(ctx, task_id, &plan).await,
            Err(AttemptError::Cancelled) => {
                // Partial samples stay in the sample store; no aggregate is written. The
                // registry transition usually already happened on the admin
                // path — a conflict here just means we lost that race.
                let _ = ctx
                    .registry
                    .transition(
                        task_id,
                        &[TaskStatus::Started],
                        TaskStatus::Cancelled,
                        TaskPatch::default(),
                    )
                    .await;
                tracing::info!(task_id = task_id, "task cancelled");
                return JobOutcome::Done;
            }
            Err(AttemptError::DeadlineExceeded) => {
                let err = RanklabError::Timeout {
                    max_secs: ctx.config.task_max_duration.as_secs(),
                };
                return if fail_task(ctx, task_id, &err).await {
                    JobOutcome::Done
                } else {
                    JobOutcome::Redeliver("store error on timeout".into())
                };
            }
            Err(AttemptError::Storage(err)) => {
                return if fail_task(ctx, task_id, &err).await {
                    JobOutcome::Done
                } else {
                    JobOutcome::Redeliver("storage unavailable".into())
                };
            }
            Err(AttemptError::LeaseLost) => {
                tracing::warn!(task_id = task_id, "lease lost mid-run, abandoning task");
                return JobOutcome::Abandoned;
            }
            Err(AttemptError::Evaluator(e)) => {
                let out_of_time = tokio::time::Instant::now() >= deadline;
                if e.is_retryable() && attempt < MAX_EVAL_ATTEMPTS && !out_of_time {
                    let backoff = eval_backoff(attempt);
                    tracing::warn!(
                        task_id = task_id,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "evaluator failed transiently, retrying: {e}"
                    );
                    if ctx.queue.renew(lease).await.is_err() {
                        return JobOutcome::Abandoned;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = ctx.registry.transition(
                                task_id,
                                &[TaskStatus::Started],
                                TaskStatus::Cancelled,
                                TaskPatch::default(),
                            ).await;
                            return JobOutcome::Done;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    continue;
                }
                let err = if e.is_retryable() {
                    RanklabError::EvaluatorRetryable(e.message.clone())
                } else {
                    RanklabError::EvaluatorFatal(e.message.clone())
                };
                return if fail_task(ctx, task_id, &err).await {
                    JobOutcome::Done
                } else {
                    JobOutcome::Redeliver("store error on failure".into())
                };
            }
        }
    }
}

/// One evaluator run: drive the future while draining sample and progress
/// channels, renewing the lease, and watching cancel/deadline.
async fn run_attempt(
    ctx: &WorkerContext,
    task: &Task,
    plan: &Plan,
    credentials: &HashMap<String, String>,
    cancel: &CancellationToken,
    deadline: tokio::time::Instant,
    lease: &LeaseId,
) -> Result<(), AttemptError> {
    let task_id = task.task_id.as_str();

    let (sample_tx, mut sample_rx) = mpsc::channel::<EvalSample>(256);
    let (progress_tx, mut progress_rx) = mpsc::channel::<u8>(64);
    let sink = EvalSink::new(sample_tx, progress_tx);

    let eval = ctx.evaluator.evaluate(plan, credentials, sink, cancel.clone());
    tokio::pin!(eval);

    let renew_every = (ctx.config.lease_ttl / 2).max(Duration::from_millis(10));
    let mut renew_timer = tokio::time::interval(renew_every);
    renew_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Fallback cancellation check against the registry, bounding the time
    // between an external cancel and this worker observing it.
    let mut status_poll = tokio::time::interval(ctx.config.cancel_latency_bound);
    status_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut flush_timer = tokio::time::interval(SAMPLE_FLUSH_INTERVAL);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut batch: Vec<SampleRow> = Vec::new();
    let mut last_progress_write: Option<tokio::time::Instant> = None;
    let mut eval_done: Option<Result<(), EvalError>> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Persisted partials stay; flush what is buffered too.
                if let Err(e) = flush_batch(ctx, task_id, &mut batch).await {
                    tracing::warn!(task_id = task_id, "final flush after cancel failed: {e}");
                }
                return Err(AttemptError::Cancelled);
            }
            _ = tokio::time::sleep_until(deadline) => {
                if let Err(e) = flush_batch(ctx, task_id, &mut batch).await {
                    tracing::warn!(task_id = task_id, "final flush after deadline failed: {e}");
                }
                return Err(AttemptError::DeadlineExceeded);
            }
            _ = renew_timer.tick() => {
                if ctx.queue.renew(lease).await.is_err() {
                    return Err(AttemptError::LeaseLost);
                }
            }
            _ = status_poll.tick() => {
                if let Ok(current) = ctx.registry.get(task_id).await
                    && current.status == TaskStatus::Cancelled
                {
                    cancel.cancel();
                }
            }
            Some(sample) = sample_rx.recv() => {
                batch.push(to_sample_row(task, sample));
                if batch.len() >= SAMPLE_BATCH_SIZE {
                    flush_batch(ctx, task_id, &mut batch)
                        .await
                        .map_err(AttemptError::Storage)?;
                }
            }
            _ = flush_timer.tick(), if !batch.is_empty() => {
                flush_batch(ctx, task_id, &mut batch)
                    .await
                    .map_err(AttemptError::Storage)?;
            }
            Some(percent) = progress_rx.recv() => {
                let due = last_progress_write
                    .is_none_or(|at| at.elapsed() >= ctx.config.progress_min_interval);
                if due {
                    if let Err(e) = ctx.registry.progress(task_id, percent).await {
                        tracing::debug!(task_id = task_id, "progress write skipped: {e}");
                    }
                    last_progress_write = Some(tokio::time::Instant::now());
                }
            }
            result = &mut eval, if eval_done.is_none() => {
                eval_done = Some(result);
            }
        }

        if let Some(result) = eval_done.take() {
            // The sink dropped with the evaluator future; drain stragglers.
            while let Ok(sample) = sample_rx.try_recv() {
                batch.push(to_sample_row(task, sample));
            }
            flush_batch(ctx, task_id, &mut batch)
                .await
                .map_err(AttemptError::Storage)?;
            return result.map_err(AttemptError::Evaluator);
        }
    }
}

/// Aggregate writes, then the SUCCESS transition — in that order, so a task
/// observed SUCCESS always has its aggregates visible.
async fn complete_success(ctx: &WorkerContext, task_id: &str, plan: &Plan) -> JobOutcome {
    let rows: Vec<CacheRow> = match ctx.cache.upsert_from_task(task_id).await {
        Ok(rows) => rows,
        Err(e) => {
            let err = RanklabError::StorageUnavailable(e.to_string());
            return if fail_task(ctx, task_id, &err).await {
                JobOutcome::Done
            } else {
                JobOutcome::Redeliver("storage unavailable".into())
            };
        }
    };

    // Also key each model's rows under its singleton-plan fingerprint so
    // overlapping future plans get partial cache hits. Best effort.
    if plan.models.len() > 1 {
        let fingerprinter = Fingerprinter::new(
            &ctx.config.sample_size_buckets,
            ctx.config.max_sample_size,
        );
        for model in &plan.models {
            let singleton = fingerprinter.singleton(plan, &model.name);
            if let Err(e) = ctx
                .cache
                .upsert_model_rekeyed(task_id, &model.name, &singleton)
                .await
            {
                tracing::warn!(task_id = task_id, model = model.name, "singleton upsert failed: {e}");
            }
        }
    }

    let result = TaskResult {
        rows: rows.iter().map(CacheRow::to_aggregate).collect(),
        cleanup: None,
    };
    match ctx
        .registry
        .transition(
            task_id,
            &[TaskStatus::Started],
            TaskStatus::Success,
            TaskPatch {
                result: Some(result),
                ..Default::default()
            },
        )
        .await
    {
        Ok(task) => {
            tracing::info!(
                task_id = task_id,
                models = rows.len(),
                revision = task.revision,
                "task succeeded"
            );
            JobOutcome::Done
        }
        Err(StoreError::InvalidTransition { .. }) => {
            // A cancel won the race after our aggregate write; the cache
            // rows are valid, the terminal state stands.
            JobOutcome::Done
        }
        Err(e) => {
            tracing::warn!(task_id = task_id, "success transition failed: {e}");
            JobOutcome::Redeliver("store error on success".into())
        }
    }
}

// ---------------------------------------------------------------------------
// Cleanup jobs
// ---------------------------------------------------------------------------

async fn run_cleanup(ctx: &WorkerContext, task: &Task) -> JobOutcome {
    let task_id = task.task_id.as_str();
    let spec = match task.cleanup_spec() {
        Ok(spec) => spec,
        Err(_) => {
            let err = RanklabError::EvaluatorFatal("corrupt cleanup snapshot".into());
            return if fail_task(ctx, task_id, &err).await {
                JobOutcome::Done
            } else {
                JobOutcome::Redeliver("store error on failure".into())
            };
        }
    };

    match ctx.registry.run_cleanup(spec).await {
        Ok(report) => {
            let result = TaskResult {
                rows: Vec::new(),
                cleanup: Some(report),
            };
            match ctx
                .registry
                .transition(
                    task_id,
                    &[TaskStatus::Started],
                    TaskStatus::Success,
                    TaskPatch {
                        result: Some(result),
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(_) => {
                    tracing::info!(task_id = task_id, "cleanup task succeeded");
                    JobOutcome::Done
                }
                Err(StoreError::InvalidTransition { .. }) => JobOutcome::Done,
                Err(e) => {
                    tracing::warn!(task_id = task_id, "cleanup success transition failed: {e}");
                    JobOutcome::Redeliver("store error on success".into())
                }
            }
        }
        Err(e) => {
            let err = RanklabError::StorageUnavailable(e.to_string());
            if fail_task(ctx, task_id, &err).await {
                JobOutcome::Done
            } else {
                JobOutcome::Redeliver("storage unavailable".into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn fail_task(ctx: &WorkerContext, task_id: &str, err: &RanklabError) -> bool {
    let patch = TaskPatch {
        error: Some(TaskError::from(err)),
        ..Default::default()
    };
    match ctx
        .registry
        .transition(task_id, &[TaskStatus::Started], TaskStatus::Failure, patch)
        .await
    {
        Ok(_) => {
            tracing::warn!(task_id = task_id, kind = err.kind(), "task failed");
            true
        }
        Err(StoreError::InvalidTransition { .. }) => true,
        Err(e) => {
            tracing::warn!(task_id = task_id, "failure transition failed: {e}");
            false
        }
    }
}

async fn flush_batch(
    ctx: &WorkerContext,
    task_id: &str,
    batch: &mut Vec<SampleRow>,
) -> Result<(), RanklabError> {
    if batch.is_empty() {
        return Ok(());
    }
    let rows = std::mem::take(batch);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match ctx.samples.append(rows.clone()).await {
            Ok(inserted) => {
                tracing::debug!(
                    task_id = task_id,
                    batch = rows.len(),
                    inserted = inserted,
                    "sample batch persisted"
                );
                return Ok(());
            }
            Err(e) if attempt < STORAGE_ATTEMPTS => {
                let backoff = storage_backoff(attempt);
                tracing::warn!(
                    task_id = task_id,
                    attempt = attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "sample batch write failed, retrying: {e}"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(RanklabError::StorageUnavailable(e.to_string())),
        }
    }
}

fn to_sample_row(task: &Task, sample: EvalSample) -> SampleRow {
    SampleRow {
        task_id: task.task_id.clone(),
        model_name: sample.model_name,
        sample_index: sample.sample_index,
        fingerprint: task.fingerprint.clone(),
        prompt: sample.prompt,
        answer: sample.answer,
        correctness: sample.correctness,
        skill_label: sample.skill_label,
        target_label: sample.target_label,
        subject_label: sample.subject_label,
        task_label: sample.task_label,
        dataset_name: sample.dataset_name,
        metadata: sample.metadata,
        ts: epoch_ms(),
    }
}

/// Exponential backoff with jitter for evaluator retries.
fn eval_backoff(attempt: u32) -> Duration {
    let base = EVAL_BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let jitter = Duration::from_millis(rand::rng().random_range(0..=EVAL_BACKOFF_JITTER_MS));
    base + jitter
}

/// Exponential backoff for sample batch writes, capped.
fn storage_backoff(attempt: u32) -> Duration {
    STORAGE_BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(STORAGE_BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_backoff_grows_with_jitter_bound() {
        for attempt in 1..=3 {
            let expected_base = EVAL_BACKOFF_BASE * 2u32.pow(attempt - 1);
            let delay = eval_backoff(attempt);
            assert!(delay >= expected_base);
            assert!(delay <= expected_base + Duration::from_millis(EVAL_BACKOFF_JITTER_MS));
        }
    }

    #[test]
    fn storage_backoff_is_capped() {
        assert_eq!(storage_backoff(1), Duration::from_millis(200));
        assert_eq!(storage_backoff(2), Duration::from_millis(400));
        assert_eq!(storage_backoff(10), STORAGE_BACKOFF_CAP);
    }
}
