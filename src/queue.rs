//! Queue adapter: durable enqueue plus lease-based claim.
//!
//! The orchestrator runs on anything that can hold jobs and lease them out.
//! [`InMemoryQueue`] is the in-process implementation; leases survive worker
//! death by expiring, after which the job is redelivered.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::RanklabError;
use crate::task::epoch_ms;

/// Message carried by the queue. `plan_ref` is opaque here; workers resolve
/// it through the task registry.
#[derive(Debug, Clone)]
pub struct JobMessage {
    pub task_id: String,
    pub plan_ref: String,
    pub enqueue_ts: i64,
}

impl JobMessage {
    pub fn new(task_id: impl Into<String>, plan_ref: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            plan_ref: plan_ref.into(),
            enqueue_ts: epoch_ms(),
        }
    }
}

/// Opaque lease handle. Holding a valid lease is the only license to mutate
/// the associated task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseId(String);

impl LeaseId {
    fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Debug)]
pub struct ClaimedJob {
    pub message: JobMessage,
    pub lease: LeaseId,
    /// True when a previous delivery lost its lease (worker death or nack).
    pub redelivered: bool,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Returns once the job is durable to the queue.
    async fn enqueue(&self, message: JobMessage) -> Result<(), RanklabError>;

    /// Block up to `wait` for a job. Expired leases are swept and their jobs
    /// redelivered before new ones.
    async fn claim(&self, wait: Duration) -> Result<Option<ClaimedJob>, RanklabError>;

    /// Extend ownership. Fails if the lease already expired and the job was
    /// handed elsewhere.
    async fn renew(&self, lease: &LeaseId) -> Result<(), RanklabError>;

    /// Finalize successfully; the job leaves the queue.
    async fn ack(&self, lease: &LeaseId) -> Result<(), RanklabError>;

    /// Give the job back for redelivery.
    async fn nack(&self, lease: &LeaseId, reason: &str) -> Result<(), RanklabError>;

    /// Best-effort removal of a not-yet-claimed job (cancel path). Returns
    /// whether anything was dropped.
    async fn drop_task(&self, task_id: &str) -> Result<bool, RanklabError>;

    /// Jobs currently queued or leased. Doubles as the health probe.
    async fn depth(&self) -> Result<usize, RanklabError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct LeasedJob {
    message: JobMessage,
    expires_at: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(JobMessage, bool)>,
    leased: HashMap<LeaseId, LeasedJob>,
}

pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    lease_ttl: Duration,
}

impl InMemoryQueue {
    pub fn new(lease_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            lease_ttl,
        }
    }

    /// Move expired leases back to the ready queue. Caller holds the lock.
    fn sweep(state: &mut QueueState) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = state
            .leased
            .iter()
            .filter(|(_, job)| job.expires_at <= now)
            .map(|(lease, _)| lease.clone())
            .collect();
        for lease in expired {
            if let Some(job) = state.leased.remove(&lease) {
                tracing::warn!(
                    task_id = job.message.task_id,
                    "queue: lease expired, redelivering job"
                );
                state.ready.push_back((job.message, true));
            }
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, message: JobMessage) -> Result<(), RanklabError> {
        let mut state = self.state.lock().await;
        state.ready.push_back((message, false));
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn claim(&self, wait: Duration) -> Result<Option<ClaimedJob>, RanklabError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                Self::sweep(&mut state);
                if let Some((message, redelivered)) = state.ready.pop_front() {
                    let lease = LeaseId::fresh();
                    state.leased.insert(
                        lease.clone(),
                        LeasedJob {
                            message: message.clone(),
                            expires_at: Instant::now() + self.lease_ttl,
                        },
                    );
                    return Ok(Some(ClaimedJob {
                        message,
                        lease,
                        redelivered,
                    }));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // Bounded wait: re-sweep at least this often so expired leases
            // are redelivered even with no enqueue traffic.
            let slice = remaining.min(self.lease_ttl).min(Duration::from_secs(1));
            let _ = tokio::time::timeout(slice, notified).await;
        }
    }

    async fn renew(&self, lease: &LeaseId) -> Result<(), RanklabError> {
        let mut state = self.state.lock().await;
        match state.leased.get_mut(lease) {
            Some(job) => {
                job.expires_at = Instant::now() + self.lease_ttl;
                Ok(())
            }
            None => Err(RanklabError::Conflict("lease no longer held".into())),
        }
    }

    async fn ack(&self, lease: &LeaseId) -> Result<(), RanklabError> {
        let mut state = self.state.lock().await;
        match state.leased.remove(lease) {
            Some(_) => Ok(()),
            None => Err(RanklabError::Conflict("lease no longer held".into())),
        }
    }

    async fn nack(&self, lease: &LeaseId, reason: &str) -> Result<(), RanklabError> {
        let mut state = self.state.lock().await;
        match state.leased.remove(lease) {
            Some(job) => {
                tracing::warn!(
                    task_id = job.message.task_id,
                    reason = reason,
                    "queue: job nacked, redelivering"
                );
                state.ready.push_back((job.message, true));
                drop(state);
                self.notify.notify_one();
                Ok(())
            }
            None => Err(RanklabError::Conflict("lease no longer held".into())),
        }
    }

    async fn drop_task(&self, task_id: &str) -> Result<bool, RanklabError> {
        let mut state = self.state.lock().await;
        let before = state.ready.len();
        state.ready.retain(|(message, _)| message.task_id != task_id);
        Ok(state.ready.len() < before)
    }

    async fn depth(&self) -> Result<usize, RanklabError> {
        let state = self.state.lock().await;
        Ok(state.ready.len() + state.leased.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(ttl_ms: u64) -> InMemoryQueue {
        InMemoryQueue::new(Duration::from_millis(ttl_ms))
    }

    #[tokio::test]
    async fn enqueue_claim_ack() {
        let q = queue(10_000);
        q.enqueue(JobMessage::new("t1", "fp1")).await.unwrap();

        let claimed = q.claim(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(claimed.message.task_id, "t1");
        assert!(!claimed.redelivered);
        assert_eq!(q.depth().await.unwrap(), 1);

        q.ack(&claimed.lease).await.unwrap();
        assert_eq!(q.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claim_times_out_empty() {
        let q = queue(10_000);
        let start = Instant::now();
        let claimed = q.claim(Duration::from_millis(50)).await.unwrap();
        assert!(claimed.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn claim_wakes_on_enqueue() {
        let q = std::sync::Arc::new(queue(10_000));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.claim(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.enqueue(JobMessage::new("t1", "fp1")).await.unwrap();
        let claimed = waiter.await.unwrap().unwrap();
        assert_eq!(claimed.unwrap().message.task_id, "t1");
    }

    #[tokio::test]
    async fn expired_lease_redelivers() {
        let q = queue(30);
        q.enqueue(JobMessage::new("t1", "fp1")).await.unwrap();

        let first = q.claim(Duration::from_millis(100)).await.unwrap().unwrap();
        assert!(!first.redelivered);

        // Let the lease lapse without renew or ack (worker death).
        tokio::time::sleep(Duration::from_millis(60)).await;

        let second = q.claim(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(second.message.task_id, "t1");
        assert!(second.redelivered);

        // The dead worker's lease is gone.
        assert!(q.ack(&first.lease).await.is_err());
        q.ack(&second.lease).await.unwrap();
        assert_eq!(q.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn renew_extends_lease() {
        let q = queue(50);
        q.enqueue(JobMessage::new("t1", "fp1")).await.unwrap();
        let claimed = q.claim(Duration::from_millis(100)).await.unwrap().unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            q.renew(&claimed.lease).await.unwrap();
        }

        // Well past the original ttl, still ours.
        let other = q.claim(Duration::from_millis(10)).await.unwrap();
        assert!(other.is_none(), "renewed job must not be redelivered");
        q.ack(&claimed.lease).await.unwrap();
    }

    #[tokio::test]
    async fn nack_redelivers() {
        let q = queue(10_000);
        q.enqueue(JobMessage::new("t1", "fp1")).await.unwrap();
        let claimed = q.claim(Duration::from_millis(100)).await.unwrap().unwrap();
        q.nack(&claimed.lease, "evaluator crashed").await.unwrap();

        let again = q.claim(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(again.message.task_id, "t1");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn drop_task_removes_queued_job() {
        let q = queue(10_000);
        q.enqueue(JobMessage::new("t1", "fp1")).await.unwrap();
        q.enqueue(JobMessage::new("t2", "fp2")).await.unwrap();

        assert!(q.drop_task("t1").await.unwrap());
        assert!(!q.drop_task("t1").await.unwrap(), "already dropped");

        let claimed = q.claim(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(claimed.message.task_id, "t2");
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let q = queue(10_000);
        for i in 0..3 {
            q.enqueue(JobMessage::new(format!("t{i}"), "fp")).await.unwrap();
        }
        for i in 0..3 {
            let claimed = q.claim(Duration::from_millis(100)).await.unwrap().unwrap();
            assert_eq!(claimed.message.task_id, format!("t{i}"));
        }
    }
}
