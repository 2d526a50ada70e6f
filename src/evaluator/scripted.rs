//! Deterministic in-process evaluator for tests and demos.
//!
//! Emits a scripted correctness sequence for every model in the plan, with
//! optional per-sample delay and failure injection. No network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{EvalError, EvalSample, EvalSink, Evaluator};
use crate::plan::Plan;

pub struct ScriptedEvaluator {
    /// Correctness values, cycled over sample indices.
    correctness: Vec<f64>,
    per_sample_delay: Duration,
    /// First N `evaluate` calls fail retryably before any sample is emitted.
    failures_remaining: AtomicU32,
    /// When set, every call fails fatally with this message.
    fatal: Option<String>,
    /// First call only: stop emitting after N samples and hang until
    /// cancelled. Models a worker crash for lease-expiry tests; the re-run
    /// after redelivery executes normally.
    stall_after: Option<u32>,
    stall_consumed: AtomicBool,
}

impl ScriptedEvaluator {
    pub fn new(correctness: Vec<f64>) -> Self {
        Self {
            correctness,
            per_sample_delay: Duration::ZERO,
            failures_remaining: AtomicU32::new(0),
            fatal: None,
            stall_after: None,
            stall_consumed: AtomicBool::new(false),
        }
    }

    /// Sleep this long before each sample (cancellation tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.per_sample_delay = delay;
        self
    }

    /// Fail the first `n` attempts with a retryable error.
    pub fn failing_attempts(self, n: u32) -> Self {
        self.failures_remaining.store(n, Ordering::Relaxed);
        self
    }

    /// Always fail fatally.
    pub fn with_fatal(mut self, message: impl Into<String>) -> Self {
        self.fatal = Some(message.into());
        self
    }

    /// First call only: emit `n` samples per model, then hang until
    /// cancelled.
    pub fn stalling_after(mut self, n: u32) -> Self {
        self.stall_after = Some(n);
        self
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(
        &self,
        plan: &Plan,
        _credentials: &HashMap<String, String>,
        sink: EvalSink,
        cancel: CancellationToken,
    ) -> Result<(), EvalError> {
        if let Some(ref message) = self.fatal {
            return Err(EvalError::fatal(message.clone()));
        }
        if self
            .failures_remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EvalError::retryable("scripted transient failure"));
        }

        let stall_this_run = self.stall_after.is_some()
            && !self.stall_consumed.swap(true, Ordering::Relaxed);

        let per_model = plan.profile.sample_size;
        let total = per_model as u64 * plan.models.len() as u64;
        let mut emitted = 0u64;

        for model in &plan.models {
            for index in 0..per_model {
                if cancel.is_cancelled() {
                    return Err(EvalError::fatal("cancelled"));
                }
                if stall_this_run
                    && let Some(stall) = self.stall_after
                    && index >= stall
                {
                    cancel.cancelled().await;
                    return Err(EvalError::fatal("cancelled"));
                }
                if !self.per_sample_delay.is_zero() {
                    tokio::time::sleep(self.per_sample_delay).await;
                }

                let correctness = self.correctness[index as usize % self.correctness.len()];
                let subject = plan.profile.subject_types.first().cloned();
                let delivered = sink
                    .emit(EvalSample {
                        model_name: model.name.clone(),
                        sample_index: index,
                        prompt: format!("scripted question #{index}"),
                        answer: format!("scripted answer #{index}"),
                        correctness,
                        skill_label: None,
                        target_label: Some(plan.profile.target_type.as_str().to_string()),
                        subject_label: subject,
                        task_label: Some(plan.profile.task_type.as_str().to_string()),
                        dataset_name: Some("scripted".to_string()),
                        metadata: None,
                    })
                    .await;
                if !delivered {
                    return Err(EvalError::fatal("sink closed"));
                }

                emitted += 1;
                if emitted % 5 == 0 || emitted == total {
                    sink.progress(((emitted * 100) / total.max(1)) as u8).await;
                }
            }
        }

        Ok(())
    }
}
