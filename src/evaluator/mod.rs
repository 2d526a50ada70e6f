//! The pluggable evaluation runtime seam.
//!
//! The orchestrator never calls model providers itself; it hands a redacted
//! plan, re-hydrated credentials, and result sinks to an [`Evaluator`].
//! Errors are classified retryable/fatal — the worker loop owns the retry
//! policy.

pub mod http;
pub mod scripted;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::plan::Plan;

/// Version stamped onto cache rows at aggregate time. Bump when scoring
/// semantics change so deployments can pin a minimum via
/// `RANKLAB_MIN_EVALUATOR_VERSION` and invalidate older rows.
pub const EVALUATOR_VERSION: u32 = 1;

/// One scored item, as emitted by an evaluator. The worker adds the task id,
/// fingerprint, and timestamp before persisting.
#[derive(Debug, Clone)]
pub struct EvalSample {
    pub model_name: String,
    pub sample_index: u32,
    pub prompt: String,
    pub answer: String,
    /// Correctness in [0, 1].
    pub correctness: f64,
    pub skill_label: Option<String>,
    pub target_label: Option<String>,
    pub subject_label: Option<String>,
    pub task_label: Option<String>,
    pub dataset_name: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalErrorKind {
    /// Transient (provider 429/5xx, network timeout). The worker retries.
    Retryable,
    /// Permanent (bad plan, auth failure). The worker fails the task.
    Fatal,
}

#[derive(Debug, Clone)]
pub struct EvalError {
    pub kind: EvalErrorKind,
    pub message: String,
}

impl EvalError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: EvalErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: EvalErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == EvalErrorKind::Retryable
    }
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            EvalErrorKind::Retryable => write!(f, "retryable: {}", self.message),
            EvalErrorKind::Fatal => write!(f, "fatal: {}", self.message),
        }
    }
}

impl std::error::Error for EvalError {}

/// Sinks handed to the evaluator. Samples stream into the result store in
/// batches; progress updates are rate-limited by the worker.
pub struct EvalSink {
    samples: mpsc::Sender<EvalSample>,
    progress: mpsc::Sender<u8>,
}

impl EvalSink {
    pub fn new(samples: mpsc::Sender<EvalSample>, progress: mpsc::Sender<u8>) -> Self {
        Self { samples, progress }
    }

    /// Emit one scored sample. A closed receiver means the worker has moved
    /// on (cancel or deadline); the evaluator should stop soon after.
    pub async fn emit(&self, sample: EvalSample) -> bool {
        self.samples.send(sample).await.is_ok()
    }

    /// Report overall progress, 0..=100.
    pub async fn progress(&self, percent: u8) {
        let _ = self.progress.send(percent.min(100)).await;
    }
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Run the plan to completion, streaming samples into the sink.
    /// `credentials` maps model name → credential for models that carried
    /// one. Implementations must observe `cancel` at their next natural
    /// boundary (between provider calls at the latest).
    async fn evaluate(
        &self,
        plan: &Plan,
        credentials: &HashMap<String, String>,
        sink: EvalSink,
        cancel: CancellationToken,
    ) -> Result<(), EvalError>;

    /// Liveness for `/health`. Defaults to available.
    fn available(&self) -> bool {
        true
    }
}
