use thiserror::Error;

#[derive(Debug, Error)]
pub enum RanklabError {
    #[error("plan validation failed: {0}")]
    Validation(String),

    #[error("evaluation already in flight for this fingerprint (task {task_id})")]
    DuplicateInFlight { fingerprint: String, task_id: String },

    #[error("credentials for task {task_id} missing or expired")]
    CredentialsMissing { task_id: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("evaluator error (retryable): {0}")]
    EvaluatorRetryable(String),

    #[error("evaluator error (fatal): {0}")]
    EvaluatorFatal(String),

    #[error("task exceeded max duration of {max_secs}s")]
    Timeout { max_secs: u64 },

    #[error("task {0} cancelled")]
    Cancelled(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl RanklabError {
    /// Stable snake_case identifier for the wire form (`error.kind` in task
    /// records and API responses).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::DuplicateInFlight { .. } => "duplicate_fingerprint_in_flight",
            Self::CredentialsMissing { .. } => "credentials_missing",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::QueueUnavailable(_) => "queue_unavailable",
            Self::EvaluatorRetryable(_) => "evaluator_retryable",
            Self::EvaluatorFatal(_) => "evaluator_fatal",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
        }
    }

    /// Produce a sanitized message safe for API clients. Never leaks
    /// credentials, connection strings, or internal paths.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => format!("plan validation failed: {msg}"),
            Self::DuplicateInFlight { task_id, .. } => {
                format!("an identical evaluation is already running (task {task_id})")
            }
            Self::CredentialsMissing { .. } => {
                "provider credentials expired before the evaluation ran — resubmit the plan"
                    .to_string()
            }
            Self::StorageUnavailable(_) => "result storage is unavailable".to_string(),
            Self::QueueUnavailable(_) => "evaluation queue is unavailable".to_string(),
            Self::EvaluatorRetryable(msg) | Self::EvaluatorFatal(msg) => {
                format!("evaluation failed: {msg}")
            }
            Self::Timeout { max_secs } => {
                format!("evaluation exceeded the {max_secs}s task duration limit")
            }
            Self::Cancelled(_) => "evaluation was cancelled".to_string(),
            Self::Conflict(msg) => format!("conflict: {msg}"),
            Self::NotFound(what) => format!("not found: {what}"),
        }
    }
}
