//! Append-only store of per-sample outcomes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Store, StoreError, worker::DbCommand};

/// One scored item produced during a task. Write-once per
/// `(task_id, model_name, sample_index)`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SampleRow {
    pub task_id: String,
    pub model_name: String,
    pub sample_index: u32,
    pub fingerprint: String,
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
    pub ts: i64,
}

/// Mean correctness for one model within one task.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelAggregate {
    pub model_name: String,
    pub score: f64,
    pub sample_count: u64,
}

#[derive(Clone)]
pub struct SampleStore {
    store: Arc<Store>,
}

impl SampleStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Atomic batch insert. A row whose `(task_id, model_name, sample_index)`
    /// already exists is silently discarded, so re-runs after a lost lease
    /// deduplicate by construction. Returns the number of rows actually
    /// inserted.
    pub async fn append(&self, rows: Vec<SampleRow>) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.store
            .call(|reply| DbCommand::AppendSamples { rows, reply })
            .await
    }

    /// Mean correctness grouped by model for one task.
    pub async fn aggregate_task(&self, task_id: &str) -> Result<Vec<ModelAggregate>, StoreError> {
        let task_id = task_id.to_string();
        self.store
            .call(|reply| DbCommand::AggregateTask { task_id, reply })
            .await
    }

    /// Mean correctness grouped by model across every task that ran under
    /// a fingerprint (re-runs dedup on the primary key first).
    pub async fn aggregate_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Vec<ModelAggregate>, StoreError> {
        let fingerprint = fingerprint.to_string();
        self.store
            .call(|reply| DbCommand::AggregateByFingerprint { fingerprint, reply })
            .await
    }

    /// Total persisted samples for a task, across models.
    pub async fn task_sample_count(&self, task_id: &str) -> Result<u64, StoreError> {
        let task_id = task_id.to_string();
        self.store
            .call(|reply| DbCommand::TaskSampleCount { task_id, reply })
            .await
    }
}
