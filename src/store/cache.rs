//! Leaderboard cache index: fingerprint → aggregate rows, with TTL
//! staleness and reversible quarantine.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Store, StoreError, worker::DbCommand};
use crate::task::{AggregateRow, epoch_ms};

/// One persisted aggregate row.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheRow {
    pub row_id: String,
    pub fingerprint: String,
    pub model_name: String,
    pub language: String,
    pub subject_type: String,
    pub task_type: String,
    pub score: f64,
    pub sample_count: u64,
    pub last_updated: i64,
    pub quarantined: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine_reason: Option<String>,
    pub source_task_id: String,
    pub evaluator_version: u32,
}

impl CacheRow {
    pub fn to_aggregate(&self) -> AggregateRow {
        AggregateRow {
            model_name: self.model_name.clone(),
            language: self.language.clone(),
            subject_type: self.subject_type.clone(),
            task_type: self.task_type.clone(),
            score: self.score,
            sample_count: self.sample_count,
        }
    }
}

/// Result of a cache lookup for a fingerprint.
#[derive(Debug)]
pub enum CacheLookup {
    /// All returned rows are within the TTL.
    Fresh(Vec<CacheRow>),
    /// Rows exist but every one is past the TTL.
    Stale(Vec<CacheRow>),
    Miss,
}

/// Filters for leaderboard browsing (`GET /leaderboard`).
#[derive(Debug, Clone, Default)]
pub struct BrowseFilter {
    pub language: Option<String>,
    pub subject_type: Option<String>,
    pub task_type: Option<String>,
    /// Case-insensitive substring match on model name.
    pub model_name: Option<String>,
    pub score_min: Option<f64>,
    pub score_max: Option<f64>,
    pub updated_after: Option<i64>,
    /// Admin-scoped callers only.
    pub include_quarantined: bool,
    pub limit: u32,
    pub offset: u32,
}

/// Outcome of an admin mutation over explicit row ids.
#[derive(Debug, Clone, Serialize)]
pub struct AdminOutcome {
    pub affected: usize,
    /// Row ids that matched nothing.
    pub missing: Vec<String>,
}

#[derive(Clone)]
pub struct CacheIndex {
    store: Arc<Store>,
    ttl: Duration,
    min_evaluator_version: u32,
}

impl CacheIndex {
    pub fn new(store: Arc<Store>, ttl: Duration, min_evaluator_version: u32) -> Self {
        Self {
            store,
            ttl,
            min_evaluator_version,
        }
    }

    /// Look up non-quarantined rows for a fingerprint and classify them.
    /// A row is stale when it is past the TTL or was produced by an
    /// evaluator older than the pinned minimum. Mixed ages count as fresh
    /// if at least one row is fresh; the dispatcher works model-by-model on
    /// the fresh subset.
    pub async fn lookup(&self, fingerprint: &str) -> Result<CacheLookup, StoreError> {
        let rows = self.raw_lookup(fingerprint, false).await?;
        if rows.is_empty() {
            return Ok(CacheLookup::Miss);
        }
        let cutoff = epoch_ms() - self.ttl.as_millis() as i64;
        let fresh = |r: &CacheRow| {
            r.last_updated >= cutoff && r.evaluator_version >= self.min_evaluator_version
        };
        if rows.iter().any(fresh) {
            Ok(CacheLookup::Fresh(rows.into_iter().filter(fresh).collect()))
        } else {
            Ok(CacheLookup::Stale(rows))
        }
    }

    /// All rows for a fingerprint, optionally including quarantined ones.
    /// No TTL filtering.
    pub async fn raw_lookup(
        &self,
        fingerprint: &str,
        include_quarantined: bool,
    ) -> Result<Vec<CacheRow>, StoreError> {
        let fingerprint = fingerprint.to_string();
        self.store
            .call(|reply| DbCommand::LookupCache {
                fingerprint,
                include_quarantined,
                reply,
            })
            .await
    }

    /// Derive aggregate rows from the task's samples and write them
    /// atomically, bumping `last_updated` and recording the source task.
    /// Quarantine state of an overwritten row is preserved.
    pub async fn upsert_from_task(&self, task_id: &str) -> Result<Vec<CacheRow>, StoreError> {
        let task_id = task_id.to_string();
        self.store
            .call(|reply| DbCommand::UpsertAggregates {
                task_id,
                rekey: None,
                reply,
            })
            .await
    }

    /// Write one model's rows under its singleton-plan fingerprint, so a
    /// later plan that shares this model can reuse them (partial cache hit).
    pub async fn upsert_model_rekeyed(
        &self,
        task_id: &str,
        model_name: &str,
        singleton_fingerprint: &str,
    ) -> Result<Vec<CacheRow>, StoreError> {
        let task_id = task_id.to_string();
        let rekey = Some((singleton_fingerprint.to_string(), model_name.to_string()));
        self.store
            .call(|reply| DbCommand::UpsertAggregates { task_id, rekey, reply })
            .await
    }

    pub async fn browse(&self, filter: BrowseFilter) -> Result<Vec<CacheRow>, StoreError> {
        self.store
            .call(|reply| DbCommand::BrowseCache { filter, reply })
            .await
    }

    pub async fn quarantine(
        &self,
        row_ids: Vec<String>,
        reason: Option<String>,
    ) -> Result<AdminOutcome, StoreError> {
        self.store
            .call(|reply| DbCommand::SetQuarantine {
                row_ids,
                quarantined: true,
                reason,
                reply,
            })
            .await
    }

    pub async fn restore(&self, row_ids: Vec<String>) -> Result<AdminOutcome, StoreError> {
        self.store
            .call(|reply| DbCommand::SetQuarantine {
                row_ids,
                quarantined: false,
                reason: None,
                reply,
            })
            .await
    }

    pub async fn hard_delete(&self, row_ids: Vec<String>) -> Result<AdminOutcome, StoreError> {
        self.store
            .call(|reply| DbCommand::HardDeleteRows { row_ids, reply })
            .await
    }
}
