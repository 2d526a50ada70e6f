//! The store actor: one thread, one DuckDB connection, typed commands.
//!
//! Single-threaded execution is load-bearing — `CreateTask`'s
//! unique-in-flight-fingerprint check and insert are atomic because nothing
//! else touches the connection.

use std::sync::mpsc;

use duckdb::types::Value as SqlValue;
use serde::Serialize;

use super::StoreError;
use super::cache::{AdminOutcome, BrowseFilter, CacheRow};
use super::samples::{ModelAggregate, SampleRow};
use super::schema::cache_row_id;
use super::tasks::TaskFilter;
use crate::evaluator::EVALUATOR_VERSION;
use crate::plan::Plan;
use crate::task::{
    CleanupReport, CleanupResource, CleanupSpec, Task, TaskPatch, TaskStatus, epoch_ms,
};

type Reply<T> = tokio::sync::oneshot::Sender<Result<T, StoreError>>;

const TASK_COLS: &str = "task_id, fingerprint, status, job, created_at, started_at, \
                         completed_at, progress, plan_snapshot, result, error, revision";

const CACHE_COLS: &str = "row_id, fingerprint, model_name, language, subject_type, task_type, \
                          score, sample_count, last_updated, quarantined, quarantine_reason, \
                          source_task_id, evaluator_version";

/// Window for the "recent task duration" stat.
const RECENT_WINDOW_MS: i64 = 24 * 3600 * 1000;

pub(crate) enum DbCommand {
    CreateTask { task: Box<Task>, reply: Reply<()> },
    GetTask { task_id: String, reply: Reply<Task> },
    FindInFlight { fingerprint: String, reply: Reply<Option<Task>> },
    Transition {
        task_id: String,
        allowed_from: Vec<TaskStatus>,
        to: TaskStatus,
        patch: TaskPatch,
        reply: Reply<Task>,
    },
    Progress { task_id: String, progress: u8, reply: Reply<Task> },
    Reclaim { task_id: String, reply: Reply<Task> },
    ListTasks { filter: TaskFilter, reply: Reply<Vec<Task>> },
    AppendSamples { rows: Vec<SampleRow>, reply: Reply<usize> },
    AggregateTask { task_id: String, reply: Reply<Vec<ModelAggregate>> },
    AggregateByFingerprint { fingerprint: String, reply: Reply<Vec<ModelAggregate>> },
    TaskSampleCount { task_id: String, reply: Reply<u64> },
    UpsertAggregates {
        task_id: String,
        /// When set, write only the named model's rows, keyed under the
        /// given fingerprint (the model's singleton-plan fingerprint).
        /// Enables partial cache reuse across overlapping model sets.
        rekey: Option<(String, String)>,
        reply: Reply<Vec<CacheRow>>,
    },
    LookupCache {
        fingerprint: String,
        include_quarantined: bool,
        reply: Reply<Vec<CacheRow>>,
    },
    BrowseCache { filter: BrowseFilter, reply: Reply<Vec<CacheRow>> },
    SetQuarantine {
        row_ids: Vec<String>,
        quarantined: bool,
        reason: Option<String>,
        reply: Reply<AdminOutcome>,
    },
    HardDeleteRows { row_ids: Vec<String>, reply: Reply<AdminOutcome> },
    Cleanup { spec: CleanupSpec, reply: Reply<CleanupReport> },
    Ping { reply: Reply<()> },
    Stats { reply: Reply<StoreStats> },
    Shutdown,
}

/// Aggregate counters for `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub status_counts: Vec<(TaskStatus, u64)>,
    pub cache_rows: u64,
    pub median_recent_task_ms: Option<f64>,
}

pub(crate) fn run(rx: mpsc::Receiver<DbCommand>, conn: duckdb::Connection) {
    loop {
        match rx.recv() {
            Ok(DbCommand::CreateTask { task, reply }) => {
                let _ = reply.send(create_task(&conn, &task));
            }
            Ok(DbCommand::GetTask { task_id, reply }) => {
                let _ = reply.send(read_task(&conn, &task_id));
            }
            Ok(DbCommand::FindInFlight { fingerprint, reply }) => {
                let _ = reply.send(find_in_flight(&conn, &fingerprint));
            }
            Ok(DbCommand::Transition { task_id, allowed_from, to, patch, reply }) => {
                let _ = reply.send(transition(&conn, &task_id, &allowed_from, to, patch));
            }
            Ok(DbCommand::Progress { task_id, progress, reply }) => {
                let _ = reply.send(write_progress(&conn, &task_id, progress));
            }
            Ok(DbCommand::Reclaim { task_id, reply }) => {
                let _ = reply.send(reclaim(&conn, &task_id));
            }
            Ok(DbCommand::ListTasks { filter, reply }) => {
                let _ = reply.send(list_tasks(&conn, &filter));
            }
            Ok(DbCommand::AppendSamples { rows, reply }) => {
                let _ = reply.send(append_samples(&conn, &rows));
            }
            Ok(DbCommand::AggregateTask { task_id, reply }) => {
                let _ = reply.send(aggregate_task(&conn, &task_id));
            }
            Ok(DbCommand::AggregateByFingerprint { fingerprint, reply }) => {
                let _ = reply.send(aggregate_by_fingerprint(&conn, &fingerprint));
            }
            Ok(DbCommand::TaskSampleCount { task_id, reply }) => {
                let _ = reply.send(task_sample_count(&conn, &task_id));
            }
            Ok(DbCommand::UpsertAggregates { task_id, rekey, reply }) => {
                let _ = reply.send(upsert_aggregates(&conn, &task_id, rekey.as_ref()));
            }
            Ok(DbCommand::LookupCache { fingerprint, include_quarantined, reply }) => {
                let _ = reply.send(lookup_cache(&conn, &fingerprint, include_quarantined));
            }
            Ok(DbCommand::BrowseCache { filter, reply }) => {
                let _ = reply.send(browse_cache(&conn, &filter));
            }
            Ok(DbCommand::SetQuarantine { row_ids, quarantined, reason, reply }) => {
                let _ = reply.send(set_quarantine(&conn, &row_ids, quarantined, reason.as_deref()));
            }
            Ok(DbCommand::HardDeleteRows { row_ids, reply }) => {
                let _ = reply.send(hard_delete_rows(&conn, &row_ids));
            }
            Ok(DbCommand::Cleanup { spec, reply }) => {
                let _ = reply.send(cleanup(&conn, &spec));
            }
            Ok(DbCommand::Ping { reply }) => {
                let _ = reply.send(
                    conn.execute_batch("SELECT 1")
                        .map_err(StoreError::Duckdb),
                );
            }
            Ok(DbCommand::Stats { reply }) => {
                let _ = reply.send(stats(&conn));
            }
            Ok(DbCommand::Shutdown) => {
                tracing::debug!("store: worker shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("store: channel closed, worker exiting");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

fn create_task(conn: &duckdb::Connection, task: &Task) -> Result<(), StoreError> {
    if let Some(existing) = find_in_flight(conn, &task.fingerprint)? {
        return Err(StoreError::DuplicateFingerprint {
            task_id: existing.task_id,
        });
    }

    conn.execute(
        "INSERT INTO tasks (task_id, fingerprint, status, job, created_at, started_at, \
         completed_at, progress, plan_snapshot, result, error, revision) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        duckdb::params![
            task.task_id,
            task.fingerprint,
            task.status.as_str(),
            task.job.as_str(),
            task.created_at,
            task.started_at,
            task.completed_at,
            i32::from(task.progress),
            task.plan_snapshot.to_string(),
            task.result
                .as_ref()
                .map(|r| serde_json::to_string(r).unwrap_or_default()),
            task.error
                .as_ref()
                .map(|e| serde_json::to_string(e).unwrap_or_default()),
            task.revision as i64,
        ],
    )?;
    Ok(())
}

fn read_task(conn: &duckdb::Connection, task_id: &str) -> Result<Task, StoreError> {
    let sql = format!("SELECT {TASK_COLS} FROM tasks WHERE task_id = ?");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(duckdb::params![task_id])?;
    match rows.next()? {
        Some(row) => task_from_row(row),
        None => Err(StoreError::NotFound(format!("task {task_id}"))),
    }
}

fn find_in_flight(
    conn: &duckdb::Connection,
    fingerprint: &str,
) -> Result<Option<Task>, StoreError> {
    let sql = format!(
        "SELECT {TASK_COLS} FROM tasks \
         WHERE fingerprint = ? AND status IN ('PENDING', 'STARTED') \
         ORDER BY created_at ASC LIMIT 1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(duckdb::params![fingerprint])?;
    match rows.next()? {
        Some(row) => Ok(Some(task_from_row(row)?)),
        None => Ok(None),
    }
}

fn transition(
    conn: &duckdb::Connection,
    task_id: &str,
    allowed_from: &[TaskStatus],
    to: TaskStatus,
    patch: TaskPatch,
) -> Result<Task, StoreError> {
    let task = read_task(conn, task_id)?;

    if !allowed_from.contains(&task.status) || !task.status.can_transition(to) {
        return Err(StoreError::InvalidTransition {
            task_id: task_id.to_string(),
            from: task.status,
            to,
        });
    }

    let now = epoch_ms();
    let started_at = if to == TaskStatus::Started {
        task.started_at.or(Some(now))
    } else {
        task.started_at
    };
    let completed_at = if to.is_terminal() {
        Some(now)
    } else {
        task.completed_at
    };
    let progress = match (to, patch.progress) {
        (TaskStatus::Success, _) => 100,
        (_, Some(p)) => p.min(100),
        (_, None) => task.progress,
    };
    let result_json = patch
        .result
        .as_ref()
        .map(|r| serde_json::to_string(r).unwrap_or_default())
        .or_else(|| task.result.as_ref().map(|r| serde_json::to_string(r).unwrap_or_default()));
    let error_json = patch
        .error
        .as_ref()
        .map(|e| serde_json::to_string(e).unwrap_or_default())
        .or_else(|| task.error.as_ref().map(|e| serde_json::to_string(e).unwrap_or_default()));

    conn.execute(
        "UPDATE tasks SET status = ?, started_at = ?, completed_at = ?, progress = ?, \
         result = ?, error = ?, revision = revision + 1 WHERE task_id = ?",
        duckdb::params![
            to.as_str(),
            started_at,
            completed_at,
            i32::from(progress),
            result_json,
            error_json,
            task_id,
        ],
    )?;

    read_task(conn, task_id)
}

fn write_progress(
    conn: &duckdb::Connection,
    task_id: &str,
    progress: u8,
) -> Result<Task, StoreError> {
    let task = read_task(conn, task_id)?;
    if task.status != TaskStatus::Started {
        return Err(StoreError::InvalidTransition {
            task_id: task_id.to_string(),
            from: task.status,
            to: TaskStatus::Started,
        });
    }
    // Progress is monotone within a run; late out-of-order writes are folded.
    let mut progress = progress.min(100);
    if progress < task.progress {
        progress = task.progress;
    }
    conn.execute(
        "UPDATE tasks SET progress = ?, revision = revision + 1 WHERE task_id = ?",
        duckdb::params![i32::from(progress), task_id],
    )?;
    read_task(conn, task_id)
}

fn reclaim(conn: &duckdb::Connection, task_id: &str) -> Result<Task, StoreError> {
    let task = read_task(conn, task_id)?;
    if task.status.is_terminal() {
        return Ok(task);
    }
    conn.execute(
        "UPDATE tasks SET status = 'PENDING', started_at = NULL, progress = 0, \
         revision = revision + 1 WHERE task_id = ?",
        duckdb::params![task_id],
    )?;
    read_task(conn, task_id)
}

fn list_tasks(conn: &duckdb::Connection, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
    let mut sql = format!("SELECT {TASK_COLS} FROM tasks WHERE 1=1");
    let mut values: Vec<SqlValue> = Vec::new();
    if let Some(status) = filter.status {
        sql.push_str(" AND status = ?");
        values.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(job) = filter.job {
        sql.push_str(" AND job = ?");
        values.push(SqlValue::Text(job.as_str().to_string()));
    }
    if let Some(ref fingerprint) = filter.fingerprint {
        sql.push_str(" AND fingerprint = ?");
        values.push(SqlValue::Text(fingerprint.clone()));
    }
    let limit = effective_limit(filter.limit);
    sql.push_str(&format!(
        " ORDER BY created_at DESC LIMIT {limit} OFFSET {}",
        filter.offset
    ));

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(duckdb::params_from_iter(values))?;
    let mut tasks = Vec::new();
    while let Some(row) = rows.next()? {
        tasks.push(task_from_row(row)?);
    }
    Ok(tasks)
}

fn task_from_row(row: &duckdb::Row<'_>) -> Result<Task, StoreError> {
    let status_raw: String = row.get(2)?;
    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown task status {status_raw:?}")))?;
    let job_raw: String = row.get(3)?;
    let job = crate::task::JobKind::parse(&job_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown job kind {job_raw:?}")))?;
    let snapshot_raw: String = row.get(8)?;
    let plan_snapshot = serde_json::from_str(&snapshot_raw)
        .map_err(|e| StoreError::Corrupt(format!("plan_snapshot: {e}")))?;
    let result_raw: Option<String> = row.get(9)?;
    let result = match result_raw {
        Some(raw) => Some(
            serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(format!("result: {e}")))?,
        ),
        None => None,
    };
    let error_raw: Option<String> = row.get(10)?;
    let error = match error_raw {
        Some(raw) => Some(
            serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(format!("error: {e}")))?,
        ),
        None => None,
    };
    let progress: i32 = row.get(7)?;
    let revision: i64 = row.get(11)?;

    Ok(Task {
        task_id: row.get(0)?,
        fingerprint: row.get(1)?,
        status,
        job,
        created_at: row.get(4)?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        progress: progress.clamp(0, 100) as u8,
        plan_snapshot,
        result,
        error,
        revision: revision.max(0) as u64,
    })
}

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

fn append_samples(conn: &duckdb::Connection, rows: &[SampleRow]) -> Result<usize, StoreError> {
    conn.execute_batch("BEGIN TRANSACTION")?;
    let result = (|| -> Result<usize, StoreError> {
        let mut stmt = conn.prepare(
            "INSERT INTO samples (task_id, model_name, sample_index, fingerprint, prompt, \
             answer, correctness, skill_label, target_label, subject_label, task_label, \
             dataset_name, metadata, ts) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (task_id, model_name, sample_index) DO NOTHING",
        )?;
        let mut inserted = 0usize;
        for sample in rows {
            inserted += stmt.execute(duckdb::params![
                sample.task_id,
                sample.model_name,
                sample.sample_index as i64,
                sample.fingerprint,
                sample.prompt,
                sample.answer,
                sample.correctness.clamp(0.0, 1.0),
                sample.skill_label,
                sample.target_label,
                sample.subject_label,
                sample.task_label,
                sample.dataset_name,
                sample.metadata.as_ref().map(|m| m.to_string()),
                sample.ts,
            ])?;
        }
        Ok(inserted)
    })();

    match result {
        Ok(inserted) => {
            conn.execute_batch("COMMIT")?;
            Ok(inserted)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

fn aggregate_task(
    conn: &duckdb::Connection,
    task_id: &str,
) -> Result<Vec<ModelAggregate>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT model_name, AVG(correctness), COUNT(*) FROM samples \
         WHERE task_id = ? GROUP BY model_name ORDER BY model_name",
    )?;
    let mut rows = stmt.query(duckdb::params![task_id])?;
    let mut aggregates = Vec::new();
    while let Some(row) = rows.next()? {
        let sample_count: i64 = row.get(2)?;
        aggregates.push(ModelAggregate {
            model_name: row.get(0)?,
            score: row.get(1)?,
            sample_count: sample_count.max(0) as u64,
        });
    }
    Ok(aggregates)
}

fn aggregate_by_fingerprint(
    conn: &duckdb::Connection,
    fingerprint: &str,
) -> Result<Vec<ModelAggregate>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT model_name, AVG(correctness), COUNT(*) FROM samples \
         WHERE fingerprint = ? GROUP BY model_name ORDER BY model_name",
    )?;
    let mut rows = stmt.query(duckdb::params![fingerprint])?;
    let mut aggregates = Vec::new();
    while let Some(row) = rows.next()? {
        let sample_count: i64 = row.get(2)?;
        aggregates.push(ModelAggregate {
            model_name: row.get(0)?,
            score: row.get(1)?,
            sample_count: sample_count.max(0) as u64,
        });
    }
    Ok(aggregates)
}

fn task_sample_count(conn: &duckdb::Connection, task_id: &str) -> Result<u64, StoreError> {
    let mut stmt = conn.prepare("SELECT COUNT(*) FROM samples WHERE task_id = ?")?;
    let count: i64 = stmt.query_row(duckdb::params![task_id], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

// ---------------------------------------------------------------------------
// Leaderboard cache
// ---------------------------------------------------------------------------

fn upsert_aggregates(
    conn: &duckdb::Connection,
    task_id: &str,
    rekey: Option<&(String, String)>,
) -> Result<Vec<CacheRow>, StoreError> {
    let task = read_task(conn, task_id)?;
    let (fingerprint, only_model) = match rekey {
        Some((fp, model)) => (fp.clone(), Some(model.as_str())),
        None => (task.fingerprint.clone(), None),
    };
    let plan: Plan = serde_json::from_value(task.plan_snapshot.clone())
        .map_err(|e| StoreError::Corrupt(format!("plan_snapshot: {e}")))?;
    let language = plan.profile.language.trim().to_lowercase();
    let default_subject = plan
        .profile
        .subject_types
        .first()
        .cloned()
        .unwrap_or_default();
    let default_task_type = plan.profile.task_type.as_str().to_string();

    // Group samples by (model, subject slice, task slice); NULL labels fall
    // back to the plan profile.
    let mut stmt = conn.prepare(
        "SELECT model_name, COALESCE(subject_label, ''), COALESCE(task_label, ''), \
         AVG(correctness), COUNT(*) \
         FROM samples WHERE task_id = ? GROUP BY 1, 2, 3 ORDER BY 1, 2, 3",
    )?;
    let mut grouped = Vec::new();
    {
        let mut rows = stmt.query(duckdb::params![task_id])?;
        while let Some(row) = rows.next()? {
            let model_name: String = row.get(0)?;
            if let Some(only) = only_model
                && model_name != only
            {
                continue;
            }
            let subject_raw: String = row.get(1)?;
            let task_raw: String = row.get(2)?;
            let score: f64 = row.get(3)?;
            let count: i64 = row.get(4)?;
            grouped.push((model_name, subject_raw, task_raw, score, count.max(0) as u64));
        }
    }

    let now = epoch_ms();
    conn.execute_batch("BEGIN TRANSACTION")?;
    let result = (|| -> Result<Vec<CacheRow>, StoreError> {
        let mut written = Vec::new();
        for (model_name, subject_raw, task_raw, score, sample_count) in grouped {
            let subject_type = if subject_raw.is_empty() {
                default_subject.clone()
            } else {
                subject_raw
            };
            let task_type = if task_raw.is_empty() {
                default_task_type.clone()
            } else {
                task_raw
            };
            let row_id = cache_row_id(
                &fingerprint,
                &model_name,
                &language,
                &subject_type,
                &task_type,
            );

            // Preserve quarantine state across overwrites; moderation
            // actions survive re-evaluation.
            let mut existing_stmt = conn.prepare(
                "SELECT quarantined, quarantine_reason FROM leaderboard_cache WHERE row_id = ?",
            )?;
            let mut existing = existing_stmt.query(duckdb::params![row_id])?;
            let (quarantined, quarantine_reason): (bool, Option<String>) =
                match existing.next()? {
                    Some(row) => (row.get(0)?, row.get(1)?),
                    None => (false, None),
                };

            conn.execute(
                "DELETE FROM leaderboard_cache WHERE row_id = ?",
                duckdb::params![row_id],
            )?;
            conn.execute(
                "INSERT INTO leaderboard_cache (row_id, fingerprint, model_name, language, \
                 subject_type, task_type, score, sample_count, last_updated, quarantined, \
                 quarantine_reason, source_task_id, evaluator_version) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                duckdb::params![
                    row_id,
                    fingerprint,
                    model_name,
                    language,
                    subject_type,
                    task_type,
                    score,
                    sample_count as i64,
                    now,
                    quarantined,
                    quarantine_reason,
                    task.task_id,
                    EVALUATOR_VERSION as i32,
                ],
            )?;

            written.push(CacheRow {
                row_id,
                fingerprint: fingerprint.clone(),
                model_name,
                language: language.clone(),
                subject_type,
                task_type,
                score,
                sample_count,
                last_updated: now,
                quarantined,
                quarantine_reason,
                source_task_id: task.task_id.clone(),
                evaluator_version: EVALUATOR_VERSION,
            });
        }
        Ok(written)
    })();

    match result {
        Ok(rows) => {
            conn.execute_batch("COMMIT")?;
            Ok(rows)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

fn lookup_cache(
    conn: &duckdb::Connection,
    fingerprint: &str,
    include_quarantined: bool,
) -> Result<Vec<CacheRow>, StoreError> {
    let mut sql = format!("SELECT {CACHE_COLS} FROM leaderboard_cache WHERE fingerprint = ?");
    if !include_quarantined {
        sql.push_str(" AND NOT quarantined");
    }
    sql.push_str(" ORDER BY model_name");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(duckdb::params![fingerprint])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(cache_row_from_row(row)?);
    }
    Ok(out)
}

fn browse_cache(
    conn: &duckdb::Connection,
    filter: &BrowseFilter,
) -> Result<Vec<CacheRow>, StoreError> {
    let mut sql = format!("SELECT {CACHE_COLS} FROM leaderboard_cache WHERE 1=1");
    let mut values: Vec<SqlValue> = Vec::new();
    if !filter.include_quarantined {
        sql.push_str(" AND NOT quarantined");
    }
    if let Some(ref language) = filter.language {
        sql.push_str(" AND language = ?");
        values.push(SqlValue::Text(language.trim().to_lowercase()));
    }
    if let Some(ref subject) = filter.subject_type {
        sql.push_str(" AND subject_type = ?");
        values.push(SqlValue::Text(subject.clone()));
    }
    if let Some(ref task_type) = filter.task_type {
        sql.push_str(" AND task_type = ?");
        values.push(SqlValue::Text(task_type.clone()));
    }
    if let Some(ref model) = filter.model_name {
        // Literal substring match: LIKE metacharacters in the caller's
        // value must not act as wildcards.
        sql.push_str(" AND model_name ILIKE ? ESCAPE '\\'");
        values.push(SqlValue::Text(format!("%{}%", escape_like(model))));
    }
    if let Some(score_min) = filter.score_min {
        sql.push_str(" AND score >= ?");
        values.push(SqlValue::Double(score_min));
    }
    if let Some(score_max) = filter.score_max {
        sql.push_str(" AND score <= ?");
        values.push(SqlValue::Double(score_max));
    }
    if let Some(updated_after) = filter.updated_after {
        sql.push_str(" AND last_updated > ?");
        values.push(SqlValue::BigInt(updated_after));
    }
    let limit = effective_limit(filter.limit);
    sql.push_str(&format!(
        " ORDER BY score DESC, model_name ASC LIMIT {limit} OFFSET {}",
        filter.offset
    ));

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(duckdb::params_from_iter(values))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(cache_row_from_row(row)?);
    }
    Ok(out)
}

fn set_quarantine(
    conn: &duckdb::Connection,
    row_ids: &[String],
    quarantined: bool,
    reason: Option<&str>,
) -> Result<AdminOutcome, StoreError> {
    let reason = if quarantined { reason } else { None };
    let mut affected = 0usize;
    let mut missing = Vec::new();
    for row_id in row_ids {
        let changed = conn.execute(
            "UPDATE leaderboard_cache SET quarantined = ?, quarantine_reason = ? \
             WHERE row_id = ?",
            duckdb::params![quarantined, reason, row_id],
        )?;
        if changed == 0 {
            missing.push(row_id.clone());
        } else {
            affected += changed;
        }
    }
    Ok(AdminOutcome { affected, missing })
}

fn hard_delete_rows(
    conn: &duckdb::Connection,
    row_ids: &[String],
) -> Result<AdminOutcome, StoreError> {
    let mut affected = 0usize;
    let mut missing = Vec::new();
    for row_id in row_ids {
        let changed = conn.execute(
            "DELETE FROM leaderboard_cache WHERE row_id = ?",
            duckdb::params![row_id],
        )?;
        if changed == 0 {
            missing.push(row_id.clone());
        } else {
            affected += changed;
        }
    }
    Ok(AdminOutcome { affected, missing })
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

fn cleanup(conn: &duckdb::Connection, spec: &CleanupSpec) -> Result<CleanupReport, StoreError> {
    let cutoff = epoch_ms() - i64::from(spec.days_old) * 86_400_000;
    let limit = spec.limit.max(1);
    let mut report = CleanupReport {
        dry_run: spec.dry_run,
        tasks_affected: 0,
        samples_affected: 0,
        cache_affected: 0,
    };

    for resource in &spec.resources {
        match resource {
            CleanupResource::Tasks => {
                let predicate = format!(
                    "status IN ('SUCCESS', 'FAILURE', 'CANCELLED') AND completed_at < {cutoff}"
                );
                report.tasks_affected = if spec.dry_run {
                    count_capped(conn, "tasks", &predicate, limit)?
                } else {
                    conn.execute(
                        &format!(
                            "DELETE FROM tasks WHERE task_id IN \
                             (SELECT task_id FROM tasks WHERE {predicate} \
                              ORDER BY completed_at ASC LIMIT {limit})"
                        ),
                        [],
                    )? as u64
                };
            }
            CleanupResource::Samples => {
                let predicate = format!("ts < {cutoff}");
                report.samples_affected = if spec.dry_run {
                    count_capped(conn, "samples", &predicate, limit)?
                } else {
                    conn.execute(
                        &format!(
                            "DELETE FROM samples WHERE task_id IN \
                             (SELECT DISTINCT task_id FROM samples WHERE {predicate} \
                              LIMIT {limit})"
                        ),
                        [],
                    )? as u64
                };
            }
            CleanupResource::Cache => {
                let predicate = format!("last_updated < {cutoff}");
                report.cache_affected = if spec.dry_run {
                    count_capped(conn, "leaderboard_cache", &predicate, limit)?
                } else if spec.hard_delete {
                    conn.execute(
                        &format!(
                            "DELETE FROM leaderboard_cache WHERE row_id IN \
                             (SELECT row_id FROM leaderboard_cache WHERE {predicate} \
                              ORDER BY last_updated ASC LIMIT {limit})"
                        ),
                        [],
                    )? as u64
                } else {
                    // Soft path: quarantine instead of delete, reversible.
                    conn.execute(
                        &format!(
                            "UPDATE leaderboard_cache \
                             SET quarantined = TRUE, quarantine_reason = 'cleanup' \
                             WHERE row_id IN \
                             (SELECT row_id FROM leaderboard_cache \
                              WHERE {predicate} AND NOT quarantined \
                              ORDER BY last_updated ASC LIMIT {limit})"
                        ),
                        [],
                    )? as u64
                };
            }
        }
    }

    Ok(report)
}

fn count_capped(
    conn: &duckdb::Connection,
    table: &str,
    predicate: &str,
    limit: u32,
) -> Result<u64, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT LEAST(COUNT(*), {limit}) FROM {table} WHERE {predicate}"
    ))?;
    let count: i64 = stmt.query_row([], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

fn stats(conn: &duckdb::Connection) -> Result<StoreStats, StoreError> {
    let mut status_counts = Vec::new();
    {
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            if let Some(status) = TaskStatus::parse(&raw) {
                status_counts.push((status, count.max(0) as u64));
            }
        }
    }

    let mut stmt = conn.prepare("SELECT COUNT(*) FROM leaderboard_cache")?;
    let cache_rows: i64 = stmt.query_row([], |row| row.get(0))?;

    let recent_cutoff = epoch_ms() - RECENT_WINDOW_MS;
    let mut stmt = conn.prepare(
        "SELECT CAST(median(completed_at - started_at) AS DOUBLE) FROM tasks \
         WHERE started_at IS NOT NULL AND completed_at IS NOT NULL AND completed_at > ?",
    )?;
    let median_recent_task_ms: Option<f64> =
        stmt.query_row(duckdb::params![recent_cutoff], |row| row.get(0))?;

    Ok(StoreStats {
        status_counts,
        cache_rows: cache_rows.max(0) as u64,
        median_recent_task_ms,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn cache_row_from_row(row: &duckdb::Row<'_>) -> Result<CacheRow, StoreError> {
    let sample_count: i64 = row.get(7)?;
    let evaluator_version: i32 = row.get(12)?;
    Ok(CacheRow {
        row_id: row.get(0)?,
        fingerprint: row.get(1)?,
        model_name: row.get(2)?,
        language: row.get(3)?,
        subject_type: row.get(4)?,
        task_type: row.get(5)?,
        score: row.get(6)?,
        sample_count: sample_count.max(0) as u64,
        last_updated: row.get(8)?,
        quarantined: row.get(9)?,
        quarantine_reason: row.get(10)?,
        source_task_id: row.get(11)?,
        evaluator_version: evaluator_version.max(0) as u32,
    })
}

fn effective_limit(limit: u32) -> u32 {
    if limit == 0 { 100 } else { limit.min(1000) }
}

/// Escape LIKE/ILIKE metacharacters so a filter value matches literally
/// inside a `%...%` pattern (paired with `ESCAPE '\'`).
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
